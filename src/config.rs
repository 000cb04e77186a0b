//! Pool configuration

use std::time::Duration;

use crate::error::{Error, Result};
use crate::session::SessionConfig;

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Name given to this pool, used in session names and alerts
    pub name: String,
    /// Settings handed to the session factory on every open
    pub session: SessionConfig,
    /// Minimum number of sessions the pool maintains
    pub min_size: usize,
    /// Maximum number of sessions the pool can grow to
    pub max_size: usize,
    /// Busy-session count at which a warning alert fires; defaults to
    /// `max_size - 1` when not set
    pub warning_size: Option<usize>,
    /// How long a borrower waits for a session when the pool is saturated
    pub wait_timeout: Duration,
    /// Idle time after which free sessions are trimmed
    pub max_inactive: Duration,
    /// Maximum session age; zero disables age-based trimming
    pub max_age: Duration,
    /// Minimum time between trim passes
    pub trim_interval: Duration,
    /// Interval between health monitor ticks; zero disables the monitor
    pub heartbeat_freq: Duration,
    /// Timeout applied to the liveness probe
    pub heartbeat_timeout: Duration,
    /// Probe statement; when `None` the vendor-level ping is used
    pub probe_sql: Option<String>,
    /// Busy time after which a session is considered leaked
    pub leak_timeout: Duration,
    /// Capture the borrower's call site on every acquire (can be expensive)
    pub capture_call_sites: bool,
    /// Maximum number of frames kept from a captured call site
    pub max_trace_frames: usize,
    /// Upper bound on the wait for busy sessions during shutdown
    pub shutdown_wait: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "tarn".into(),
            session: SessionConfig::default(),
            min_size: 0,
            max_size: 20,
            warning_size: None,
            wait_timeout: Duration::from_secs(1),
            max_inactive: Duration::from_secs(720),
            max_age: Duration::ZERO,
            trim_interval: Duration::from_secs(59),
            heartbeat_freq: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(3),
            probe_sql: None,
            leak_timeout: Duration::from_secs(30 * 60),
            capture_call_sites: false,
            max_trace_frames: 5,
            shutdown_wait: Duration::from_secs(10),
        }
    }
}

impl PoolConfig {
    /// Create pool config from a connection URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            session: SessionConfig::new(url),
            ..Default::default()
        }
    }

    /// Set the pool name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the credentials used to open sessions
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.session = self.session.with_credentials(username, password);
        self
    }

    /// Set minimum pool size
    pub fn with_min_size(mut self, size: usize) -> Self {
        self.min_size = size;
        self
    }

    /// Set maximum pool size
    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Set the warning size
    pub fn with_warning_size(mut self, size: usize) -> Self {
        self.warning_size = Some(size);
        self
    }

    /// Set the saturation wait timeout
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// Set the idle time after which free sessions are trimmed
    pub fn with_max_inactive(mut self, max_inactive: Duration) -> Self {
        self.max_inactive = max_inactive;
        self
    }

    /// Set the maximum session age (zero disables age trimming)
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Set the minimum time between trim passes
    pub fn with_trim_interval(mut self, interval: Duration) -> Self {
        self.trim_interval = interval;
        self
    }

    /// Set the health monitor interval (zero disables the monitor)
    pub fn with_heartbeat_freq(mut self, freq: Duration) -> Self {
        self.heartbeat_freq = freq;
        self
    }

    /// Set the liveness probe timeout
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Set the probe statement executed by the health monitor
    pub fn with_probe_sql(mut self, sql: impl Into<String>) -> Self {
        self.probe_sql = Some(sql.into());
        self
    }

    /// Set the busy time after which a session counts as leaked
    pub fn with_leak_timeout(mut self, timeout: Duration) -> Self {
        self.leak_timeout = timeout;
        self
    }

    /// Enable or disable call-site capture on acquire
    pub fn with_capture_call_sites(mut self, capture: bool) -> Self {
        self.capture_call_sites = capture;
        self
    }

    /// Set the maximum number of captured trace frames
    pub fn with_max_trace_frames(mut self, frames: usize) -> Self {
        self.max_trace_frames = frames;
        self
    }

    /// Set the per-session prepared-statement cache size
    pub fn with_pstmt_cache_size(mut self, size: usize) -> Self {
        self.session = self.session.with_pstmt_cache_size(size);
        self
    }

    /// Set the bound on the busy-session wait during shutdown
    pub fn with_shutdown_wait(mut self, wait: Duration) -> Self {
        self.shutdown_wait = wait;
        self
    }

    /// The effective warning size: the configured value, or `max_size - 1`.
    pub fn effective_warning_size(&self) -> usize {
        self.warning_size
            .unwrap_or_else(|| self.max_size.saturating_sub(1))
    }

    /// Check the configuration is usable; called at pool construction.
    pub fn validate(&self) -> Result<()> {
        self.session.validate()?;
        if self.max_size == 0 {
            return Err(Error::configuration("max_size must be at least 1"));
        }
        if self.min_size > self.max_size {
            return Err(Error::configuration(format!(
                "min_size {} exceeds max_size {}",
                self.min_size, self.max_size
            )));
        }
        if let Some(warning) = self.warning_size {
            if warning > self.max_size {
                return Err(Error::configuration(format!(
                    "warning_size {} exceeds max_size {}",
                    warning, self.max_size
                )));
            }
        }
        Ok(())
    }
}
