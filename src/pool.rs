//! The pool facade
//!
//! Owns the configuration, the session queue, the health monitor and the
//! notification bridge to the alert sink and pool listener.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::hooks::{AlertSink, NullAlertSink, NullPoolListener, PoolListener};
use crate::monitor::spawn_monitor;
use crate::pooled::{capture_call_site, PooledSession, SessionHandle};
use crate::queue::SessionQueue;
use crate::session::{Session, SessionFactory};
use crate::status::{PoolStatistics, PoolStatus};

struct HealthState {
    is_up: bool,
    down_reason: Option<String>,
    down_alert_sent: bool,
}

pub(crate) struct PoolInner {
    name: String,
    config: PoolConfig,
    capture_call_sites: AtomicBool,
    factory: Arc<dyn SessionFactory>,
    alert: Arc<dyn AlertSink>,
    listener: Arc<dyn PoolListener>,
    pub(crate) queue: SessionQueue,
    health: Mutex<HealthState>,
    in_warning: AtomicBool,
    last_trim: Mutex<Instant>,
    shutting_down: AtomicBool,
    monitor_token: CancellationToken,
    monitor_handle: Mutex<Option<JoinHandle<()>>>,
    self_ref: OnceLock<Weak<PoolInner>>,
}

impl PoolInner {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn pstmt_cache_size(&self) -> usize {
        self.config.session.pstmt_cache_size
    }

    /// Open a backend session with the pool's configured settings, driving
    /// the up/down transitions on the outcome.
    pub(crate) async fn open_session(&self) -> Result<Arc<dyn Session>> {
        match self.factory.open(&self.config.session).await {
            Ok(raw) => {
                self.transition_up();
                Ok(raw)
            }
            Err(err) => {
                let err = match err {
                    e @ Error::Backend { .. } => e,
                    other => Error::backend_with_source("failed to open backend session", other),
                };
                self.transition_down(&err);
                Err(err)
            }
        }
    }

    pub(crate) fn transition_down(&self, reason: &Error) {
        let (was_up, first_alert) = {
            let mut health = self.health.lock();
            let was_up = health.is_up;
            health.is_up = false;
            health.down_reason = Some(reason.to_string());
            let first = !health.down_alert_sent;
            health.down_alert_sent = true;
            (was_up, first)
        };
        if was_up {
            self.reset_with(self.config.leak_timeout);
        }
        if first_alert {
            error!("FATAL: session pool [{}] is down: {reason}", self.name);
            self.alert.on_down(&self.name);
        }
    }

    pub(crate) fn transition_up(&self) {
        let (send_alert, was_down) = {
            let mut health = self.health.lock();
            let send = health.down_alert_sent;
            // Cleared before notifying so an acquire from inside the alert
            // callback cannot re-fire the up event.
            health.down_alert_sent = false;
            let was_down = !health.is_up;
            health.is_up = true;
            health.down_reason = None;
            (send, was_down)
        };
        if send_alert {
            error!("RESOLVED: session pool [{}] is back up", self.name);
            self.alert.on_up(&self.name);
        } else if was_down {
            info!("session pool [{}] is back up", self.name);
        }
        if was_down {
            self.reset_with(self.config.leak_timeout);
        }
    }

    pub(crate) fn notify_warning(&self, message: String) {
        if !self.in_warning.swap(true, Ordering::SeqCst) {
            warn!("session pool [{}] warning: {message}", self.name);
            let subject = format!("session pool [{}] warning", self.name);
            self.alert.on_warning(&subject, &message);
        }
    }

    /// Return path used by [`SessionHandle`]. Queue bookkeeping happens
    /// synchronously; a force close also schedules a health check off this
    /// call path.
    pub(crate) fn release(&self, sess: Arc<PooledSession>, force_close: bool) {
        if !force_close {
            self.listener.before_release(&sess.info());
        }
        self.queue.release(self, sess, force_close);
        if force_close && !self.queue.is_closed() {
            self.spawn_health_check();
        }
    }

    fn spawn_health_check(&self) {
        let Some(inner) = self.self_ref.get().and_then(Weak::upgrade) else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                SessionPool { inner }.run_health_check().await;
            });
        }
    }

    pub(crate) fn trim_if_due(&self) {
        let due = {
            let mut last = self.last_trim.lock();
            if last.elapsed() >= self.config.trim_interval {
                *last = Instant::now();
                true
            } else {
                false
            }
        };
        if due {
            self.queue.trim(self.config.max_inactive, self.config.max_age);
        }
    }

    /// Close free sessions, reclaim leaks older than `leak_timeout` and
    /// clear the warning latch.
    fn reset_with(&self, leak_timeout: Duration) {
        let closed = self.queue.close_free();
        let reclaimed = self.queue.reclaim_leaked(leak_timeout);
        self.in_warning.store(false, Ordering::SeqCst);
        if closed > 0 || reclaimed > 0 {
            info!(
                "session pool [{}] reset: closed {closed} free, reclaimed {reclaimed} leaked",
                self.name
            );
        }
    }
}

/// Builder for a [`SessionPool`] with optional alert sink and listener.
pub struct PoolBuilder {
    config: PoolConfig,
    factory: Arc<dyn SessionFactory>,
    alert: Arc<dyn AlertSink>,
    listener: Arc<dyn PoolListener>,
}

impl PoolBuilder {
    /// Install an alert sink notified of down/up/warning edges.
    pub fn alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alert = sink;
        self
    }

    /// Install a listener observing borrows and returns.
    pub fn listener(mut self, listener: Arc<dyn PoolListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Validate the configuration, fill the pool to its minimum size and
    /// start the health monitor.
    pub async fn build(self) -> Result<SessionPool> {
        self.config.validate()?;
        let name = self.config.name.clone();
        info!(
            "session pool [{}] autocommit[{}] isolation[{}] min[{}] max[{}]",
            name,
            self.config.session.autocommit,
            self.config.session.isolation,
            self.config.min_size,
            self.config.max_size
        );

        let inner = Arc::new(PoolInner {
            queue: SessionQueue::new(&self.config),
            capture_call_sites: AtomicBool::new(self.config.capture_call_sites),
            name,
            config: self.config,
            factory: self.factory,
            alert: self.alert,
            listener: self.listener,
            health: Mutex::new(HealthState {
                is_up: true,
                down_reason: None,
                down_alert_sent: false,
            }),
            in_warning: AtomicBool::new(false),
            last_trim: Mutex::new(Instant::now()),
            shutting_down: AtomicBool::new(false),
            monitor_token: CancellationToken::new(),
            monitor_handle: Mutex::new(None),
            self_ref: OnceLock::new(),
        });
        let _ = inner.self_ref.set(Arc::downgrade(&inner));

        for _ in 0..inner.config.min_size {
            match inner.open_session().await {
                Ok(raw) => inner.queue.add_free(&inner, raw),
                Err(err) => {
                    error!(
                        "error filling session pool [{}] to its minimum size: {err}",
                        inner.name
                    );
                    break;
                }
            }
        }

        let pool = SessionPool { inner };
        if !pool.inner.config.heartbeat_freq.is_zero() {
            let handle = spawn_monitor(
                pool.clone(),
                pool.inner.config.heartbeat_freq,
                pool.inner.monitor_token.clone(),
            );
            *pool.inner.monitor_handle.lock() = Some(handle);
        }
        Ok(pool)
    }
}

/// A session pool.
///
/// Cheap to clone; all clones share the same underlying pool. Borrow with
/// [`acquire`](Self::acquire), observe with [`status`](Self::status) and
/// [`statistics`](Self::statistics), stop with
/// [`shutdown`](Self::shutdown).
#[derive(Clone)]
pub struct SessionPool {
    pub(crate) inner: Arc<PoolInner>,
}

impl SessionPool {
    /// Create a pool with no alert sink or listener installed.
    pub async fn new(config: PoolConfig, factory: Arc<dyn SessionFactory>) -> Result<Self> {
        Self::builder(config, factory).build().await
    }

    /// Start building a pool.
    pub fn builder(config: PoolConfig, factory: Arc<dyn SessionFactory>) -> PoolBuilder {
        PoolBuilder {
            config,
            factory,
            alert: Arc::new(NullAlertSink),
            listener: Arc::new(NullPoolListener),
        }
    }

    /// The pool's name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Borrow a session from the pool.
    ///
    /// Grows the pool when every session is busy and the maximum has not
    /// been reached; otherwise blocks until a session is returned or the
    /// wait timeout elapses.
    pub async fn acquire(&self) -> Result<SessionHandle> {
        let sess = self.inner.queue.acquire(&self.inner).await?;
        if self.inner.capture_call_sites.load(Ordering::Relaxed) {
            sess.set_trace(Some(capture_call_site(self.inner.config.max_trace_frames)));
        }
        self.inner.listener.after_acquire(&sess.info());
        Ok(SessionHandle::new(self.inner.clone(), sess))
    }

    /// Open a session that is not part of the pool, using the pool's
    /// configured credentials. Closing it closes it fully.
    pub async fn acquire_unpooled(&self) -> Result<Arc<dyn Session>> {
        self.inner.open_session().await
    }

    /// Open an un-pooled session with overridden credentials.
    pub async fn acquire_with_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Arc<dyn Session>> {
        self.inner
            .factory
            .open_with_credentials(&self.inner.config.session, username, password)
            .await
    }

    /// Snapshot the pool's sizes and counters. With `reset` the hit, wait
    /// and high-water-mark counters are cleared after the snapshot.
    pub fn status(&self, reset: bool) -> PoolStatus {
        self.inner.queue.status(reset)
    }

    /// Aggregated borrow-time statistics. With `reset` the accumulators are
    /// cleared after the snapshot.
    pub fn statistics(&self, reset: bool) -> PoolStatistics {
        self.inner.queue.statistics(reset)
    }

    /// Set a new minimum size.
    pub fn set_min_size(&self, size: usize) {
        self.inner.queue.set_min_size(size);
    }

    /// Set a new maximum size, effective immediately. Busy sessions above
    /// the new maximum are destroyed as they return.
    pub fn set_max_size(&self, size: usize) {
        self.inner.queue.set_max_size(size);
    }

    /// Set a new warning size.
    pub fn set_warning_size(&self, size: usize) {
        self.inner.queue.set_warning_size(size);
    }

    /// Whether the backend is currently reachable.
    pub fn is_up(&self) -> bool {
        self.inner.health.lock().is_up
    }

    /// The rendered failure that took the pool down, when it is down.
    pub fn down_reason(&self) -> Option<String> {
        self.inner.health.lock().down_reason.clone()
    }

    /// Close free sessions, clear the warning latch and reclaim sessions
    /// that have been busy past the configured leak timeout.
    pub fn reset(&self) {
        self.inner.reset_with(self.inner.config.leak_timeout);
    }

    /// A report of the busy sessions: name, age, last use and the captured
    /// borrow site when call-site capture is on.
    pub fn busy_report(&self) -> String {
        self.inner.queue.busy_report()
    }

    /// Write the busy report to the log.
    pub fn log_busy_report(&self) {
        info!("{}", self.busy_report());
    }

    /// Send a probe message through the alert sink, to verify it is wired
    /// up correctly.
    pub fn test_alert(&self) {
        let subject = format!("Test session pool [{}]", self.inner.name);
        self.inner
            .alert
            .on_warning(&subject, "Testing that alerts reach their sink");
    }

    /// Toggle call-site capture on acquire.
    pub fn set_capture_call_sites(&self, capture: bool) {
        self.inner
            .capture_call_sites
            .store(capture, Ordering::Relaxed);
    }

    /// Shut the pool down: stop the health monitor, close free sessions,
    /// wait (bounded) for busy sessions to return, then force-close the
    /// rest. With `release_factory_resources` the factory is asked to drop
    /// any process-wide driver state. Idempotent.
    pub async fn shutdown(&self, release_factory_resources: bool) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.monitor_token.cancel();
        self.inner.queue.begin_shutdown();
        let monitor = self.inner.monitor_handle.lock().take();
        if let Some(handle) = monitor {
            let _ = handle.await;
        }

        let deadline = Instant::now() + self.inner.config.shutdown_wait;
        while self.inner.queue.busy_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let leftover = self.inner.queue.busy_count();
        if leftover > 0 {
            warn!(
                "shutting down session pool [{}] with {leftover} sessions still busy",
                self.inner.name
            );
            self.inner.queue.reclaim_leaked(Duration::ZERO);
        }
        if release_factory_resources {
            self.inner.factory.release_resources().await;
        }
        info!("session pool [{}] shut down", self.inner.name);
    }

    pub(crate) async fn run_health_check(&self) {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        self.inner.trim_if_due();
        match self.acquire().await {
            Ok(handle) => {
                match self.probe(&handle).await {
                    Ok(()) => self.inner.transition_up(),
                    Err(err) => {
                        handle.mark_defunct();
                        self.inner.transition_down(&err);
                    }
                }
                drop(handle);
            }
            Err(Error::PoolClosed) => {}
            Err(err) => self.inner.transition_down(&err),
        }
    }

    async fn probe(&self, handle: &SessionHandle) -> Result<()> {
        let timeout = self.inner.config.heartbeat_timeout;
        let raw = handle
            .underlying()
            .ok_or_else(|| Error::internal("probe handle has no session"))?;
        match &self.inner.config.probe_sql {
            None => {
                if raw.ping(timeout).await {
                    Ok(())
                } else {
                    Err(Error::backend("liveness ping failed"))
                }
            }
            Some(sql) => tokio::time::timeout(timeout, async {
                raw.execute(sql).await?;
                raw.commit().await
            })
            .await
            .map_err(|_| Error::backend(format!("probe `{sql}` timed out")))?,
        }
    }
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool")
            .field("name", &self.inner.name)
            .field("status", &self.status(false))
            .finish()
    }
}
