//! Error types for tarn
//!
//! Provides granular error classification for pool state handling:
//! - Backend errors drive the pool's up/down transitions
//! - Session-fatal errors force-close the session on return
//! - Timeout errors carry diagnostics for leak hunting

use std::fmt;
use thiserror::Error;

use crate::status::PoolStatus;

/// Result type for tarn operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Construction-time configuration errors (fatal)
    Configuration,
    /// Backend outage: failed open or failed probe
    Backend,
    /// Waiter deadline exceeded (non-fatal to the pool)
    Timeout,
    /// Pool has been shut down
    PoolClosed,
    /// Operation declined by the facade or factory
    Unsupported,
    /// Session failed validation or was reclaimed
    SessionInvalid,
    /// Unknown/other errors
    Other,
}

impl ErrorCategory {
    /// Whether errors in this category mark the session for force-close
    /// when it is returned to the pool.
    #[inline]
    pub const fn is_session_fatal(self) -> bool {
        matches!(self, Self::Backend | Self::SessionInvalid)
    }
}

/// Main error type for tarn
#[derive(Error, Debug)]
pub enum Error {
    /// Missing credentials or nonsensical limits; raised at construction
    #[error("configuration error: {message}")]
    Configuration {
        /// What was wrong with the configuration
        message: String,
    },

    /// Failure to open a session or a failed liveness probe
    #[error("backend down: {message}")]
    Backend {
        /// Description of the failure
        message: String,
        /// The underlying driver error, when available
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// No session became available within the wait timeout
    #[error("timed out waiting for a session after {waited_ms}ms: {status}")]
    Timeout {
        /// How long the borrower waited, in milliseconds
        waited_ms: u64,
        /// Size snapshot taken when the deadline elapsed
        status: PoolStatus,
        /// Summary of the busy sessions, to aid leak diagnosis
        busy_report: String,
    },

    /// Acquire was called after shutdown started
    #[error("pool is shut down")]
    PoolClosed,

    /// Operation declined (e.g. credential override without factory support)
    #[error("unsupported: {message}")]
    Unsupported {
        /// Which operation was declined
        message: String,
    },

    /// The session failed validation or was reclaimed as a leak
    #[error("session invalid: {message}")]
    SessionInvalid {
        /// Why the session is no longer usable
        message: String,
    },

    /// Internal error
    #[error("internal error: {message}")]
    Internal {
        /// Description of the failure
        message: String,
    },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::Backend { .. } => ErrorCategory::Backend,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::PoolClosed => ErrorCategory::PoolClosed,
            Self::Unsupported { .. } => ErrorCategory::Unsupported,
            Self::SessionInvalid { .. } => ErrorCategory::SessionInvalid,
            Self::Internal { .. } => ErrorCategory::Other,
        }
    }

    /// Whether this error marks the session it occurred on for force-close
    #[inline]
    pub fn is_session_fatal(&self) -> bool {
        self.category().is_session_fatal()
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a backend error
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            source: None,
        }
    }

    /// Create a backend error with the underlying driver error attached
    pub fn backend_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an unsupported-operation error
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Create a session-invalid error
    pub fn session_invalid(message: impl Into<String>) -> Self {
        Self::SessionInvalid {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Backend => write!(f, "backend"),
            Self::Timeout => write!(f, "timeout"),
            Self::PoolClosed => write!(f, "pool_closed"),
            Self::Unsupported => write!(f, "unsupported"),
            Self::SessionInvalid => write!(f, "session_invalid"),
            Self::Other => write!(f, "other"),
        }
    }
}
