//! # tarn
//!
//! A robust database session pool.
//!
//! - **Bounded growth**: grows on demand up to a maximum, blocks borrowers
//!   FIFO with a deadline when saturated, hands returned sessions directly
//!   to the oldest waiter
//! - **Self-maintaining**: a periodic health monitor trims idle and aged
//!   sessions and probes backend liveness
//! - **Outage aware**: notifies an alert sink exactly once per down/up edge
//!   and recovers automatically
//! - **Leak detection**: sessions borrowed past a configurable threshold are
//!   reclaimed, with the borrow site captured when enabled
//! - **Statement caching**: per-session prepared-statement cache keyed by
//!   the active schema context
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tarn::prelude::*;
//!
//! let config = PoolConfig::new("postgres://localhost/app")
//!     .with_credentials("app", "secret")
//!     .with_min_size(2)
//!     .with_max_size(10);
//!
//! let pool = SessionPool::builder(config, factory)
//!     .alert_sink(alerts)
//!     .build()
//!     .await?;
//!
//! let session = pool.acquire().await?;
//! session.execute("insert into audit (event) values ('started')").await?;
//! // The session returns to the pool when dropped.
//! ```
//!
//! The pool consumes a [`SessionFactory`](session::SessionFactory) to open
//! backend sessions; driver crates implement [`Session`](session::Session)
//! and [`Statement`](session::Statement) on top of their vendor protocol.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod hooks;
pub mod pool;
pub mod session;
pub mod status;

mod monitor;
mod pooled;
mod queue;
mod statement;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::PoolConfig;
    pub use crate::error::{Error, ErrorCategory, Result};
    pub use crate::hooks::{AlertSink, PoolListener, SessionInfo};
    pub use crate::pool::{PoolBuilder, SessionPool};
    pub use crate::pooled::SessionHandle;
    pub use crate::session::{
        IsolationLevel, Session, SessionConfig, SessionFactory, Statement,
    };
    pub use crate::status::{PoolStatistics, PoolStatus};
}

pub use error::{Error, Result};
pub use pool::SessionPool;
pub use pooled::SessionHandle;
