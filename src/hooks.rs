//! Alert and listener capabilities consumed by the pool
//!
//! Both are optional; the pool installs no-op defaults so call sites never
//! need to check for absence.

/// Identifying details of a pooled session, handed to listener hooks.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Pool-assigned session id
    pub id: u64,
    /// Display name, `"<pool>.<id>"`
    pub name: String,
}

/// Receives notifications when the pool changes health state.
///
/// `on_down` and `on_up` fire at most once per state edge. `on_warning` is
/// latched: after the first warning no more are sent until the pool is reset.
pub trait AlertSink: Send + Sync {
    /// The pool has lost its backend.
    fn on_down(&self, pool_name: &str);

    /// The pool's backend has recovered.
    fn on_up(&self, pool_name: &str);

    /// The pool has grown past its warning size.
    fn on_warning(&self, subject: &str, message: &str);
}

/// Observes sessions as they move in and out of the pool.
pub trait PoolListener: Send + Sync {
    /// Runs synchronously after a session is borrowed, before the borrower
    /// receives it.
    fn after_acquire(&self, session: &SessionInfo);

    /// Runs synchronously before a session returns to the free list.
    /// Not called on force-close returns.
    fn before_release(&self, session: &SessionInfo);
}

pub(crate) struct NullAlertSink;

impl AlertSink for NullAlertSink {
    fn on_down(&self, _pool_name: &str) {}
    fn on_up(&self, _pool_name: &str) {}
    fn on_warning(&self, _subject: &str, _message: &str) {}
}

pub(crate) struct NullPoolListener;

impl PoolListener for NullPoolListener {
    fn after_acquire(&self, _session: &SessionInfo) {}
    fn before_release(&self, _session: &SessionInfo) {}
}
