//! Pooled session wrapper and the borrower-facing handle

use parking_lot::Mutex;
use std::backtrace::Backtrace;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::hooks::SessionInfo;
use crate::pool::PoolInner;
use crate::session::{Session, Statement};
use crate::statement::{StatementCache, StatementKey};

/// Lifecycle state of a pooled session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum SessionState {
    Idle = 0,
    Borrowed = 1,
    Closed = 2,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Idle,
            1 => Self::Borrowed,
            _ => Self::Closed,
        }
    }
}

/// A backend session owned by the pool.
///
/// Fresh sessions start in the `Borrowed` state: creation always happens on
/// behalf of the caller that triggered growth. The initial fill resets them
/// to idle explicitly.
pub(crate) struct PooledSession {
    id: u64,
    name: String,
    session: Arc<dyn Session>,
    created_at: Instant,
    state: AtomicU8,
    last_used: Mutex<Instant>,
    borrowed_at: Mutex<Instant>,
    defunct: AtomicBool,
    long_running: AtomicBool,
    trace: Mutex<Option<String>>,
    schema: Mutex<Option<String>>,
    statements: Mutex<StatementCache>,
}

impl PooledSession {
    pub(crate) fn new(
        id: u64,
        pool_name: &str,
        session: Arc<dyn Session>,
        pstmt_cache_size: usize,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            name: format!("{pool_name}.{id}"),
            session,
            created_at: now,
            state: AtomicU8::new(SessionState::Borrowed as u8),
            last_used: Mutex::new(now),
            borrowed_at: Mutex::new(now),
            defunct: AtomicBool::new(false),
            long_running: AtomicBool::new(false),
            trace: Mutex::new(None),
            schema: Mutex::new(None),
            statements: Mutex::new(StatementCache::new(pstmt_cache_size)),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    pub(crate) fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since the session was last touched by a borrower or the pool.
    pub(crate) fn idle_elapsed(&self) -> Duration {
        self.last_used.lock().elapsed()
    }

    /// Microseconds the current (or just-ended) borrow has held the session.
    pub(crate) fn busy_micros(&self) -> u64 {
        self.borrowed_at.lock().elapsed().as_micros() as u64
    }

    pub(crate) fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    /// Prepare the session for a new borrower.
    pub(crate) fn reset_for_use(&self) {
        let now = Instant::now();
        *self.borrowed_at.lock() = now;
        *self.last_used.lock() = now;
        self.state
            .store(SessionState::Borrowed as u8, Ordering::Release);
    }

    pub(crate) fn mark_idle(&self) {
        self.touch();
        self.state.store(SessionState::Idle as u8, Ordering::Release);
    }

    pub(crate) fn mark_closed(&self) {
        self.state
            .store(SessionState::Closed as u8, Ordering::Release);
        self.statements.lock().clear();
    }

    pub(crate) fn is_defunct(&self) -> bool {
        self.defunct.load(Ordering::Acquire)
    }

    pub(crate) fn set_defunct(&self) {
        self.defunct.store(true, Ordering::Release);
    }

    pub(crate) fn is_long_running(&self) -> bool {
        self.long_running.load(Ordering::Acquire)
    }

    pub(crate) fn set_long_running(&self, long_running: bool) {
        self.long_running.store(long_running, Ordering::Release);
    }

    pub(crate) fn set_trace(&self, trace: Option<String>) {
        *self.trace.lock() = trace;
    }

    pub(crate) fn trace(&self) -> Option<String> {
        self.trace.lock().clone()
    }

    pub(crate) fn schema(&self) -> Option<String> {
        self.schema.lock().clone()
    }

    fn set_schema_context(&self, schema: &str) {
        *self.schema.lock() = Some(schema.to_string());
    }

    pub(crate) fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            name: self.name.clone(),
        }
    }

    /// One-line description for busy reports and leak diagnostics.
    pub(crate) fn describe(&self) -> String {
        let mut line = format!(
            "{} state[{:?}] age[{}ms] lastUsed[{}ms ago]",
            self.name,
            self.state(),
            self.age().as_millis(),
            self.idle_elapsed().as_millis()
        );
        if let Some(trace) = self.trace() {
            line.push_str("\n  borrowed at:\n");
            line.push_str(&trace);
        }
        line
    }
}

/// Capture the caller's stack, keeping at most `max_frames` frames.
pub(crate) fn capture_call_site(max_frames: usize) -> String {
    let raw = Backtrace::force_capture().to_string();
    let mut out = String::new();
    let mut frames = 0usize;
    for line in raw.lines() {
        let trimmed = line.trim_start();
        let is_frame_header = trimmed
            .split_once(": ")
            .map(|(idx, _)| idx.chars().all(|c| c.is_ascii_digit()))
            .unwrap_or(false);
        if is_frame_header {
            frames += 1;
            if frames > max_frames {
                break;
            }
        }
        if frames > 0 {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

/// A session borrowed from the pool.
///
/// Dropping the handle returns the session to the pool; it never destroys
/// the backend session directly. Operations run through the handle keep the
/// session's last-used time fresh and mark the session for force-close when
/// a connection-fatal error occurs.
pub struct SessionHandle {
    pool: Arc<PoolInner>,
    entry: Option<Arc<PooledSession>>,
}

impl SessionHandle {
    pub(crate) fn new(pool: Arc<PoolInner>, entry: Arc<PooledSession>) -> Self {
        Self {
            pool,
            entry: Some(entry),
        }
    }

    fn guard(&self) -> Result<&Arc<PooledSession>> {
        let sess = self
            .entry
            .as_ref()
            .ok_or_else(|| Error::internal("session already returned"))?;
        if sess.is_defunct() {
            return Err(Error::session_invalid(format!(
                "{} was reclaimed or failed validation",
                sess.name()
            )));
        }
        Ok(sess)
    }

    fn note_outcome<T>(sess: &PooledSession, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.is_session_fatal() {
                sess.set_defunct();
            }
        }
        result
    }

    /// The pool-assigned session id.
    pub fn id(&self) -> u64 {
        self.entry.as_ref().map(|s| s.id()).unwrap_or(0)
    }

    /// The session's display name, `"<pool>.<id>"`.
    pub fn name(&self) -> &str {
        self.entry.as_ref().map(|s| s.name()).unwrap_or("")
    }

    /// Execute a statement, discarding any result rows.
    pub async fn execute(&self, sql: &str) -> Result<()> {
        let sess = self.guard()?;
        sess.touch();
        Self::note_outcome(sess, sess.session().execute(sql).await)
    }

    /// Commit the current transaction.
    pub async fn commit(&self) -> Result<()> {
        let sess = self.guard()?;
        sess.touch();
        Self::note_outcome(sess, sess.session().commit().await)
    }

    /// Prepare a statement, consulting the per-session cache first.
    ///
    /// Statements are cached under the active schema context, so the same
    /// SQL prepared before and after a schema switch yields distinct
    /// artifacts.
    pub async fn prepare(&self, sql: &str) -> Result<Arc<dyn Statement>> {
        let sess = self.guard()?;
        sess.touch();
        let key = StatementKey {
            schema: sess.schema(),
            sql: sql.to_string(),
        };
        if let Some(hit) = sess.statements.lock().get(&key) {
            return Ok(hit);
        }
        let stmt = Self::note_outcome(sess, sess.session().prepare(sql).await)?;
        sess.statements.lock().put(key, stmt.clone());
        Ok(stmt)
    }

    /// Switch the active schema for this session.
    pub async fn set_schema(&self, schema: &str) -> Result<()> {
        let sess = self.guard()?;
        sess.touch();
        Self::note_outcome(sess, sess.session().set_schema(schema).await)?;
        sess.set_schema_context(schema);
        Ok(())
    }

    /// Exempt this session from leak reclamation while the flag is set.
    ///
    /// Use for legitimately long borrows that would otherwise trip the leak
    /// detector.
    pub fn set_long_running(&self, long_running: bool) {
        if let Some(sess) = self.entry.as_ref() {
            sess.set_long_running(long_running);
        }
    }

    /// The raw backend session underneath this handle.
    pub fn underlying(&self) -> Option<Arc<dyn Session>> {
        self.entry.as_ref().map(|s| s.session().clone())
    }

    pub(crate) fn mark_defunct(&self) {
        if let Some(sess) = self.entry.as_ref() {
            sess.set_defunct();
        }
    }

    /// Return the session to the pool. Equivalent to dropping the handle.
    pub fn close(self) {}
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Some(sess) = self.entry.take() {
            let force = sess.is_defunct();
            self.pool.release(sess, force);
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("name", &self.name())
            .finish()
    }
}
