//! The session queue: free/busy collections, blocked borrowers, growth and
//! trim rules
//!
//! All bookkeeping lives under a single mutex that is never held across an
//! await point. Session creation and backend close calls run outside the
//! lock; blocked borrowers park on per-waiter oneshot channels so a release
//! wakes exactly one of them, in FIFO order.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::pool::PoolInner;
use crate::pooled::PooledSession;
use crate::session::Session;
use crate::status::{PoolStatistics, PoolStatus};

/// Close a backend session without blocking the caller.
pub(crate) fn spawn_close(session: Arc<dyn Session>, name: String) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            if let Err(err) = session.close().await {
                debug!("error closing backend session {name}: {err}");
            }
        });
    }
}

/// What a parked borrower is woken with.
enum WaiterSignal {
    /// A session already marked borrowed on the waiter's behalf.
    Handoff(Arc<PooledSession>),
    /// Capacity became available; re-run the admission protocol.
    Retry,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<WaiterSignal>,
}

#[derive(Default)]
struct BorrowStats {
    count: u64,
    total_micros: u64,
    hwm_micros: u64,
}

impl BorrowStats {
    fn record(&mut self, micros: u64) {
        self.count += 1;
        self.total_micros += micros;
        if micros > self.hwm_micros {
            self.hwm_micros = micros;
        }
    }
}

struct QueueState {
    /// Idle sessions; the most recently returned sits at the end and is
    /// taken first, so cold sessions age toward the front for trimming.
    free: Vec<Arc<PooledSession>>,
    busy: HashMap<u64, Arc<PooledSession>>,
    waiters: VecDeque<Waiter>,
    /// Slots reserved by in-flight factory opens; counted against max_size.
    pending_creates: usize,
    min_size: usize,
    max_size: usize,
    warning_size: usize,
    wait_timeout: Duration,
    max_age: Duration,
    hit_count: u64,
    wait_count: u64,
    high_water_mark: usize,
    created_count: u64,
    destroyed_count: u64,
    stats: BorrowStats,
    next_session_id: u64,
    next_waiter_id: u64,
    closed: bool,
}

impl QueueState {
    fn total(&self) -> usize {
        self.free.len() + self.busy.len() + self.pending_creates
    }

    fn bump_high_water_mark(&mut self) {
        if self.busy.len() > self.high_water_mark {
            self.high_water_mark = self.busy.len();
        }
    }

    /// Hand the session to the oldest live waiter. The session must
    /// currently be in no collection; on success it lands in busy.
    fn hand_off(&mut self, sess: &Arc<PooledSession>) -> bool {
        while let Some(waiter) = self.waiters.pop_front() {
            sess.reset_for_use();
            self.busy.insert(sess.id(), sess.clone());
            self.bump_high_water_mark();
            match waiter.tx.send(WaiterSignal::Handoff(sess.clone())) {
                Ok(()) => return true,
                Err(_) => {
                    // Waiter timed out between signal selection and send.
                    self.busy.remove(&sess.id());
                }
            }
        }
        false
    }

    /// Wake the oldest live waiter to retry admission.
    fn wake_retry(&mut self) {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.tx.send(WaiterSignal::Retry).is_ok() {
                return;
            }
        }
    }

    fn status(&self) -> PoolStatus {
        PoolStatus {
            min_size: self.min_size,
            max_size: self.max_size,
            free: self.free.len(),
            busy: self.busy.len(),
            waiting: self.waiters.len(),
            high_water_mark: self.high_water_mark,
            wait_count: self.wait_count,
            hit_count: self.hit_count,
        }
    }

    fn busy_report(&self) -> String {
        let mut lines: Vec<String> = self.busy.values().map(|s| s.describe()).collect();
        lines.sort();
        format!("busy[{}]\n{}", self.busy.len(), lines.join("\n"))
    }
}

/// The central pool data structure.
pub(crate) struct SessionQueue {
    state: Mutex<QueueState>,
}

impl SessionQueue {
    pub(crate) fn new(config: &PoolConfig) -> Self {
        Self {
            state: Mutex::new(QueueState {
                free: Vec::with_capacity(config.max_size),
                busy: HashMap::with_capacity(config.max_size),
                waiters: VecDeque::new(),
                pending_creates: 0,
                min_size: config.min_size,
                max_size: config.max_size,
                warning_size: config.effective_warning_size(),
                wait_timeout: config.wait_timeout,
                max_age: config.max_age,
                hit_count: 0,
                wait_count: 0,
                high_water_mark: 0,
                created_count: 0,
                destroyed_count: 0,
                stats: BorrowStats::default(),
                next_session_id: 1,
                next_waiter_id: 1,
                closed: false,
            }),
        }
    }

    /// Borrow a session: pop a free one, grow the pool, or park with a
    /// deadline until a returning borrower hands one over.
    pub(crate) async fn acquire(&self, pool: &PoolInner) -> Result<Arc<PooledSession>> {
        enum Plan {
            Ready(Arc<PooledSession>),
            Grow,
            Wait(oneshot::Receiver<WaiterSignal>, u64),
        }

        let wait_timeout = self.state.lock().wait_timeout;
        let deadline = tokio::time::Instant::now() + wait_timeout;
        let mut counted_hit = false;
        let mut counted_wait = false;
        let mut retried = false;

        loop {
            let plan = {
                let mut st = self.state.lock();
                if st.closed {
                    return Err(Error::PoolClosed);
                }
                if !counted_hit {
                    st.hit_count += 1;
                    counted_hit = true;
                }
                if let Some(sess) = st.free.pop() {
                    sess.reset_for_use();
                    st.busy.insert(sess.id(), sess.clone());
                    st.bump_high_water_mark();
                    Plan::Ready(sess)
                } else if st.total() < st.max_size {
                    st.pending_creates += 1;
                    Plan::Grow
                } else {
                    if !counted_wait {
                        st.wait_count += 1;
                        counted_wait = true;
                    }
                    let (tx, rx) = oneshot::channel();
                    let id = st.next_waiter_id;
                    st.next_waiter_id += 1;
                    let waiter = Waiter { id, tx };
                    if retried {
                        // A retried waiter keeps its place at the head.
                        st.waiters.push_front(waiter);
                    } else {
                        st.waiters.push_back(waiter);
                    }
                    Plan::Wait(rx, id)
                }
            };

            match plan {
                Plan::Ready(sess) => return Ok(sess),
                Plan::Grow => match pool.open_session().await {
                    Ok(raw) => {
                        let mut st = self.state.lock();
                        st.pending_creates -= 1;
                        if st.closed {
                            drop(st);
                            spawn_close(raw, "unplaced".into());
                            return Err(Error::PoolClosed);
                        }
                        let id = st.next_session_id;
                        st.next_session_id += 1;
                        let sess = Arc::new(PooledSession::new(
                            id,
                            pool.name(),
                            raw,
                            pool.pstmt_cache_size(),
                        ));
                        st.created_count += 1;
                        st.busy.insert(id, sess.clone());
                        st.bump_high_water_mark();
                        return Ok(sess);
                    }
                    Err(err) => {
                        let mut st = self.state.lock();
                        st.pending_creates -= 1;
                        if st.total() < st.max_size {
                            st.wake_retry();
                        }
                        return Err(err);
                    }
                },
                Plan::Wait(mut rx, waiter_id) => {
                    match tokio::time::timeout_at(deadline, &mut rx).await {
                        Ok(Ok(WaiterSignal::Handoff(sess))) => return Ok(sess),
                        Ok(Ok(WaiterSignal::Retry)) => {
                            retried = true;
                            continue;
                        }
                        // Sender dropped: the pool is shutting down. Loop to
                        // observe the closed flag.
                        Ok(Err(_)) => continue,
                        Err(_) => {
                            let (status, busy_report) = {
                                let mut st = self.state.lock();
                                st.waiters.retain(|w| w.id != waiter_id);
                                (st.status(), st.busy_report())
                            };
                            if let Ok(WaiterSignal::Handoff(sess)) = rx.try_recv() {
                                // A handoff fired between expiry and removal;
                                // accept the session and give it straight back.
                                self.release(pool, sess, false);
                            }
                            warn!(
                                "timed out after {}ms waiting for a session: {status}",
                                wait_timeout.as_millis()
                            );
                            return Err(Error::Timeout {
                                waited_ms: wait_timeout.as_millis() as u64,
                                status,
                                busy_report,
                            });
                        }
                    }
                }
            }
        }
    }

    /// Return a borrowed session to the pool.
    ///
    /// The session is destroyed instead of pooled when the return is a force
    /// close, the session is past its maximum age, the pool has shrunk below
    /// its current size, or shutdown has started. Otherwise the oldest
    /// waiter gets it directly, falling back to the free list.
    pub(crate) fn release(&self, pool: &PoolInner, sess: Arc<PooledSession>, force_close: bool) {
        let name = sess.name().to_string();
        let mut to_close: Option<Arc<dyn Session>> = None;
        let warn_size_hit;
        {
            let mut st = self.state.lock();
            if st.busy.remove(&sess.id()).is_none() {
                debug!("session {name} already returned, ignoring double close");
                return;
            }
            st.stats.record(sess.busy_micros());

            let too_old = !st.max_age.is_zero() && sess.age() > st.max_age;
            let over_capacity = st.total() >= st.max_size;
            if force_close || sess.is_defunct() || too_old || over_capacity || st.closed {
                sess.mark_closed();
                st.destroyed_count += 1;
                to_close = Some(sess.session().clone());
                if !st.closed && st.total() < st.max_size {
                    st.wake_retry();
                }
            } else if !st.hand_off(&sess) {
                sess.mark_idle();
                st.free.push(sess);
            }
            warn_size_hit = st.warning_size > 0 && st.busy.len() >= st.warning_size;
        }
        if let Some(raw) = to_close {
            spawn_close(raw, name);
        }
        if warn_size_hit {
            pool.notify_warning(format!(
                "session pool reached warning size: {}",
                self.status(false)
            ));
        }
    }

    /// Place a freshly opened session straight into the free list.
    /// Used by the initial fill.
    pub(crate) fn add_free(&self, pool: &PoolInner, raw: Arc<dyn Session>) {
        let mut st = self.state.lock();
        let id = st.next_session_id;
        st.next_session_id += 1;
        let sess = Arc::new(PooledSession::new(
            id,
            pool.name(),
            raw,
            pool.pstmt_cache_size(),
        ));
        sess.mark_idle();
        st.created_count += 1;
        st.free.push(sess);
    }

    /// Destroy free sessions that have been idle past `max_inactive`, or
    /// that are older than `max_age` when it is non-zero, while keeping the
    /// pool at least `min_size` big.
    pub(crate) fn trim(&self, max_inactive: Duration, max_age: Duration) {
        let mut doomed: Vec<Arc<PooledSession>> = Vec::new();
        {
            let mut st = self.state.lock();
            let mut removable = (st.free.len() + st.busy.len()).saturating_sub(st.min_size);
            let candidates = std::mem::take(&mut st.free);
            for sess in candidates {
                let expired = sess.idle_elapsed() > max_inactive
                    || (!max_age.is_zero() && sess.age() > max_age);
                if expired && removable > 0 {
                    removable -= 1;
                    sess.mark_closed();
                    st.destroyed_count += 1;
                    doomed.push(sess);
                } else {
                    st.free.push(sess);
                }
            }
        }
        if !doomed.is_empty() {
            debug!("trimmed {} idle sessions", doomed.len());
            for sess in doomed {
                spawn_close(sess.session().clone(), sess.name().to_string());
            }
        }
    }

    /// Force-close busy sessions that have not been used within
    /// `leak_timeout`. The borrower is not waited on; its next use fails.
    pub(crate) fn reclaim_leaked(&self, leak_timeout: Duration) -> usize {
        let reclaimed: Vec<Arc<PooledSession>> = {
            let mut st = self.state.lock();
            let ids: Vec<u64> = st
                .busy
                .values()
                .filter(|s| !s.is_long_running() && s.idle_elapsed() >= leak_timeout)
                .map(|s| s.id())
                .collect();
            let mut out = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(sess) = st.busy.remove(&id) {
                    sess.set_defunct();
                    sess.mark_closed();
                    st.destroyed_count += 1;
                    out.push(sess);
                }
            }
            for _ in 0..out.len() {
                if st.total() >= st.max_size {
                    break;
                }
                st.wake_retry();
            }
            out
        };
        for sess in &reclaimed {
            warn!("reclaimed leaked session: {}", sess.describe());
            spawn_close(sess.session().clone(), sess.name().to_string());
        }
        reclaimed.len()
    }

    /// Destroy every free session. Busy sessions are untouched; the excess
    /// over limits is handled when they return.
    pub(crate) fn close_free(&self) -> usize {
        let drained: Vec<Arc<PooledSession>> = {
            let mut st = self.state.lock();
            let drained: Vec<_> = st.free.drain(..).collect();
            st.destroyed_count += drained.len() as u64;
            for sess in &drained {
                sess.mark_closed();
            }
            drained
        };
        let count = drained.len();
        for sess in drained {
            spawn_close(sess.session().clone(), sess.name().to_string());
        }
        count
    }

    /// Refuse further admissions, drain the free list and wake every parked
    /// borrower so it can observe the closed flag.
    pub(crate) fn begin_shutdown(&self) {
        let drained: Vec<Arc<PooledSession>> = {
            let mut st = self.state.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            st.waiters.clear();
            let drained: Vec<_> = st.free.drain(..).collect();
            st.destroyed_count += drained.len() as u64;
            for sess in &drained {
                sess.mark_closed();
            }
            drained
        };
        let st = self.state.lock();
        info!(
            "session queue shut down: closed {} free, created[{}] destroyed[{}]",
            drained.len(),
            st.created_count,
            st.destroyed_count
        );
        drop(st);
        for sess in drained {
            spawn_close(sess.session().clone(), sess.name().to_string());
        }
    }

    pub(crate) fn busy_count(&self) -> usize {
        self.state.lock().busy.len()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub(crate) fn set_min_size(&self, size: usize) {
        self.state.lock().min_size = size;
    }

    pub(crate) fn set_max_size(&self, size: usize) {
        let mut st = self.state.lock();
        st.max_size = size;
        // Raising the cap may unblock parked borrowers.
        let capacity = st.max_size.saturating_sub(st.total());
        for _ in 0..capacity {
            if st.waiters.is_empty() {
                break;
            }
            st.wake_retry();
        }
    }

    pub(crate) fn set_warning_size(&self, size: usize) {
        self.state.lock().warning_size = size;
    }

    pub(crate) fn status(&self, reset: bool) -> PoolStatus {
        let mut st = self.state.lock();
        let snapshot = st.status();
        if reset {
            st.hit_count = 0;
            st.wait_count = 0;
            st.high_water_mark = st.busy.len();
        }
        snapshot
    }

    pub(crate) fn statistics(&self, reset: bool) -> PoolStatistics {
        let mut st = self.state.lock();
        let snapshot = PoolStatistics {
            count: st.stats.count,
            total_micros: st.stats.total_micros,
            hwm_micros: st.stats.hwm_micros,
        };
        if reset {
            st.stats = BorrowStats::default();
        }
        snapshot
    }

    pub(crate) fn busy_report(&self) -> String {
        self.state.lock().busy_report()
    }
}
