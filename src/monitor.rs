//! Periodic health monitor
//!
//! Trims idle sessions and probes backend liveness on a timer. The task is
//! cancelled exactly once by shutdown and never fires after cancellation;
//! per-tick errors are handled by the check itself and never kill the loop.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::pool::SessionPool;

pub(crate) fn spawn_monitor(
    pool: SessionPool,
    freq: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(freq);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; the check should first run
        // one full period after construction.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    pool.run_health_check().await;
                }
            }
        }
        debug!("health monitor for [{}] stopped", pool.name());
    })
}
