//! Pool status and statistics snapshots

use serde::Serialize;
use std::fmt;

/// Point-in-time snapshot of the pool's sizes and counters.
///
/// Obtained from [`SessionPool::status`](crate::pool::SessionPool::status);
/// passing `reset = true` clears `high_water_mark`, `wait_count` and
/// `hit_count` after the snapshot is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// The minimum number of sessions the pool maintains
    pub min_size: usize,
    /// The maximum number of sessions the pool can grow to
    pub max_size: usize,
    /// Sessions currently idle in the free list
    pub free: usize,
    /// Sessions currently borrowed
    pub busy: usize,
    /// Borrowers currently blocked waiting for a session
    pub waiting: usize,
    /// The highest number of busy sessions observed
    pub high_water_mark: usize,
    /// Total number of borrows that had to block
    pub wait_count: u64,
    /// Total number of borrow attempts, including those that failed
    pub hit_count: u64,
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "min[{}] max[{}] free[{}] busy[{}] waiting[{}] highWaterMark[{}] waitCount[{}] hitCount[{}]",
            self.min_size,
            self.max_size,
            self.free,
            self.busy,
            self.waiting,
            self.high_water_mark,
            self.wait_count,
            self.hit_count
        )
    }
}

/// Aggregated borrow-time statistics.
///
/// Collected on every release; `total_micros` is the sum of time sessions
/// were held by borrowers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatistics {
    /// Number of completed borrows
    pub count: u64,
    /// Total microseconds sessions were held
    pub total_micros: u64,
    /// Longest single borrow, in microseconds
    pub hwm_micros: u64,
}

impl PoolStatistics {
    /// Average borrow duration in microseconds, 0 when no borrows completed.
    pub fn avg_micros(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.total_micros / self.count
        }
    }
}

impl fmt::Display for PoolStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "count[{}] totalMicros[{}] hwmMicros[{}] avgMicros[{}]",
            self.count,
            self.total_micros,
            self.hwm_micros,
            self.avg_micros()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        let status = PoolStatus {
            min_size: 2,
            max_size: 4,
            free: 1,
            busy: 2,
            waiting: 0,
            high_water_mark: 3,
            wait_count: 1,
            hit_count: 9,
        };
        assert_eq!(
            status.to_string(),
            "min[2] max[4] free[1] busy[2] waiting[0] highWaterMark[3] waitCount[1] hitCount[9]"
        );
    }

    #[test]
    fn test_statistics_avg() {
        let stats = PoolStatistics {
            count: 0,
            total_micros: 0,
            hwm_micros: 0,
        };
        assert_eq!(stats.avg_micros(), 0);

        let stats = PoolStatistics {
            count: 4,
            total_micros: 1000,
            hwm_micros: 400,
        };
        assert_eq!(stats.avg_micros(), 250);
    }
}
