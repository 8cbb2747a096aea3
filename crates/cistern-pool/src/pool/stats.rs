//! Per-auth pool statistics

use serde::{Deserialize, Serialize};

use crate::cache::StatementCacheStats;
use crate::resource::FailureRecord;

/// Snapshot of one per-auth connection pool
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PooledPoolStats {
    /// User of the auth this pool serves; `None` for the default auth
    pub auth_user: Option<String>,
    /// Physical connections owned by the pool
    pub connections: usize,
    pub idle: usize,
    pub busy: usize,
    /// Checked-out connections excluded by a reset; destroyed when returned
    pub unclosed_orphans: usize,
    /// Checkouts waiting for a connection
    pub waiting: usize,
    pub failed_checkouts: u64,
    pub failed_checkins: u64,
    pub failed_idle_tests: u64,
    /// Single connections evicted after a connection-invalid error
    pub connections_marked_broken: u64,
    /// Full resets after a database-invalid error
    pub pool_resets: u64,
    pub last_acquisition_failure: Option<FailureRecord>,
    pub statement_cache: Option<StatementCacheStats>,
}

impl PooledPoolStats {
    /// Fraction of connections checked out
    pub fn utilization(&self) -> f64 {
        if self.connections == 0 {
            0.0
        } else {
            self.busy as f64 / self.connections as f64
        }
    }

    pub fn is_full(&self) -> bool {
        self.idle == 0 && self.connections > 0
    }
}
