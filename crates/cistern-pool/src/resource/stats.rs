//! Resource pool statistics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshot of a resource pool's inventory and failure history
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourcePoolStats {
    /// Resources owned by the pool, idle or checked out
    pub size: usize,
    /// Idle resources ready for checkout
    pub available: usize,
    /// Checked-out resources
    pub awaiting_checkin: usize,
    /// Checked-out resources that will be destroyed at checkin
    pub excluded: usize,
    /// Checkouts currently waiting for a resource
    pub waiting: usize,
    /// Acquisitions in flight
    pub pending_acquires: usize,
    pub failed_checkouts: u64,
    pub failed_checkins: u64,
    pub failed_idle_tests: u64,
    pub last_acquisition_failure: Option<FailureRecord>,
    pub last_checkout_failure: Option<FailureRecord>,
    pub last_checkin_failure: Option<FailureRecord>,
    pub last_idle_test_failure: Option<FailureRecord>,
}

impl ResourcePoolStats {
    /// Fraction of resources checked out, 0.0 for an empty pool
    pub fn utilization(&self) -> f64 {
        if self.size == 0 {
            0.0
        } else {
            self.awaiting_checkin as f64 / self.size as f64
        }
    }
}

/// When a failure happened and what it was
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub at: DateTime<Utc>,
    pub message: String,
}

impl FailureRecord {
    pub fn now(message: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            message: message.into(),
        }
    }
}
