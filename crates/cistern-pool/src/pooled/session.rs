//! Tracking and resetting client-modified session properties

use cistern_core::{Connection, SessionDefaults};

/// Which session properties currently differ from the connection's baseline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct NonDefaultFlags {
    pub isolation: bool,
    pub catalog: bool,
    pub holdability: bool,
    pub read_only: bool,
    pub type_map: bool,
}

impl NonDefaultFlags {
    pub fn any(&self) -> bool {
        self.isolation || self.catalog || self.holdability || self.read_only || self.type_map
    }
}

/// Restore every flagged property to its baseline.
///
/// Only flagged properties are touched. Returns the flags that could not be
/// reset along with the failure messages.
pub(crate) async fn reset_session(
    conn: &dyn Connection,
    defaults: &SessionDefaults,
    flags: NonDefaultFlags,
) -> (NonDefaultFlags, Vec<String>) {
    let mut remaining = NonDefaultFlags::default();
    let mut failures = Vec::new();

    if flags.isolation {
        if let Err(e) = conn.set_transaction_isolation(defaults.isolation).await {
            remaining.isolation = true;
            failures.push(format!("resetting transaction isolation: {e}"));
        }
    }
    if flags.catalog {
        if let Err(e) = conn.set_catalog(defaults.catalog.as_deref()).await {
            remaining.catalog = true;
            failures.push(format!("resetting catalog: {e}"));
        }
    }
    if flags.holdability {
        if let Err(e) = conn.set_holdability(defaults.holdability).await {
            remaining.holdability = true;
            failures.push(format!("resetting holdability: {e}"));
        }
    }
    if flags.read_only {
        if let Err(e) = conn.set_read_only(defaults.read_only).await {
            remaining.read_only = true;
            failures.push(format!("resetting read-only: {e}"));
        }
    }
    if flags.type_map {
        if let Err(e) = conn.set_type_map(defaults.type_map.clone()).await {
            remaining.type_map = true;
            failures.push(format!("resetting type map: {e}"));
        }
    }

    (remaining, failures)
}
