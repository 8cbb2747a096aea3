//! User hooks around the life of a physical connection

use async_trait::async_trait;
use cistern_core::{Connection, Result};

/// Hooks invoked on physical connections at lifecycle points.
///
/// `parent_token` identifies the data source that owns the pool. Errors from
/// `on_acquire`, `on_check_out` and `on_check_in` fail the operation that
/// triggered them; errors from `on_destroy` are only logged.
#[async_trait]
pub trait ConnectionCustomizer: Send + Sync {
    /// A new physical connection was opened
    async fn on_acquire(&self, _conn: &dyn Connection, _parent_token: &str) -> Result<()> {
        Ok(())
    }

    /// The physical connection is about to be closed
    async fn on_destroy(&self, _conn: &dyn Connection, _parent_token: &str) -> Result<()> {
        Ok(())
    }

    async fn on_check_out(&self, _conn: &dyn Connection, _parent_token: &str) -> Result<()> {
        Ok(())
    }

    async fn on_check_in(&self, _conn: &dyn Connection, _parent_token: &str) -> Result<()> {
        Ok(())
    }
}
