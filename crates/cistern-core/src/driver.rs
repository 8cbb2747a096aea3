//! Driver trait definition

use crate::{Connection, DbAuth, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Opens physical connections. This is the only place the pool touches the
/// network; everything else goes through the returned [`Connection`].
#[async_trait]
pub trait Driver: Send + Sync {
    /// Unique identifier for this driver (e.g. "postgresql")
    fn id(&self) -> &'static str {
        self.name()
    }

    /// Human-readable driver name
    fn name(&self) -> &'static str;

    /// Open a new physical connection.
    ///
    /// A default `auth` means "use the credentials the driver was configured
    /// with".
    async fn connect(&self, auth: &DbAuth) -> Result<Arc<dyn Connection>>;
}
