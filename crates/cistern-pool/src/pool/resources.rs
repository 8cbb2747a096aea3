//! Resource-pool callbacks for pooled connections

use std::sync::Arc;

use async_trait::async_trait;
use cistern_core::{CisternError, DbAuth, Result};

use crate::cache::StatementCache;
use crate::customizer::ConnectionCustomizer;
use crate::pooled::PooledConnection;
use crate::resource::ResourceManager;
use crate::source::{AcquireContext, ConnectionPoolDataSource};

/// Releases a connection's in-use mark when dropped
struct Marked<'a>(&'a PooledConnection);

impl Drop for Marked<'_> {
    fn drop(&mut self) {
        self.0.unmark_in_use();
    }
}

/// Creates, refurbishes and destroys the physical connections of one
/// per-auth pool
pub(crate) struct ConnectionResources {
    pub(crate) auth: DbAuth,
    pub(crate) source: Arc<dyn ConnectionPoolDataSource>,
    pub(crate) customizer: Option<Arc<dyn ConnectionCustomizer>>,
    pub(crate) cache: Option<Arc<StatementCache>>,
    pub(crate) context: AcquireContext,
    pub(crate) test_on_checkout: bool,
    pub(crate) test_on_checkin: bool,
}

impl ConnectionResources {
    /// Bind the cache, then open and close one logical connection so that
    /// warnings from connection setup are cleared before first use
    async fn prime(&self, pc: &PooledConnection) -> Result<()> {
        if let Some(cache) = &self.cache {
            pc.init_statement_cache(cache.clone());
        }
        pc.mark_in_use().await?;
        let _marked = Marked(pc);

        let proxy = pc.get_connection()?;
        let warnings = proxy.take_warnings().await;
        let closed = proxy.close().await;
        match warnings {
            Ok(warnings) if !warnings.is_empty() => {
                tracing::debug!(connection_id = %pc.id(), ?warnings, "cleared warnings from a new connection");
            }
            Ok(_) => {}
            Err(e) => return Err(e),
        }
        closed
    }

    fn reject_invalidated(pc: &PooledConnection) -> Result<()> {
        if pc.is_invalidated() {
            return Err(pc
                .status()
                .into_error(format!("{} was invalidated by a client error", pc.id())));
        }
        Ok(())
    }

    async fn test(&self, pc: &PooledConnection) -> Result<()> {
        pc.tester()
            .active_check_connection(&**pc.physical(), pc.test_query())
            .await
            .into_result()
    }
}

#[async_trait]
impl ResourceManager for ConnectionResources {
    type Resource = Arc<PooledConnection>;

    fn resource_key(&self, resource: &Arc<PooledConnection>) -> u64 {
        resource.id().as_u64()
    }

    async fn acquire_resource(&self) -> Result<Arc<PooledConnection>> {
        let pc = self
            .source
            .pooled_connection(&self.auth, &self.context)
            .await?;
        if let Err(e) = self.prime(&pc).await {
            tracing::debug!(connection_id = %pc.id(), error = %e, "new connection failed setup, destroying it");
            if let Err(destroy_error) = self.destroy_resource(&pc, false).await {
                tracing::debug!(connection_id = %pc.id(), error = %destroy_error, "destroying a half-acquired connection failed");
            }
            return Err(e);
        }
        tracing::debug!(connection_id = %pc.id(), auth_user = %self.auth, "acquired connection");
        Ok(pc)
    }

    async fn refurbish_resource_on_checkout(&self, pc: &Arc<PooledConnection>) -> Result<()> {
        Self::reject_invalidated(pc)?;
        pc.mark_in_use().await?;
        let _marked = Marked(&**pc);

        if let Some(customizer) = &self.customizer {
            customizer
                .on_check_out(&**pc.physical(), pc.parent_token())
                .await
                .map_err(|e| hook_error("on_check_out", e))?;
        }
        if self.test_on_checkout {
            self.test(pc).await?;
        }
        Ok(())
    }

    async fn refurbish_resource_on_checkin(&self, pc: &Arc<PooledConnection>) -> Result<()> {
        Self::reject_invalidated(pc)?;
        pc.mark_in_use().await?;
        let _marked = Marked(&**pc);

        if let Some(customizer) = &self.customizer {
            customizer
                .on_check_in(&**pc.physical(), pc.parent_token())
                .await
                .map_err(|e| hook_error("on_check_in", e))?;
        }
        if self.test_on_checkin {
            self.test(pc).await?;
        }
        Ok(())
    }

    async fn refurbish_idle_resource(&self, pc: &Arc<PooledConnection>) -> Result<()> {
        Self::reject_invalidated(pc)?;
        if !pc.try_mark_in_use() {
            tracing::trace!(connection_id = %pc.id(), "connection busy, skipping idle test");
            return Ok(());
        }
        let _marked = Marked(&**pc);
        self.test(pc).await
    }

    async fn destroy_resource(&self, pc: &Arc<PooledConnection>, checked_out: bool) -> Result<()> {
        if checked_out {
            tracing::debug!(connection_id = %pc.id(), "destroying a connection a client still holds");
        }
        if let Some(customizer) = &self.customizer {
            if let Err(e) = customizer
                .on_destroy(&**pc.physical(), pc.parent_token())
                .await
            {
                tracing::warn!(connection_id = %pc.id(), error = %e, "connection customizer on_destroy failed");
            }
        }
        pc.destroy().await
    }
}

/// Customizer failures keep their own variant when they already say
/// something about the connection, otherwise they are labeled with the hook
fn hook_error(hook: &'static str, error: CisternError) -> CisternError {
    match error {
        CisternError::Customizer { .. }
        | CisternError::ConnectionInvalid(_)
        | CisternError::DatabaseInvalid(_) => error,
        other => CisternError::Customizer {
            hook,
            message: other.to_string(),
        },
    }
}
