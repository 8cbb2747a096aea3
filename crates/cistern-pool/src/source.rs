//! Sources of pooled connections
//!
//! A [`ConnectionPoolDataSource`] turns a [`DbAuth`] into a fresh
//! [`PooledConnection`]. The native implementation,
//! [`WrapperConnectionPoolDataSource`], opens connections through a
//! [`Driver`] and supports statement caching and customizers. Other
//! implementations are pooled without either.

use std::sync::Arc;

use async_trait::async_trait;
use cistern_core::{DbAuth, Driver, Result};

use crate::customizer::ConnectionCustomizer;
use crate::pooled::{LifecycleOptions, PooledConnection};
use crate::tester::ConnectionTester;

/// What the pool may layer on top of a source's connections
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceCapabilities {
    pub statement_caching: bool,
    pub customizer: bool,
}

impl SourceCapabilities {
    /// Everything the pool offers
    pub fn native() -> Self {
        Self {
            statement_caching: true,
            customizer: true,
        }
    }
}

/// Pool-side settings every new pooled connection is built with
#[derive(Clone)]
pub struct AcquireContext {
    pub tester: Arc<dyn ConnectionTester>,
    pub options: LifecycleOptions,
    /// Identity token of the owning data source
    pub parent_token: String,
}

/// Creates pooled connections for an auth
#[async_trait]
pub trait ConnectionPoolDataSource: Send + Sync {
    async fn pooled_connection(
        &self,
        auth: &DbAuth,
        context: &AcquireContext,
    ) -> Result<Arc<PooledConnection>>;

    /// Features the pool may use with this source; none by default
    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities::default()
    }

    fn customizer(&self) -> Option<Arc<dyn ConnectionCustomizer>> {
        None
    }
}

/// Native source over a [`Driver`]
pub struct WrapperConnectionPoolDataSource {
    driver: Arc<dyn Driver>,
    customizer: Option<Arc<dyn ConnectionCustomizer>>,
}

impl WrapperConnectionPoolDataSource {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            customizer: None,
        }
    }

    pub fn with_customizer(mut self, customizer: Arc<dyn ConnectionCustomizer>) -> Self {
        self.customizer = Some(customizer);
        self
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }
}

#[async_trait]
impl ConnectionPoolDataSource for WrapperConnectionPoolDataSource {
    #[tracing::instrument(skip(self, context), fields(driver = self.driver.name(), auth_user = %auth))]
    async fn pooled_connection(
        &self,
        auth: &DbAuth,
        context: &AcquireContext,
    ) -> Result<Arc<PooledConnection>> {
        let physical = self.driver.connect(auth).await?;

        let prepared = async {
            if let Some(customizer) = &self.customizer {
                customizer
                    .on_acquire(&*physical, &context.parent_token)
                    .await?;
            }
            PooledConnection::new(
                physical.clone(),
                context.tester.clone(),
                context.options.clone(),
                context.parent_token.clone(),
            )
            .await
        }
        .await;

        match prepared {
            Ok(pooled) => Ok(pooled),
            Err(e) => {
                if let Err(close_error) = physical.close().await {
                    tracing::debug!(error = %close_error, "closing a half-acquired connection failed");
                }
                Err(e)
            }
        }
    }

    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities::native()
    }

    fn customizer(&self) -> Option<Arc<dyn ConnectionCustomizer>> {
        self.customizer.clone()
    }
}
