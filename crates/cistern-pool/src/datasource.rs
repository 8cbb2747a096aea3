//! Client-facing pooled data source
//!
//! [`PooledDataSource`] ties a connection source, a [`PoolConfig`] and a
//! [`PoolManager`] together and registers itself in the
//! [`registry`](crate::registry) under a unique identity token.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use cistern_core::{CisternError, DbAuth, Driver, Result};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::config::{ConfigChanges, PoolConfig, PoolConfigOverride, UserOverrides};
use crate::customizer::ConnectionCustomizer;
use crate::manager::{ManagerStats, PoolManager};
use crate::pooled::ProxyConnection;
use crate::registry;
use crate::source::{ConnectionPoolDataSource, WrapperConnectionPoolDataSource};
use crate::tester::ConnectionTester;

/// How often a replaced manager checks whether its clients are done
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Builder for [`PooledDataSource`]
#[derive(Default)]
pub struct PooledDataSourceBuilder {
    driver: Option<Arc<dyn Driver>>,
    source: Option<Arc<dyn ConnectionPoolDataSource>>,
    customizer: Option<Arc<dyn ConnectionCustomizer>>,
    tester: Option<Arc<dyn ConnectionTester>>,
    config: PoolConfig,
    user_overrides: UserOverrides,
    forced: Option<PoolConfigOverride>,
    default_auth: DbAuth,
    name: Option<String>,
}

impl PooledDataSourceBuilder {
    /// Pool connections opened by `driver`
    pub fn driver(mut self, driver: Arc<dyn Driver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Pool connections from a custom source instead of a driver
    pub fn source(mut self, source: Arc<dyn ConnectionPoolDataSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Hooks run around each connection's lifecycle; needs [`driver`](Self::driver)
    pub fn customizer(mut self, customizer: Arc<dyn ConnectionCustomizer>) -> Self {
        self.customizer = Some(customizer);
        self
    }

    pub fn tester(mut self, tester: Arc<dyn ConnectionTester>) -> Self {
        self.tester = Some(tester);
        self
    }

    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    pub fn user_overrides(mut self, overrides: UserOverrides) -> Self {
        self.user_overrides = overrides;
        self
    }

    pub fn forced_override(mut self, forced: PoolConfigOverride) -> Self {
        self.forced = Some(forced);
        self
    }

    /// Credentials used by [`PooledDataSource::get_connection`]
    pub fn default_auth(mut self, auth: DbAuth) -> Self {
        self.default_auth = auth;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Validate the configuration and register the data source.
    ///
    /// No connection is opened until the first checkout.
    pub fn build(self) -> Result<Arc<PooledDataSource>> {
        self.config.validate()?;
        let source: Arc<dyn ConnectionPoolDataSource> = match (self.driver, self.source) {
            (Some(_), Some(_)) => {
                return Err(CisternError::Configuration(
                    "set either a driver or a connection source, not both".into(),
                ));
            }
            (Some(driver), None) => {
                let mut wrapper = WrapperConnectionPoolDataSource::new(driver);
                if let Some(customizer) = self.customizer {
                    wrapper = wrapper.with_customizer(customizer);
                }
                Arc::new(wrapper)
            }
            (None, Some(source)) => {
                if self.customizer.is_some() {
                    return Err(CisternError::Configuration(
                        "a connection customizer needs a driver-backed data source".into(),
                    ));
                }
                source
            }
            (None, None) => {
                return Err(CisternError::Configuration(
                    "a pooled data source needs a driver or a connection source".into(),
                ));
            }
        };

        let identity_token = Uuid::new_v4().to_string();
        let settings = ManagerSettings {
            source,
            tester: self.tester,
            user_overrides: self.user_overrides,
            forced: self.forced,
            default_auth: self.default_auth,
        };
        let manager = settings.manager(self.config, &identity_token);
        let ds = Arc::new(PooledDataSource {
            name: self.name,
            identity_token,
            settings,
            manager: RwLock::new(Arc::new(manager)),
            closed: AtomicBool::new(false),
        });
        registry::register(&ds);
        tracing::debug!(identity_token = %ds.identity_token, name = ?ds.name, "pooled data source created");
        Ok(ds)
    }
}

/// What every manager of one data source is built from
struct ManagerSettings {
    source: Arc<dyn ConnectionPoolDataSource>,
    tester: Option<Arc<dyn ConnectionTester>>,
    user_overrides: UserOverrides,
    forced: Option<PoolConfigOverride>,
    default_auth: DbAuth,
}

impl ManagerSettings {
    fn manager(&self, config: PoolConfig, identity_token: &str) -> PoolManager {
        let mut manager = PoolManager::new(self.source.clone(), config, identity_token)
            .with_user_overrides(self.user_overrides.clone())
            .with_default_auth(self.default_auth.clone());
        if let Some(forced) = &self.forced {
            manager = manager.with_forced_override(forced.clone());
        }
        if let Some(tester) = &self.tester {
            manager = manager.with_tester(tester.clone());
        }
        manager
    }
}

/// A pooling data source: hands out logical connections backed by per-auth
/// pools of physical connections
pub struct PooledDataSource {
    name: Option<String>,
    identity_token: String,
    settings: ManagerSettings,
    manager: RwLock<Arc<PoolManager>>,
    closed: AtomicBool,
}

impl PooledDataSource {
    pub fn builder() -> PooledDataSourceBuilder {
        PooledDataSourceBuilder::default()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Unique token this data source is registered under
    pub fn identity_token(&self) -> &str {
        &self.identity_token
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The manager currently serving checkouts
    pub fn manager(&self) -> Arc<PoolManager> {
        self.manager.read().clone()
    }

    pub fn config(&self) -> PoolConfig {
        self.manager().config().clone()
    }

    /// A logical connection for the default auth
    pub async fn get_connection(&self) -> Result<ProxyConnection> {
        let auth = self.settings.default_auth.clone();
        self.checkout(&auth).await
    }

    /// A logical connection for `user`, from that user's own pool
    pub async fn get_connection_as(&self, user: &str, password: &str) -> Result<ProxyConnection> {
        self.checkout(&DbAuth::new(user, password)).await
    }

    /// Check out from the current manager, following a concurrent
    /// [`update_config`](Self::update_config) to its replacement
    async fn checkout(&self, auth: &DbAuth) -> Result<ProxyConnection> {
        loop {
            self.ensure_open()?;
            let manager = self.manager();
            match manager.get_connection_as(auth).await {
                Err(CisternError::Closed(_)) if !Arc::ptr_eq(&manager, &self.manager()) => {
                    tracing::debug!(auth_user = %auth, "manager replaced during checkout, retrying");
                }
                result => return result,
            }
        }
    }

    /// Apply a new configuration.
    ///
    /// Pools are rebuilt from the new settings on their next use. Clients
    /// keep the connections they hold; those are destroyed when returned.
    /// Changes to the shared helper tasks or statement destroyer also replace
    /// that infrastructure; the old one stops once its connections are all
    /// returned.
    #[tracing::instrument(skip(self, config), fields(identity_token = %self.identity_token))]
    pub async fn update_config(&self, config: PoolConfig) -> Result<ConfigChanges> {
        self.ensure_open()?;
        config.validate()?;
        let current = self.manager();
        let changes = current.config().diff(&config);
        if changes.is_empty() {
            return Ok(changes);
        }

        let replacement = if changes.requires_new_manager() {
            self.settings.manager(config, &self.identity_token)
        } else {
            current.reconfigured(config)
        };
        let previous = std::mem::replace(&mut *self.manager.write(), Arc::new(replacement));
        tracing::info!(
            changed = ?changes.changed_fields(),
            new_manager = changes.requires_new_manager(),
            "pool configuration updated"
        );
        previous.retire().await;
        if changes.requires_new_manager() {
            tokio::spawn(async move { previous.shutdown_when_drained(DRAIN_POLL).await });
        }
        Ok(changes)
    }

    /// Reset every per-auth pool
    pub async fn soft_reset_all_users(&self) {
        self.manager().soft_reset_all_auths().await
    }

    /// Reset the pool of the default auth
    pub async fn soft_reset_default_user(&self) {
        let manager = self.manager();
        manager.soft_reset(manager.default_auth()).await
    }

    pub async fn soft_reset(&self, user: &str, password: &str) {
        self.manager()
            .soft_reset(&DbAuth::new(user, password))
            .await
    }

    /// Close every pool. The registry keeps only a weak reference afterwards.
    #[tracing::instrument(skip(self), fields(identity_token = %self.identity_token))]
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.manager().close().await;
        registry::mark_closed(&self.identity_token);
        tracing::debug!("pooled data source closed");
    }

    pub fn num_connections(&self) -> usize {
        self.manager().total_connections()
    }

    pub fn num_idle_connections(&self) -> usize {
        self.manager().idle_connections()
    }

    pub fn num_busy_connections(&self) -> usize {
        self.manager().busy_connections()
    }

    pub fn num_unclosed_orphaned_connections(&self) -> usize {
        self.manager().unclosed_orphaned_connections()
    }

    pub fn stats(&self) -> ManagerStats {
        self.manager().stats()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(CisternError::Closed(format!(
                "data source {} is closed",
                self.identity_token
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for PooledDataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledDataSource")
            .field("name", &self.name)
            .field("identity_token", &self.identity_token)
            .field("closed", &self.is_closed())
            .finish()
    }
}
