//! Per-auth connection pool

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use cistern_core::{CisternError, DbAuth, Result};
use parking_lot::Mutex;

use super::resources::ConnectionResources;
use super::stats::PooledPoolStats;
use super::test_table::ensure_test_table;
use crate::cache::{StatementCache, StatementDestroyer};
use crate::config::PoolConfig;
use crate::pooled::{
    ConnectionEventListener, ConnectionId, LifecycleOptions, ListenerId, PooledConnection,
    ProxyConnection,
};
use crate::resource::{FailureRecord, ResourceManager, ResourcePool};
use crate::source::{AcquireContext, ConnectionPoolDataSource};
use crate::tasks::TaskRunner;
use crate::tester::{ConnectionStatus, ConnectionTester};

/// Background machinery shared by every pool of one manager
#[derive(Clone)]
pub struct PoolInfrastructure {
    pub runner: Arc<TaskRunner>,
    pub destroyer: Arc<StatementDestroyer>,
    pub tester: Arc<dyn ConnectionTester>,
    /// Identity token of the owning data source
    pub parent_token: String,
}

/// Returns connections to the resource pool when their logical connection
/// closes and reacts to invalidating errors
struct PoolEvents {
    name: String,
    resources: Weak<ResourcePool<ConnectionResources>>,
    registrations: Mutex<HashMap<ConnectionId, ListenerId>>,
    marked_broken: AtomicU64,
    resets: AtomicU64,
}

impl PoolEvents {
    async fn checkin(&self, pc: &Arc<PooledConnection>) -> Result<()> {
        let registration = self.registrations.lock().remove(&pc.id());
        if let Some(listener) = registration {
            pc.remove_listener(listener);
        }
        pc.unmark_in_use();

        let Some(resources) = self.resources.upgrade() else {
            tracing::debug!(pool = %self.name, connection_id = %pc.id(), "pool is gone, destroying returned connection");
            return pc.destroy().await;
        };
        if pc.is_invalidated() {
            resources.mark_broken(pc).await;
        }
        resources.checkin(pc).await
    }
}

#[async_trait]
impl ConnectionEventListener for PoolEvents {
    async fn connection_closed(&self, connection: Arc<PooledConnection>) {
        if let Err(e) = self.checkin(&connection).await {
            tracing::warn!(
                pool = %self.name,
                connection_id = %connection.id(),
                error = %e,
                "failed to check in connection after logical close"
            );
        }
    }

    async fn connection_error_occurred(
        &self,
        connection: Arc<PooledConnection>,
        status: ConnectionStatus,
        error: CisternError,
    ) {
        let Some(resources) = self.resources.upgrade() else {
            return;
        };
        match status {
            ConnectionStatus::ConnectionInvalid => {
                self.marked_broken.fetch_add(1, Ordering::SeqCst);
                tracing::info!(
                    pool = %self.name,
                    connection_id = %connection.id(),
                    error = %error,
                    "evicting invalid connection"
                );
                resources.mark_broken(&connection).await;
            }
            ConnectionStatus::DatabaseInvalid => {
                self.resets.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(
                    pool = %self.name,
                    connection_id = %connection.id(),
                    error = %error,
                    "database reported invalid, resetting pool"
                );
                resources.reset_pool().await;
            }
            ConnectionStatus::Okay => {}
        }
    }
}

/// Pool of physical connections for one [`DbAuth`].
///
/// Connections come from a [`ConnectionPoolDataSource`] and are handed to
/// clients wrapped in a logical [`ProxyConnection`]. Closing the proxy
/// returns the connection here.
pub struct PooledConnectionPool {
    name: String,
    auth: DbAuth,
    config: PoolConfig,
    resources: Arc<ResourcePool<ConnectionResources>>,
    events: Arc<PoolEvents>,
    cache: Option<Arc<StatementCache>>,
}

impl PooledConnectionPool {
    /// Build the pool and acquire its initial connections.
    ///
    /// Fails when the configuration is invalid or when the automatic test
    /// table cannot be set up.
    #[tracing::instrument(skip_all, fields(auth_user = %auth))]
    pub async fn new(
        auth: DbAuth,
        config: PoolConfig,
        source: Arc<dyn ConnectionPoolDataSource>,
        infrastructure: &PoolInfrastructure,
    ) -> Result<Self> {
        config.validate()?;
        let name = format!("pool[{auth}]");
        let capabilities = source.capabilities();

        let cache = match config.cache_bounds() {
            Some(bounds) if capabilities.statement_caching => Some(Arc::new(StatementCache::new(
                bounds,
                infrastructure.destroyer.clone(),
            ))),
            Some(_) => {
                tracing::info!(pool = %name, "data source does not support statement caching; caching disabled");
                None
            }
            None => None,
        };
        let customizer = if capabilities.customizer {
            source.customizer()
        } else {
            None
        };

        let resources = ConnectionResources {
            auth: auth.clone(),
            source,
            customizer,
            cache: cache.clone(),
            context: AcquireContext {
                tester: infrastructure.tester.clone(),
                options: LifecycleOptions::from_config(&config),
                parent_token: infrastructure.parent_token.clone(),
            },
            test_on_checkout: config.test_connection_on_checkout(),
            test_on_checkin: config.test_connection_on_checkin(),
        };

        if let Some(table) = config.automatic_test_table() {
            let pc = resources.acquire_resource().await?;
            let prepared = ensure_test_table(&**pc.physical(), table).await;
            if let Err(e) = resources.destroy_resource(&pc, false).await {
                tracing::debug!(pool = %name, error = %e, "closing the test table connection failed");
            }
            prepared?;
        }

        let resources = Arc::new(
            ResourcePool::new(
                name.clone(),
                resources,
                config.resource_pool_config(),
                infrastructure.runner.clone(),
            )
            .await,
        );
        let events = Arc::new(PoolEvents {
            name: name.clone(),
            resources: Arc::downgrade(&resources),
            registrations: Mutex::new(HashMap::new()),
            marked_broken: AtomicU64::new(0),
            resets: AtomicU64::new(0),
        });

        tracing::info!(pool = %name, size = resources.size(), "connection pool created");
        Ok(Self {
            name,
            auth,
            config,
            resources,
            events,
            cache,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn auth(&self) -> &DbAuth {
        &self.auth
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn statement_cache(&self) -> Option<&Arc<StatementCache>> {
        self.cache.as_ref()
    }

    /// Check out a pooled connection using the configured checkout timeout
    pub async fn checkout_pooled_connection(&self) -> Result<Arc<PooledConnection>> {
        self.checkout_pooled_connection_with_timeout(self.config.checkout_timeout())
            .await
    }

    /// Check out a pooled connection, waiting up to `timeout`.
    ///
    /// The connection is marked in use and returned to this pool when its
    /// logical connection closes.
    #[tracing::instrument(skip(self), fields(pool = %self.name))]
    pub async fn checkout_pooled_connection_with_timeout(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Arc<PooledConnection>> {
        let pc = self
            .resources
            .checkout_with_timeout(timeout)
            .await
            .map_err(|e| self.describe(e))?;

        let listener = pc.add_listener(self.events.clone());
        self.events.registrations.lock().insert(pc.id(), listener);
        if let Err(e) = pc.mark_in_use().await {
            self.checkin_pooled_connection(&pc).await?;
            return Err(e);
        }
        tracing::trace!(pool = %self.name, connection_id = %pc.id(), "checked out connection");
        Ok(pc)
    }

    /// Check out a connection and open its logical connection
    pub async fn get_connection(&self) -> Result<ProxyConnection> {
        let pc = self.checkout_pooled_connection().await?;
        match pc.get_connection() {
            Ok(proxy) => Ok(proxy),
            Err(e) => {
                if let Err(checkin_error) = self.checkin_pooled_connection(&pc).await {
                    tracing::debug!(pool = %self.name, error = %checkin_error, "checkin after failed get_connection failed");
                }
                Err(e)
            }
        }
    }

    /// Return a checked-out connection without going through its logical
    /// connection
    pub async fn checkin_pooled_connection(&self, pc: &Arc<PooledConnection>) -> Result<()> {
        self.events.checkin(pc).await
    }

    /// Destroy every idle connection and every checked-out connection once
    /// it is returned
    #[tracing::instrument(skip(self), fields(pool = %self.name))]
    pub async fn reset(&self) {
        self.resources.reset_pool().await
    }

    #[tracing::instrument(skip(self), fields(pool = %self.name))]
    pub async fn close(&self) {
        self.resources.close().await
    }

    /// Stop handing out connections. Idle ones are destroyed now, checked-out
    /// ones when their clients close them.
    #[tracing::instrument(skip(self), fields(pool = %self.name))]
    pub async fn close_gracefully(&self) {
        self.resources.close_gracefully().await
    }

    pub fn is_closed(&self) -> bool {
        self.resources.is_closed()
    }

    /// Whether the pool closed itself after failing to acquire
    pub fn is_broken(&self) -> bool {
        self.resources.is_broken()
    }

    pub fn num_connections(&self) -> usize {
        self.resources.size()
    }

    pub fn num_idle_connections(&self) -> usize {
        self.resources.available()
    }

    pub fn num_busy_connections(&self) -> usize {
        self.resources.awaiting_checkin()
    }

    pub fn num_unclosed_orphaned_connections(&self) -> usize {
        self.resources.excluded()
    }

    pub fn last_acquisition_failure(&self) -> Option<FailureRecord> {
        self.resources.last_acquisition_failure()
    }

    pub fn stats(&self) -> PooledPoolStats {
        let resources = self.resources.stats();
        PooledPoolStats {
            auth_user: self.auth.user().map(str::to_string),
            connections: resources.size,
            idle: resources.available,
            busy: resources.awaiting_checkin,
            unclosed_orphans: resources.excluded,
            waiting: resources.waiting,
            failed_checkouts: resources.failed_checkouts,
            failed_checkins: resources.failed_checkins,
            failed_idle_tests: resources.failed_idle_tests,
            connections_marked_broken: self.events.marked_broken.load(Ordering::SeqCst),
            pool_resets: self.events.resets.load(Ordering::SeqCst),
            last_acquisition_failure: resources.last_acquisition_failure,
            statement_cache: self.cache.as_ref().map(|cache| cache.stats()),
        }
    }

    /// Name the pool in checkout errors while keeping the error kind
    fn describe(&self, error: CisternError) -> CisternError {
        match error {
            CisternError::CheckoutTimeout(message) => {
                CisternError::CheckoutTimeout(format!("{}: {message}", self.name))
            }
            CisternError::CannotAcquire(message) => {
                CisternError::CannotAcquire(format!("{}: {message}", self.name))
            }
            other => other,
        }
    }
}

impl std::fmt::Debug for PooledConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnectionPool")
            .field("name", &self.name)
            .field("connections", &self.num_connections())
            .field("closed", &self.is_closed())
            .finish()
    }
}
