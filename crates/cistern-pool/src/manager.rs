//! One connection pool per auth
//!
//! The [`PoolManager`] creates a [`PooledConnectionPool`] the first time an
//! auth asks for a connection and keeps it until the manager closes. All of
//! its pools share one task runner and one statement destroyer.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use cistern_core::{CisternError, DbAuth, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::cache::{StatementCacheStats, StatementDestroyer};
use crate::config::{PoolConfig, PoolConfigOverride, UserOverrides};
use crate::pool::{PoolInfrastructure, PooledConnectionPool, PooledPoolStats};
use crate::pooled::ProxyConnection;
use crate::source::ConnectionPoolDataSource;
use crate::tasks::{TaskRunner, TaskRunnerStats};
use crate::tester::{ConnectionTester, DefaultConnectionTester};

/// Totals across every pool of a manager
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ManagerStats {
    pub num_user_pools: usize,
    pub total_connections: usize,
    pub idle_connections: usize,
    pub busy_connections: usize,
    pub unclosed_orphaned_connections: usize,
    pub statement_cache: StatementCacheStats,
    pub helper_tasks: TaskRunnerStats,
    pub pools: Vec<PooledPoolStats>,
}

/// Lazily created per-auth pools over one connection source
pub struct PoolManager {
    source: Arc<dyn ConnectionPoolDataSource>,
    config: PoolConfig,
    user_overrides: UserOverrides,
    forced: Option<PoolConfigOverride>,
    default_auth: DbAuth,
    infrastructure: PoolInfrastructure,
    pools: RwLock<HashMap<DbAuth, Arc<PooledConnectionPool>>>,
    /// Serializes pool creation so each auth gets exactly one pool
    creating: tokio::sync::Mutex<()>,
    custom_tester: bool,
    closed: AtomicBool,
}

impl PoolManager {
    /// Create a manager. No connections are opened until the first
    /// [`pool`](Self::pool) call.
    pub fn new(
        source: Arc<dyn ConnectionPoolDataSource>,
        config: PoolConfig,
        parent_token: impl Into<String>,
    ) -> Self {
        let runner = Arc::new(
            TaskRunner::new("cistern-helper", config.num_helper_threads())
                .with_max_task_time(config.max_administrative_task_time()),
        );
        let destroyer = match config.statement_cache_num_deferred_close_threads() {
            0 => StatementDestroyer::shared(runner.clone()),
            threads => {
                StatementDestroyer::dedicated(threads, config.max_administrative_task_time())
            }
        };
        Self {
            source,
            user_overrides: UserOverrides::new(),
            forced: None,
            default_auth: DbAuth::default_auth(),
            infrastructure: PoolInfrastructure {
                runner,
                destroyer,
                tester: default_tester(&config),
                parent_token: parent_token.into(),
            },
            config,
            pools: RwLock::new(HashMap::new()),
            creating: tokio::sync::Mutex::new(()),
            custom_tester: false,
            closed: AtomicBool::new(false),
        }
    }

    /// A manager with no pools yet that builds its pools from `config` and
    /// shares this manager's task runner and statement destroyer.
    ///
    /// Only valid when `config` changes nothing in the shared
    /// infrastructure; see
    /// [`ConfigChanges::requires_new_manager`](crate::ConfigChanges::requires_new_manager).
    pub fn reconfigured(&self, config: PoolConfig) -> Self {
        let mut infrastructure = self.infrastructure.clone();
        if !self.custom_tester {
            infrastructure.tester = default_tester(&config);
        }
        Self {
            source: self.source.clone(),
            config,
            user_overrides: self.user_overrides.clone(),
            forced: self.forced.clone(),
            default_auth: self.default_auth.clone(),
            infrastructure,
            pools: RwLock::new(HashMap::new()),
            creating: tokio::sync::Mutex::new(()),
            custom_tester: self.custom_tester,
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_user_overrides(mut self, overrides: UserOverrides) -> Self {
        self.user_overrides = overrides;
        self
    }

    /// Settings applied on top of every user's configuration
    pub fn with_forced_override(mut self, forced: PoolConfigOverride) -> Self {
        self.forced = (!forced.is_empty()).then_some(forced);
        self
    }

    pub fn with_tester(mut self, tester: Arc<dyn ConnectionTester>) -> Self {
        self.infrastructure.tester = tester;
        self.custom_tester = true;
        self
    }

    /// Credentials used by [`get_connection`](Self::get_connection)
    pub fn with_default_auth(mut self, auth: DbAuth) -> Self {
        self.default_auth = auth;
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn default_auth(&self) -> &DbAuth {
        &self.default_auth
    }

    pub fn parent_token(&self) -> &str {
        &self.infrastructure.parent_token
    }

    pub fn tester(&self) -> &Arc<dyn ConnectionTester> {
        &self.infrastructure.tester
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Effective configuration for `auth`'s pool
    pub fn config_for(&self, auth: &DbAuth) -> PoolConfig {
        self.config
            .resolve_for(auth.user(), &self.user_overrides, self.forced.as_ref())
    }

    /// The pool for `auth`, created on first use
    #[tracing::instrument(skip(self), fields(auth_user = %auth))]
    pub async fn pool(&self, auth: &DbAuth) -> Result<Arc<PooledConnectionPool>> {
        self.ensure_open()?;
        if let Some(pool) = self.pools.read().get(auth) {
            return Ok(pool.clone());
        }

        let _creating = self.creating.lock().await;
        self.ensure_open()?;
        if let Some(pool) = self.pools.read().get(auth) {
            return Ok(pool.clone());
        }

        let pool = Arc::new(
            PooledConnectionPool::new(
                auth.clone(),
                self.config_for(auth),
                self.source.clone(),
                &self.infrastructure,
            )
            .await?,
        );
        self.pools.write().insert(auth.clone(), pool.clone());
        tracing::debug!(auth_user = %auth, pools = self.pools.read().len(), "created pool for auth");
        Ok(pool)
    }

    /// The pool for `auth` if one has been created
    pub fn existing_pool(&self, auth: &DbAuth) -> Option<Arc<PooledConnectionPool>> {
        self.pools.read().get(auth).cloned()
    }

    /// Auths that currently have a pool
    pub fn auths(&self) -> Vec<DbAuth> {
        self.pools.read().keys().cloned().collect()
    }

    /// A logical connection for the default auth
    pub async fn get_connection(&self) -> Result<ProxyConnection> {
        let auth = self.default_auth.clone();
        self.get_connection_as(&auth).await
    }

    pub async fn get_connection_as(&self, auth: &DbAuth) -> Result<ProxyConnection> {
        self.pool(auth).await?.get_connection().await
    }

    /// Reset one auth's pool, if it exists
    pub async fn soft_reset(&self, auth: &DbAuth) {
        if let Some(pool) = self.existing_pool(auth) {
            pool.reset().await;
        }
    }

    /// Reset every pool: idle connections are replaced now, checked-out ones
    /// when they come back
    #[tracing::instrument(skip(self))]
    pub async fn soft_reset_all_auths(&self) {
        for pool in self.snapshot() {
            pool.reset().await;
        }
    }

    /// Close every pool and stop the background tasks
    #[tracing::instrument(skip(self))]
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _creating = self.creating.lock().await;
        let pools: Vec<_> = self.pools.write().drain().map(|(_, pool)| pool).collect();
        for pool in &pools {
            pool.close().await;
        }
        self.infrastructure.destroyer.close();
        self.infrastructure.runner.close();
        tracing::debug!(pools = pools.len(), "pool manager closed");
    }

    /// Stop creating pools and close the existing ones gracefully: clients
    /// keep their connections until they close them. The task runner and
    /// statement destroyer stay up for whoever shares them.
    #[tracing::instrument(skip(self))]
    pub async fn retire(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _creating = self.creating.lock().await;
        let pools = self.snapshot();
        for pool in &pools {
            pool.close_gracefully().await;
        }
        tracing::debug!(pools = pools.len(), "pool manager retired");
    }

    /// Once a retired manager's clients have returned every connection,
    /// finish the scheduled statement closes and stop the task runner and
    /// statement destroyer. Only for a manager whose infrastructure no
    /// other manager shares.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown_when_drained(&self, poll: Duration) {
        while self.total_connections() > 0 {
            tokio::time::sleep(poll).await;
        }
        self.infrastructure.destroyer.wait_idle().await;
        self.infrastructure.destroyer.close();
        self.infrastructure.runner.close();
        tracing::debug!("retired pool manager drained");
    }

    pub fn total_connections(&self) -> usize {
        self.sum(|p| p.num_connections())
    }

    pub fn idle_connections(&self) -> usize {
        self.sum(|p| p.num_idle_connections())
    }

    pub fn busy_connections(&self) -> usize {
        self.sum(|p| p.num_busy_connections())
    }

    pub fn unclosed_orphaned_connections(&self) -> usize {
        self.sum(|p| p.num_unclosed_orphaned_connections())
    }

    pub fn num_user_pools(&self) -> usize {
        self.pools.read().len()
    }

    pub fn pool_stats(&self, auth: &DbAuth) -> Option<PooledPoolStats> {
        self.existing_pool(auth).map(|pool| pool.stats())
    }

    pub fn statement_cache_stats(&self) -> StatementCacheStats {
        self.merge_cache_stats(
            self.snapshot()
                .iter()
                .filter_map(|p| p.statement_cache().map(|c| c.stats())),
        )
    }

    pub fn task_runner(&self) -> &Arc<TaskRunner> {
        &self.infrastructure.runner
    }

    pub fn thread_pool_stats(&self) -> TaskRunnerStats {
        self.infrastructure.runner.stats()
    }

    pub fn stats(&self) -> ManagerStats {
        let pools: Vec<PooledPoolStats> = self.snapshot().iter().map(|p| p.stats()).collect();
        ManagerStats {
            num_user_pools: pools.len(),
            total_connections: pools.iter().map(|p| p.connections).sum(),
            idle_connections: pools.iter().map(|p| p.idle).sum(),
            busy_connections: pools.iter().map(|p| p.busy).sum(),
            unclosed_orphaned_connections: pools.iter().map(|p| p.unclosed_orphans).sum(),
            statement_cache: self
                .merge_cache_stats(pools.iter().filter_map(|p| p.statement_cache)),
            helper_tasks: self.thread_pool_stats(),
            pools,
        }
    }

    /// Pools share one destroyer, so its counts are taken once
    fn merge_cache_stats(
        &self,
        stats: impl Iterator<Item = StatementCacheStats>,
    ) -> StatementCacheStats {
        let destroyer = &self.infrastructure.destroyer;
        StatementCacheStats {
            deferred_close_active: destroyer.active_count(),
            deferred_close_pending: destroyer.pending_count(),
            ..stats.fold(StatementCacheStats::default(), StatementCacheStats::merge)
        }
    }

    fn snapshot(&self) -> Vec<Arc<PooledConnectionPool>> {
        self.pools.read().values().cloned().collect()
    }

    fn sum(&self, count: impl Fn(&PooledConnectionPool) -> usize) -> usize {
        self.pools.read().values().map(|p| count(p)).sum()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(CisternError::Closed("pool manager is closed".into()));
        }
        Ok(())
    }
}

fn default_tester(config: &PoolConfig) -> Arc<dyn ConnectionTester> {
    let tester = DefaultConnectionTester::new();
    match config.connection_test_timeout() {
        Some(timeout) => Arc::new(tester.with_timeout(timeout)),
        None => Arc::new(tester),
    }
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("parent_token", &self.infrastructure.parent_token)
            .field("pools", &self.num_user_pools())
            .field("closed", &self.is_closed())
            .finish()
    }
}
