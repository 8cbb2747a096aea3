//! Tests for the per-auth connection pool

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use cistern_core::{CisternError, Connection, DbAuth, Result};
use parking_lot::Mutex;

use super::*;
use crate::cache::StatementDestroyer;
use crate::config::PoolConfig;
use crate::customizer::ConnectionCustomizer;
use crate::pooled::{ConnectionId, PooledConnection};
use crate::source::{AcquireContext, ConnectionPoolDataSource, SourceCapabilities};
use crate::tasks::TaskRunner;
use crate::tester::DefaultConnectionTester;
use crate::testing::MockConnection;

/// Source handing out mock connections and remembering each one
#[derive(Default)]
struct MockSource {
    native: bool,
    customizer: Option<Arc<dyn ConnectionCustomizer>>,
    tables: Vec<(String, usize)>,
    refuse: AtomicBool,
    fail_new: Mutex<Vec<(&'static str, CisternError)>>,
    created: Mutex<Vec<(ConnectionId, Arc<MockConnection>)>>,
}

impl MockSource {
    fn native() -> Self {
        Self {
            native: true,
            ..Self::default()
        }
    }

    fn mock(&self, id: ConnectionId) -> Arc<MockConnection> {
        self.created
            .lock()
            .iter()
            .find(|(other, _)| *other == id)
            .map(|(_, mock)| mock.clone())
            .expect("connection was created by this source")
    }

    fn mocks(&self) -> Vec<Arc<MockConnection>> {
        self.created.lock().iter().map(|(_, m)| m.clone()).collect()
    }
}

#[async_trait]
impl ConnectionPoolDataSource for MockSource {
    async fn pooled_connection(
        &self,
        _auth: &DbAuth,
        context: &AcquireContext,
    ) -> Result<Arc<PooledConnection>> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(CisternError::Connection("connection refused".into()));
        }
        let mut mock = MockConnection::new();
        for (table, rows) in &self.tables {
            mock = mock.with_table(table, *rows);
        }
        for (method, error) in self.fail_new.lock().iter() {
            mock.fail_on(*method, error.duplicate());
        }
        if self.native {
            if let Some(customizer) = &self.customizer {
                customizer.on_acquire(&*mock, &context.parent_token).await?;
            }
        }
        let pc = PooledConnection::new(
            mock.clone(),
            context.tester.clone(),
            context.options.clone(),
            context.parent_token.clone(),
        )
        .await?;
        self.created.lock().push((pc.id(), mock));
        Ok(pc)
    }

    fn capabilities(&self) -> SourceCapabilities {
        if self.native {
            SourceCapabilities::native()
        } else {
            SourceCapabilities::default()
        }
    }

    fn customizer(&self) -> Option<Arc<dyn ConnectionCustomizer>> {
        self.customizer.clone()
    }
}

#[derive(Default)]
struct CountingCustomizer {
    acquired: AtomicUsize,
    destroyed: AtomicUsize,
    checked_out: AtomicUsize,
    checked_in: AtomicUsize,
    fail_check_out: AtomicBool,
    fail_check_in: AtomicBool,
}

#[async_trait]
impl ConnectionCustomizer for CountingCustomizer {
    async fn on_acquire(&self, _conn: &dyn Connection, parent_token: &str) -> Result<()> {
        assert_eq!(parent_token, "test-token");
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_destroy(&self, _conn: &dyn Connection, _parent_token: &str) -> Result<()> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_check_out(&self, _conn: &dyn Connection, _parent_token: &str) -> Result<()> {
        self.checked_out.fetch_add(1, Ordering::SeqCst);
        if self.fail_check_out.load(Ordering::SeqCst) {
            return Err(CisternError::Other("not today".into()));
        }
        Ok(())
    }

    async fn on_check_in(&self, _conn: &dyn Connection, _parent_token: &str) -> Result<()> {
        self.checked_in.fetch_add(1, Ordering::SeqCst);
        if self.fail_check_in.load(Ordering::SeqCst) {
            return Err(CisternError::Other("rejected".into()));
        }
        Ok(())
    }
}

struct Harness {
    source: Arc<MockSource>,
    infrastructure: PoolInfrastructure,
}

impl Harness {
    fn new(source: MockSource) -> Self {
        let runner = Arc::new(TaskRunner::new("pool-test", 3));
        Self {
            source: Arc::new(source),
            infrastructure: PoolInfrastructure {
                destroyer: StatementDestroyer::shared(runner.clone()),
                runner,
                tester: Arc::new(DefaultConnectionTester::new()),
                parent_token: "test-token".into(),
            },
        }
    }

    async fn pool(&self, config: PoolConfig) -> Result<PooledConnectionPool> {
        PooledConnectionPool::new(
            DbAuth::default_auth(),
            config,
            self.source.clone(),
            &self.infrastructure,
        )
        .await
    }

    async fn settle(&self) {
        self.infrastructure.runner.wait_idle().await;
    }
}

fn config(min: usize, max: usize) -> PoolConfig {
    PoolConfig::new(min, max)
        .with_acquire_retry_attempts(1)
        .with_acquire_retry_delay_ms(10)
}

mod acquire_tests {
    use super::*;

    #[tokio::test]
    async fn test_initial_connections_are_primed() {
        let h = Harness::new(MockSource::native());
        let pool = h.pool(config(2, 4)).await.unwrap();

        assert_eq!(pool.num_connections(), 2);
        assert_eq!(pool.num_idle_connections(), 2);
        for mock in h.source.mocks() {
            assert_eq!(mock.count("take_warnings"), 1);
            assert!(!mock.is_closed());
        }
    }

    #[tokio::test]
    async fn test_failed_priming_destroys_connection() {
        let source = MockSource::native();
        source
            .fail_new
            .lock()
            .push(("take_warnings", CisternError::Driver("warnings unavailable".into())));
        let h = Harness::new(source);

        let pool = h.pool(config(2, 4)).await.unwrap();

        assert_eq!(pool.num_connections(), 0);
        assert_eq!(h.source.mocks().len(), 2);
        assert!(h.source.mocks().iter().all(|m| m.is_closed()));
        let failure = pool.last_acquisition_failure().unwrap();
        assert!(failure.message.contains("warnings unavailable"));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let h = Harness::new(MockSource::native());
        let err = h
            .pool(config(1, 2).with_acquire_increment(0))
            .await
            .unwrap_err();
        assert!(matches!(err, CisternError::Configuration(_)));
    }
}

mod checkout_tests {
    use super::*;

    #[tokio::test]
    async fn test_closing_logical_connection_returns_it() {
        let h = Harness::new(MockSource::native());
        let pool = h.pool(config(2, 4)).await.unwrap();

        let conn = pool.get_connection().await.unwrap();
        assert_eq!(pool.num_busy_connections(), 1);
        assert_eq!(pool.num_idle_connections(), 1);

        conn.close().await.unwrap();
        assert_eq!(pool.num_busy_connections(), 0);
        assert_eq!(pool.num_idle_connections(), 2);
        assert_eq!(h.source.mocks().len(), 2);
    }

    #[tokio::test]
    async fn test_checked_out_connection_is_marked_in_use() {
        let h = Harness::new(MockSource::native());
        let pool = h.pool(config(1, 1)).await.unwrap();

        let pc = pool.checkout_pooled_connection().await.unwrap();
        assert!(pc.in_use_lock().is_marked());
        assert_eq!(pool.num_busy_connections(), 1);

        pool.checkin_pooled_connection(&pc).await.unwrap();
        assert!(!pc.in_use_lock().is_marked());
        assert_eq!(pool.num_idle_connections(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_pool_times_out() {
        let h = Harness::new(MockSource::native());
        let pool = h
            .pool(config(1, 1).with_checkout_timeout_ms(50))
            .await
            .unwrap();

        let held = pool.get_connection().await.unwrap();
        let err = pool.get_connection().await.unwrap_err();

        assert!(err.is_checkout_timeout());
        assert!(err.to_string().contains("pool[<default>]"));
        assert_eq!(pool.stats().failed_checkouts, 1);
        held.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_database_cannot_acquire() {
        let source = MockSource::native();
        source.refuse.store(true, Ordering::SeqCst);
        let h = Harness::new(source);
        let pool = h.pool(config(0, 1)).await.unwrap();

        let err = pool.get_connection().await.unwrap_err();

        assert!(matches!(err, CisternError::CannotAcquire(_)));
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_failed_checkout_test_replaces_connection() {
        let h = Harness::new(MockSource::native());
        let pool = h
            .pool(config(1, 2).with_test_connection_on_checkout(true))
            .await
            .unwrap();
        let first = h.source.mocks()[0].clone();
        first.fail_on("table_exists", CisternError::ConnectionInvalid("gone".into()));

        let conn = pool.get_connection().await.unwrap();

        assert!(first.is_closed());
        assert!(!h.source.mock(conn.connection_id()).is_closed());
        assert_eq!(h.source.mocks().len(), 2);
        conn.close().await.unwrap();
    }
}

mod customizer_tests {
    use super::*;

    fn customized() -> (Harness, Arc<CountingCustomizer>) {
        let customizer = Arc::new(CountingCustomizer::default());
        let source = MockSource {
            customizer: Some(customizer.clone()),
            ..MockSource::native()
        };
        (Harness::new(source), customizer)
    }

    #[tokio::test]
    async fn test_hooks_run_at_each_lifecycle_point() {
        let (h, customizer) = customized();
        let pool = h.pool(config(1, 1)).await.unwrap();
        assert_eq!(customizer.acquired.load(Ordering::SeqCst), 1);

        let conn = pool.get_connection().await.unwrap();
        assert_eq!(customizer.checked_out.load(Ordering::SeqCst), 1);
        conn.close().await.unwrap();
        assert_eq!(customizer.checked_in.load(Ordering::SeqCst), 1);

        pool.close().await;
        assert_eq!(customizer.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_check_out_failure_is_surfaced() {
        let (h, customizer) = customized();
        let pool = h.pool(config(1, 1)).await.unwrap();
        customizer.fail_check_out.store(true, Ordering::SeqCst);

        let err = pool.get_connection().await.unwrap_err();

        match err {
            CisternError::Customizer { hook, message } => {
                assert_eq!(hook, "on_check_out");
                assert!(message.contains("not today"));
            }
            other => panic!("expected a customizer error, got {other:?}"),
        }
        assert_eq!(pool.num_busy_connections(), 0);
        assert!(h.source.mocks()[0].is_closed());
    }

    #[tokio::test]
    async fn test_check_in_failure_destroys_connection() {
        let (h, customizer) = customized();
        let pool = h.pool(config(0, 1)).await.unwrap();
        let conn = pool.get_connection().await.unwrap();
        let mock = h.source.mock(conn.connection_id());
        customizer.fail_check_in.store(true, Ordering::SeqCst);

        conn.close().await.unwrap();

        assert!(mock.is_closed());
        assert_eq!(customizer.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.num_connections(), 0);
        assert_eq!(pool.stats().failed_checkins, 1);
    }

    #[tokio::test]
    async fn test_foreign_source_skips_customizer_and_cache() {
        let customizer = Arc::new(CountingCustomizer::default());
        let source = MockSource {
            customizer: Some(customizer.clone()),
            ..MockSource::default()
        };
        let h = Harness::new(source);
        let pool = h.pool(config(1, 1).with_max_statements(10)).await.unwrap();

        assert!(pool.statement_cache().is_none());
        let conn = pool.get_connection().await.unwrap();
        conn.close().await.unwrap();
        pool.close().await;

        assert_eq!(customizer.acquired.load(Ordering::SeqCst), 0);
        assert_eq!(customizer.checked_out.load(Ordering::SeqCst), 0);
        assert_eq!(customizer.checked_in.load(Ordering::SeqCst), 0);
        assert_eq!(customizer.destroyed.load(Ordering::SeqCst), 0);
    }
}

mod event_tests {
    use super::*;

    #[tokio::test]
    async fn test_connection_error_evicts_only_that_connection() {
        let h = Harness::new(MockSource::native());
        let pool = h.pool(config(2, 2)).await.unwrap();
        let a = pool.get_connection().await.unwrap();
        let b = pool.get_connection().await.unwrap();
        let mock_a = h.source.mock(a.connection_id());
        let mock_b = h.source.mock(b.connection_id());
        mock_a.fail_on("execute", CisternError::ConnectionInvalid("socket reset".into()));

        assert!(a.execute("UPDATE t SET a = 'x'", &[]).await.is_err());
        assert_eq!(pool.stats().connections_marked_broken, 1);
        assert_eq!(pool.stats().pool_resets, 0);

        a.close().await.unwrap();
        b.close().await.unwrap();
        h.settle().await;

        assert!(mock_a.is_closed());
        assert!(!mock_b.is_closed());
        assert_eq!(pool.num_connections(), 2);
        assert_eq!(pool.num_unclosed_orphaned_connections(), 0);
    }

    #[tokio::test]
    async fn test_database_invalid_resets_pool() {
        let h = Harness::new(MockSource::native());
        let pool = h.pool(config(2, 3)).await.unwrap();
        let a = pool.get_connection().await.unwrap();
        let mock_a = h.source.mock(a.connection_id());
        let idle = h
            .source
            .mocks()
            .into_iter()
            .find(|m| !Arc::ptr_eq(m, &mock_a))
            .unwrap();
        mock_a.fail_on("execute", CisternError::sql("network is down", "08001"));

        assert!(a.execute("UPDATE t SET a = 'x'", &[]).await.is_err());

        assert_eq!(pool.stats().pool_resets, 1);
        assert!(idle.is_closed());
        assert_eq!(pool.num_unclosed_orphaned_connections(), 1);
        assert!(!mock_a.is_closed());

        a.close().await.unwrap();
        h.settle().await;
        assert!(mock_a.is_closed());
        assert_eq!(pool.num_unclosed_orphaned_connections(), 0);
        assert_eq!(pool.num_connections(), 2);
    }

    #[tokio::test]
    async fn test_ordinary_sql_error_keeps_connection() {
        let h = Harness::new(MockSource::native());
        let pool = h.pool(config(1, 1)).await.unwrap();
        let conn = pool.get_connection().await.unwrap();
        let mock = h.source.mock(conn.connection_id());
        mock.fail_on("execute", CisternError::sql("syntax error", "42000"));

        assert!(conn.execute("UPDAT t", &[]).await.is_err());
        conn.close().await.unwrap();

        assert!(!mock.is_closed());
        assert_eq!(pool.num_idle_connections(), 1);
        assert_eq!(pool.stats().connections_marked_broken, 0);
    }
}

mod test_table_tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_table_is_created() {
        let h = Harness::new(MockSource::native());
        let pool = h
            .pool(config(1, 1).with_automatic_test_table("cistern_test"))
            .await
            .unwrap();

        let setup = h.source.mocks()[0].clone();
        assert_eq!(setup.count("execute"), 1);
        assert!(setup.is_closed());
        assert_eq!(
            pool.config().effective_test_query().as_deref(),
            Some("SELECT * FROM cistern_test")
        );
        assert_eq!(pool.num_connections(), 1);
    }

    #[tokio::test]
    async fn test_existing_empty_table_is_reused() {
        let source = MockSource {
            tables: vec![("cistern_test".into(), 0)],
            ..MockSource::native()
        };
        let h = Harness::new(source);
        h.pool(config(1, 1).with_automatic_test_table("cistern_test"))
            .await
            .unwrap();

        assert_eq!(h.source.mocks()[0].count("execute"), 0);
    }

    #[tokio::test]
    async fn test_table_with_rows_fails_construction() {
        let source = MockSource {
            tables: vec![("cistern_test".into(), 2)],
            ..MockSource::native()
        };
        let h = Harness::new(source);

        let err = h
            .pool(config(1, 1).with_automatic_test_table("cistern_test"))
            .await
            .unwrap_err();

        assert!(matches!(err, CisternError::Configuration(_)));
        assert!(err.to_string().contains("contains 2 row(s)"));
        assert!(h.source.mocks()[0].is_closed());
        assert_eq!(h.source.mocks().len(), 1);
    }
}

mod stats_tests {
    use super::*;

    #[tokio::test]
    async fn test_stats_include_statement_cache() {
        let h = Harness::new(MockSource::native());
        let pool = h.pool(config(1, 1).with_max_statements(10)).await.unwrap();

        let conn = pool.get_connection().await.unwrap();
        conn.prepare_statement("SELECT a FROM t WHERE a = ?")
            .await
            .unwrap();
        conn.close().await.unwrap();

        let stats = pool.stats();
        assert_eq!(stats.connections, 1);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.busy, 0);
        assert_eq!(stats.auth_user, None);
        let cache = stats.statement_cache.unwrap();
        assert_eq!(cache.statements, 1);
        assert_eq!(cache.checked_out, 0);
    }

    #[test]
    fn test_utilization() {
        let stats = PooledPoolStats {
            connections: 4,
            idle: 1,
            busy: 3,
            ..PooledPoolStats::default()
        };
        assert_eq!(stats.utilization(), 0.75);
        assert!(!stats.is_full());
        assert_eq!(PooledPoolStats::default().utilization(), 0.0);
    }
}
