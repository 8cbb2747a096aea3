//! Scripted in-memory driver and data source fixtures.
//!
//! [`ScriptedDriver`] hands out [`ScriptedConnection`]s that record every call
//! by name, keep real session state, and fail on demand. Tests reach the
//! physical side through the driver to check what the pool did to it.
//!
//! # Usage
//!
//! ```rust,ignore
//! use cistern_tests::fixtures::{config, data_source, driver};
//!
//! let driver = driver();
//! let ds = data_source(&driver, config(1, 3))?;
//! let conn = ds.get_connection().await?;
//! conn.execute("UPDATE t SET a = 1", &[]).await?;
//! conn.close().await?;
//! assert_eq!(driver.opened(), 1);
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cistern_core::{
    CisternError, Connection, DbAuth, Driver, Holdability, IsolationLevel, MaterializedResultSet,
    PreparedStatement, QueryResult, ResultSet, Row, Statement, StatementOptions,
    StatementRequest, StatementResult, TypeMap, Value,
};
use cistern_pool::{PoolConfig, PooledDataSource};
use parking_lot::Mutex;

/// Driver whose connections live in memory and can be scripted to fail
#[derive(Default)]
pub struct ScriptedDriver {
    connections: Mutex<Vec<Arc<ScriptedConnection>>>,
    tables: Mutex<HashMap<String, usize>>,
    refuse: AtomicBool,
}

impl ScriptedDriver {
    /// Make `table` exist with `rows` rows on every future connection
    pub fn with_table(self, table: &str, rows: usize) -> Self {
        self.tables.lock().insert(table.to_string(), rows);
        self
    }

    /// Refuse every future connect
    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Every connection opened so far, oldest first
    pub fn connections(&self) -> Vec<Arc<ScriptedConnection>> {
        self.connections.lock().clone()
    }

    pub fn opened(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn closed(&self) -> usize {
        self.connections
            .lock()
            .iter()
            .filter(|c| c.is_closed())
            .count()
    }

    /// Physical connections currently open
    pub fn live(&self) -> usize {
        self.opened() - self.closed()
    }

    /// Apply `script` to every connection opened so far
    pub fn script_all(&self, script: impl Fn(&ScriptedConnection)) {
        for conn in self.connections.lock().iter() {
            script(conn);
        }
    }
}

#[async_trait]
impl Driver for ScriptedDriver {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn connect(&self, auth: &DbAuth) -> cistern_core::Result<Arc<dyn Connection>> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(CisternError::Connection(format!(
                "connection refused for {auth}"
            )));
        }
        let conn = Arc::new(ScriptedConnection::new(
            auth.clone(),
            self.tables.lock().clone(),
        ));
        self.connections.lock().push(conn.clone());
        Ok(conn)
    }
}

/// Session state of one scripted connection
struct Session {
    auto_commit: bool,
    isolation: IsolationLevel,
    catalog: Option<String>,
    holdability: Holdability,
    read_only: bool,
    type_map: TypeMap,
}

/// In-memory physical connection
pub struct ScriptedConnection {
    auth: DbAuth,
    calls: Mutex<Vec<String>>,
    failures: Mutex<HashMap<&'static str, CisternError>>,
    session: Mutex<Session>,
    tables: Mutex<HashMap<String, usize>>,
    valid: AtomicBool,
    closed: AtomicBool,
    statements: Mutex<Vec<Arc<ScriptedStatement>>>,
    prepared: Mutex<Vec<Arc<ScriptedStatement>>>,
}

impl ScriptedConnection {
    fn new(auth: DbAuth, tables: HashMap<String, usize>) -> Self {
        Self {
            auth,
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            session: Mutex::new(Session {
                auto_commit: true,
                isolation: IsolationLevel::ReadCommitted,
                catalog: Some("main".to_string()),
                holdability: Holdability::HoldCursorsOverCommit,
                read_only: false,
                type_map: TypeMap::new(),
            }),
            tables: Mutex::new(tables),
            valid: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            statements: Mutex::new(Vec::new()),
            prepared: Mutex::new(Vec::new()),
        }
    }

    pub fn auth(&self) -> &DbAuth {
        &self.auth
    }

    /// Make every future call of `method` fail with `error`
    pub fn fail_on(&self, method: &'static str, error: CisternError) {
        self.failures.lock().insert(method, error);
    }

    /// What `is_valid` reports from now on
    pub fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, method: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.as_str() == method).count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.session.lock().isolation
    }

    pub fn current_catalog(&self) -> Option<String> {
        self.session.lock().catalog.clone()
    }

    pub fn current_holdability(&self) -> Holdability {
        self.session.lock().holdability
    }

    pub fn read_only(&self) -> bool {
        self.session.lock().read_only
    }

    pub fn current_type_map(&self) -> TypeMap {
        self.session.lock().type_map.clone()
    }

    /// Unprepared statements created on this connection
    pub fn statements(&self) -> Vec<Arc<ScriptedStatement>> {
        self.statements.lock().clone()
    }

    /// Prepared statements created on this connection
    pub fn prepared(&self) -> Vec<Arc<ScriptedStatement>> {
        self.prepared.lock().clone()
    }

    fn record(&self, method: &'static str) -> cistern_core::Result<()> {
        self.calls.lock().push(method.to_string());
        match self.failures.lock().get(method) {
            Some(error) => Err(error.duplicate()),
            None => Ok(()),
        }
    }

    fn tables_snapshot(&self) -> HashMap<String, usize> {
        self.tables.lock().clone()
    }
}

#[async_trait]
impl Connection for ScriptedConnection {
    fn driver_name(&self) -> &str {
        "scripted"
    }

    async fn execute(&self, sql: &str, _params: &[Value]) -> cistern_core::Result<StatementResult> {
        self.record("execute")?;
        if let Some(table) = sql
            .strip_prefix("CREATE TABLE ")
            .and_then(|rest| rest.split_whitespace().next())
        {
            self.tables.lock().insert(table.to_string(), 0);
        }
        Ok(StatementResult::affected(1))
    }

    async fn query(&self, sql: &str, _params: &[Value]) -> cistern_core::Result<QueryResult> {
        self.record("query")?;
        Ok(rows_of(&self.tables.lock(), sql))
    }

    async fn create_statement(
        &self,
        _options: &StatementOptions,
    ) -> cistern_core::Result<Arc<dyn Statement>> {
        self.record("create_statement")?;
        let stmt = Arc::new(ScriptedStatement::new(String::new()));
        self.statements.lock().push(stmt.clone());
        Ok(Arc::new(StatementHandle {
            tables: self.tables_snapshot(),
            stmt,
        }))
    }

    async fn prepare(
        &self,
        request: &StatementRequest,
    ) -> cistern_core::Result<Arc<dyn PreparedStatement>> {
        self.record("prepare")?;
        let stmt = Arc::new(ScriptedStatement::new(request.sql().to_string()));
        self.prepared.lock().push(stmt.clone());
        Ok(Arc::new(StatementHandle {
            tables: self.tables_snapshot(),
            stmt,
        }))
    }

    async fn auto_commit(&self) -> cistern_core::Result<bool> {
        self.record("auto_commit")?;
        Ok(self.session.lock().auto_commit)
    }

    async fn set_auto_commit(&self, auto_commit: bool) -> cistern_core::Result<()> {
        self.record("set_auto_commit")?;
        self.session.lock().auto_commit = auto_commit;
        Ok(())
    }

    async fn commit(&self) -> cistern_core::Result<()> {
        self.record("commit")
    }

    async fn rollback(&self) -> cistern_core::Result<()> {
        self.record("rollback")
    }

    async fn transaction_isolation(&self) -> cistern_core::Result<IsolationLevel> {
        self.record("transaction_isolation")?;
        Ok(self.session.lock().isolation)
    }

    async fn set_transaction_isolation(&self, level: IsolationLevel) -> cistern_core::Result<()> {
        self.record("set_transaction_isolation")?;
        self.session.lock().isolation = level;
        Ok(())
    }

    async fn catalog(&self) -> cistern_core::Result<Option<String>> {
        self.record("catalog")?;
        Ok(self.session.lock().catalog.clone())
    }

    async fn set_catalog(&self, catalog: Option<&str>) -> cistern_core::Result<()> {
        self.record("set_catalog")?;
        self.session.lock().catalog = catalog.map(str::to_string);
        Ok(())
    }

    async fn holdability(&self) -> cistern_core::Result<Holdability> {
        self.record("holdability")?;
        Ok(self.session.lock().holdability)
    }

    async fn set_holdability(&self, holdability: Holdability) -> cistern_core::Result<()> {
        self.record("set_holdability")?;
        self.session.lock().holdability = holdability;
        Ok(())
    }

    async fn is_read_only(&self) -> cistern_core::Result<bool> {
        self.record("is_read_only")?;
        Ok(self.session.lock().read_only)
    }

    async fn set_read_only(&self, read_only: bool) -> cistern_core::Result<()> {
        self.record("set_read_only")?;
        self.session.lock().read_only = read_only;
        Ok(())
    }

    async fn type_map(&self) -> cistern_core::Result<TypeMap> {
        self.record("type_map")?;
        Ok(self.session.lock().type_map.clone())
    }

    async fn set_type_map(&self, type_map: TypeMap) -> cistern_core::Result<()> {
        self.record("set_type_map")?;
        self.session.lock().type_map = type_map;
        Ok(())
    }

    async fn is_valid(&self, _timeout: Duration) -> cistern_core::Result<bool> {
        self.record("is_valid")?;
        Ok(self.valid.load(Ordering::SeqCst) && !self.is_closed())
    }

    async fn table_exists(&self, table: &str) -> cistern_core::Result<bool> {
        self.record("table_exists")?;
        Ok(self.tables.lock().contains_key(table))
    }

    async fn close(&self) -> cistern_core::Result<()> {
        self.record("close")?;
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Counters shared by both statement flavors
pub struct ScriptedStatement {
    sql: String,
    closed: AtomicBool,
    cancels: AtomicUsize,
    closes: AtomicUsize,
    executions: AtomicUsize,
    result_sets: Mutex<Vec<Arc<MaterializedResultSet>>>,
}

impl ScriptedStatement {
    fn new(sql: String) -> Self {
        Self {
            sql,
            closed: AtomicBool::new(false),
            cancels: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            executions: AtomicUsize::new(0),
            result_sets: Mutex::new(Vec::new()),
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    /// Result sets this statement produced
    pub fn result_sets(&self) -> Vec<Arc<MaterializedResultSet>> {
        self.result_sets.lock().clone()
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }

    fn ensure_open(&self) -> cistern_core::Result<()> {
        if self.is_closed() {
            return Err(CisternError::Closed("statement is closed".into()));
        }
        Ok(())
    }
}

/// Rows a query returns: one per row of a known table, else a single row
fn rows_of(tables: &HashMap<String, usize>, sql: &str) -> QueryResult {
    let rows = sql
        .strip_prefix("SELECT * FROM ")
        .and_then(|table| tables.get(table.trim()).copied())
        .unwrap_or(1);
    let columns = vec!["a".to_string()];
    QueryResult::from_rows(
        (0..rows)
            .map(|i| Row::new(columns.clone(), vec![Value::Int64(i as i64)]))
            .collect(),
    )
}

/// Driver-side statement object handed to the pool
struct StatementHandle {
    tables: HashMap<String, usize>,
    stmt: Arc<ScriptedStatement>,
}

impl StatementHandle {
    fn open_result_set(&self, sql: &str) -> Arc<MaterializedResultSet> {
        let rs = Arc::new(MaterializedResultSet::new(rows_of(&self.tables, sql)));
        self.stmt.result_sets.lock().push(rs.clone());
        rs
    }
}

#[async_trait]
impl Statement for StatementHandle {
    async fn execute(&self, _sql: &str, _params: &[Value]) -> cistern_core::Result<StatementResult> {
        self.stmt.ensure_open()?;
        self.stmt.executions.fetch_add(1, Ordering::SeqCst);
        Ok(StatementResult::affected(1))
    }

    async fn query(&self, sql: &str, _params: &[Value]) -> cistern_core::Result<Arc<dyn ResultSet>> {
        self.stmt.ensure_open()?;
        self.stmt.executions.fetch_add(1, Ordering::SeqCst);
        Ok(self.open_result_set(sql))
    }

    async fn cancel(&self) -> cistern_core::Result<()> {
        self.stmt.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> cistern_core::Result<()> {
        self.stmt.close();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.stmt.is_closed()
    }
}

#[async_trait]
impl PreparedStatement for StatementHandle {
    async fn execute(&self, _params: &[Value]) -> cistern_core::Result<StatementResult> {
        self.stmt.ensure_open()?;
        self.stmt.executions.fetch_add(1, Ordering::SeqCst);
        Ok(StatementResult::affected(1))
    }

    async fn query(&self, _params: &[Value]) -> cistern_core::Result<Arc<dyn ResultSet>> {
        self.stmt.ensure_open()?;
        self.stmt.executions.fetch_add(1, Ordering::SeqCst);
        Ok(self.open_result_set(&self.stmt.sql))
    }

    async fn cancel(&self) -> cistern_core::Result<()> {
        self.stmt.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> cistern_core::Result<()> {
        self.stmt.close();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.stmt.is_closed()
    }
}

/// A fresh scripted driver
pub fn driver() -> Arc<ScriptedDriver> {
    initialize_logging();
    Arc::new(ScriptedDriver::default())
}

/// Pool settings for tests: no retries, short delays, a bounded checkout
/// wait so a broken test fails instead of hanging
pub fn config(min: usize, max: usize) -> PoolConfig {
    PoolConfig::new(min, max)
        .with_acquire_increment(1)
        .with_acquire_retry_attempts(1)
        .with_acquire_retry_delay_ms(10)
        .with_checkout_timeout_ms(5_000)
}

/// A data source over `driver`
pub fn data_source(driver: &Arc<ScriptedDriver>, config: PoolConfig) -> Result<Arc<PooledDataSource>> {
    initialize_logging();
    PooledDataSource::builder()
        .driver(driver.clone())
        .config(config)
        .build()
        .context("failed to build data source")
}

/// Poll `condition` until it holds, failing after two seconds
pub async fn eventually(what: &str, condition: impl Fn() -> bool) -> Result<()> {
    let wait = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(2), wait)
        .await
        .with_context(|| format!("timed out waiting for {what}"))
}

/// Initialize logging for tests.
///
/// Honors `RUST_LOG`; defaults to debug output from the cistern crates.
fn initialize_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("cistern_pool=debug,cistern_tests=debug"));
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .finish();

        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}
