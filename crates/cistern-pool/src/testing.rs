//! Scriptable in-memory connection used by the unit tests

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cistern_core::{
    CisternError, Connection, DbAuth, Driver, Holdability, IsolationLevel, MaterializedResultSet,
    PreparedStatement, QueryResult, Result, ResultSet, Row, Statement, StatementOptions,
    StatementRequest, StatementResult, TypeMap, Value,
};
use parking_lot::Mutex;

/// Mock connection recording every call by name
pub(crate) struct MockConnection {
    calls: Mutex<Vec<String>>,
    failures: Mutex<HashMap<&'static str, CisternError>>,
    auto_commit: AtomicBool,
    isolation: Mutex<IsolationLevel>,
    catalog: Mutex<Option<String>>,
    holdability: Mutex<Holdability>,
    read_only: AtomicBool,
    type_map: Mutex<TypeMap>,
    is_valid: Mutex<Option<bool>>,
    tables: Mutex<HashMap<String, usize>>,
    closed: AtomicBool,
    pub prepared: Mutex<Vec<Arc<MockPreparedStatement>>>,
    pub statements: Mutex<Vec<Arc<MockStatement>>>,
    pub result_sets: Mutex<Vec<Arc<MaterializedResultSet>>>,
    query_delay: Mutex<Option<Duration>>,
}

impl MockConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            auto_commit: AtomicBool::new(true),
            isolation: Mutex::new(IsolationLevel::ReadCommitted),
            catalog: Mutex::new(None),
            holdability: Mutex::new(Holdability::HoldCursorsOverCommit),
            read_only: AtomicBool::new(false),
            type_map: Mutex::new(TypeMap::new()),
            is_valid: Mutex::new(None),
            tables: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            prepared: Mutex::new(Vec::new()),
            statements: Mutex::new(Vec::new()),
            result_sets: Mutex::new(Vec::new()),
            query_delay: Mutex::new(None),
        })
    }

    /// Make every future call of `method` fail with `error`
    pub fn fail_on(&self, method: &'static str, error: CisternError) {
        self.failures.lock().insert(method, error);
    }

    pub fn clear_failure(&self, method: &'static str) {
        self.failures.lock().remove(method);
    }

    pub fn with_is_valid(self: Arc<Self>, valid: bool) -> Arc<Self> {
        *self.is_valid.lock() = Some(valid);
        self
    }

    pub fn with_table(self: Arc<Self>, name: &str, rows: usize) -> Arc<Self> {
        self.tables.lock().insert(name.to_string(), rows);
        self
    }

    pub fn set_query_delay(&self, delay: Duration) {
        *self.query_delay.lock() = Some(delay);
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

    pub fn prepared_count(&self) -> usize {
        self.prepared.lock().len()
    }

    fn record(&self, method: &'static str) -> Result<()> {
        self.calls.lock().push(method.to_string());
        match self.failures.lock().get(method) {
            Some(err) => Err(err.duplicate()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn driver_name(&self) -> &str {
        "mock"
    }

    async fn execute(&self, _sql: &str, _params: &[Value]) -> Result<StatementResult> {
        self.record("execute")?;
        Ok(StatementResult::affected(1))
    }

    async fn query(&self, sql: &str, _params: &[Value]) -> Result<QueryResult> {
        self.record("query")?;
        let delay = *self.query_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let table = sql.strip_prefix("SELECT * FROM ").map(str::to_string);
        let rows = table
            .and_then(|t| self.tables.lock().get(&t).copied())
            .unwrap_or(0);
        let columns = vec!["a".to_string()];
        Ok(QueryResult::from_rows(
            (0..rows)
                .map(|_| Row::new(columns.clone(), vec![Value::String("x".into())]))
                .collect(),
        ))
    }

    async fn create_statement(&self, _options: &StatementOptions) -> Result<Arc<dyn Statement>> {
        self.record("create_statement")?;
        let stmt = Arc::new(MockStatement::new());
        self.statements.lock().push(stmt.clone());
        Ok(stmt)
    }

    async fn prepare(&self, request: &StatementRequest) -> Result<Arc<dyn PreparedStatement>> {
        self.record("prepare")?;
        let stmt = Arc::new(MockPreparedStatement::new(request.sql()));
        self.prepared.lock().push(stmt.clone());
        Ok(stmt)
    }

    async fn auto_commit(&self) -> Result<bool> {
        self.record("auto_commit")?;
        Ok(self.auto_commit.load(Ordering::SeqCst))
    }

    async fn set_auto_commit(&self, auto_commit: bool) -> Result<()> {
        self.record("set_auto_commit")?;
        self.auto_commit.store(auto_commit, Ordering::SeqCst);
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        self.record("commit")
    }

    async fn rollback(&self) -> Result<()> {
        self.record("rollback")
    }

    async fn transaction_isolation(&self) -> Result<IsolationLevel> {
        self.record("transaction_isolation")?;
        Ok(*self.isolation.lock())
    }

    async fn set_transaction_isolation(&self, level: IsolationLevel) -> Result<()> {
        self.record("set_transaction_isolation")?;
        *self.isolation.lock() = level;
        Ok(())
    }

    async fn catalog(&self) -> Result<Option<String>> {
        self.record("catalog")?;
        Ok(self.catalog.lock().clone())
    }

    async fn set_catalog(&self, catalog: Option<&str>) -> Result<()> {
        self.record("set_catalog")?;
        *self.catalog.lock() = catalog.map(str::to_string);
        Ok(())
    }

    async fn holdability(&self) -> Result<Holdability> {
        self.record("holdability")?;
        Ok(*self.holdability.lock())
    }

    async fn set_holdability(&self, holdability: Holdability) -> Result<()> {
        self.record("set_holdability")?;
        *self.holdability.lock() = holdability;
        Ok(())
    }

    async fn is_read_only(&self) -> Result<bool> {
        self.record("is_read_only")?;
        Ok(self.read_only.load(Ordering::SeqCst))
    }

    async fn set_read_only(&self, read_only: bool) -> Result<()> {
        self.record("set_read_only")?;
        self.read_only.store(read_only, Ordering::SeqCst);
        Ok(())
    }

    async fn type_map(&self) -> Result<TypeMap> {
        self.record("type_map")?;
        Ok(self.type_map.lock().clone())
    }

    async fn set_type_map(&self, type_map: TypeMap) -> Result<()> {
        self.record("set_type_map")?;
        *self.type_map.lock() = type_map;
        Ok(())
    }

    async fn is_valid(&self, _timeout: Duration) -> Result<bool> {
        self.record("is_valid")?;
        let valid = *self.is_valid.lock();
        valid.ok_or_else(|| CisternError::NotSupported("no is_valid".into()))
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        self.record("table_exists")?;
        Ok(self.tables.lock().contains_key(table))
    }

    async fn take_warnings(&self) -> Result<Vec<String>> {
        self.record("take_warnings")?;
        Ok(Vec::new())
    }

    async fn close(&self) -> Result<()> {
        self.record("close")?;
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Driver handing out fresh [`MockConnection`]s
#[derive(Default)]
pub(crate) struct MockDriver {
    pub connections: Mutex<Vec<(DbAuth, Arc<MockConnection>)>>,
    refuse: AtomicBool,
}

impl MockDriver {
    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn connections_opened(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn connections_closed(&self) -> usize {
        self.connections
            .lock()
            .iter()
            .filter(|(_, c)| c.is_closed())
            .count()
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn connect(&self, auth: &DbAuth) -> Result<Arc<dyn Connection>> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(CisternError::Connection("connection refused".into()));
        }
        let conn = MockConnection::new();
        self.connections.lock().push((auth.clone(), conn.clone()));
        Ok(conn)
    }
}

/// Mock unprepared statement
pub(crate) struct MockStatement {
    closed: AtomicBool,
    pub cancels: AtomicUsize,
    pub closes: AtomicUsize,
    pub result_sets: Mutex<Vec<Arc<MaterializedResultSet>>>,
}

impl MockStatement {
    fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            cancels: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            result_sets: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Statement for MockStatement {
    async fn execute(&self, _sql: &str, _params: &[Value]) -> Result<StatementResult> {
        Ok(StatementResult::affected(1))
    }

    async fn query(&self, _sql: &str, _params: &[Value]) -> Result<Arc<dyn ResultSet>> {
        let rs = Arc::new(MaterializedResultSet::new(QueryResult::empty()));
        self.result_sets.lock().push(rs.clone());
        Ok(rs)
    }

    async fn cancel(&self) -> Result<()> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Mock prepared statement
pub(crate) struct MockPreparedStatement {
    pub sql: String,
    closed: AtomicBool,
    fail_close: AtomicBool,
    pub closes: AtomicUsize,
    pub executions: AtomicUsize,
    pub result_sets: Mutex<Vec<Arc<MaterializedResultSet>>>,
}

impl MockPreparedStatement {
    pub fn new(sql: &str) -> Self {
        Self {
            sql: sql.to_string(),
            closed: AtomicBool::new(false),
            fail_close: AtomicBool::new(false),
            closes: AtomicUsize::new(0),
            executions: AtomicUsize::new(0),
            result_sets: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_close(&self) {
        self.fail_close.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl PreparedStatement for MockPreparedStatement {
    async fn execute(&self, _params: &[Value]) -> Result<StatementResult> {
        if self.is_closed() {
            return Err(CisternError::Closed("statement closed".into()));
        }
        self.executions.fetch_add(1, Ordering::SeqCst);
        Ok(StatementResult::affected(1))
    }

    async fn query(&self, _params: &[Value]) -> Result<Arc<dyn ResultSet>> {
        let rs = Arc::new(MaterializedResultSet::new(QueryResult::empty()));
        self.result_sets.lock().push(rs.clone());
        Ok(rs)
    }

    async fn cancel(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(CisternError::Driver("close failed".into()));
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
