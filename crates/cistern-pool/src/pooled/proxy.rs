//! Client-facing proxies for logical connections, statements and result sets
//!
//! Every proxy checks that its logical connection is still open, routes errors
//! through [`PooledConnection::observe`], and registers whatever it opens with
//! the owning [`PooledConnection`] so that a logical close can clean up.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cistern_core::{
    CisternError, ColumnMeta, Connection, Holdability, IsolationLevel, PreparedStatement,
    QueryResult, Result, ResultSet, Row, Statement, StatementOptions, StatementRequest,
    StatementResult, TypeMap, Value,
};

use super::connection::{ConnectionId, PooledConnection, TrackId, TrackedStatement};

/// One logical checkout of a [`PooledConnection`]
pub(crate) struct LogicalConnection {
    pooled: Arc<PooledConnection>,
    generation: u64,
    closed: AtomicBool,
}

impl LogicalConnection {
    pub(crate) fn new(pooled: Arc<PooledConnection>, generation: u64) -> Arc<Self> {
        Arc::new(Self {
            pooled,
            generation,
            closed: AtomicBool::new(false),
        })
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.pooled.is_current(self.generation)
    }

    fn open(&self) -> Result<&Arc<PooledConnection>> {
        if self.is_open() {
            Ok(&self.pooled)
        } else {
            Err(CisternError::Closed(format!(
                "logical connection on {} is closed",
                self.pooled.id()
            )))
        }
    }

    async fn close(&self, known_resolved: bool) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.pooled.close_logical(self.generation, known_resolved).await
    }
}

impl Drop for LogicalConnection {
    fn drop(&mut self) {
        if self.closed.load(Ordering::SeqCst) || !self.pooled.is_current(self.generation) {
            return;
        }
        tracing::warn!(
            connection_id = %self.pooled.id(),
            "logical connection dropped without close(); closing it in the background"
        );
        let pooled = self.pooled.clone();
        let generation = self.generation;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = pooled.close_logical(generation, false).await {
                        tracing::warn!(connection_id = %pooled.id(), error = %e, "background close failed");
                    }
                });
            }
            Err(_) => tracing::warn!(
                connection_id = %pooled.id(),
                "no tokio runtime; dropped logical connection cannot be closed"
            ),
        }
    }
}

/// What a raw operation hands back to the proxy layer
pub enum RawOutcome {
    Unit,
    Value(Value),
    Statement(Arc<dyn Statement>),
    PreparedStatement(Arc<dyn PreparedStatement>),
    ResultSet(Arc<dyn ResultSet>),
}

/// A [`RawOutcome`] with any returned object wrapped and tracked
pub enum RawResult {
    Unit,
    Value(Value),
    Statement(ProxyStatement),
    PreparedStatement(ProxyPreparedStatement),
    ResultSet(ProxyResultSet),
}

impl std::fmt::Debug for RawResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RawResult::Unit => write!(f, "Unit"),
            RawResult::Value(v) => write!(f, "Value({v:?})"),
            RawResult::Statement(_) => write!(f, "Statement"),
            RawResult::PreparedStatement(_) => write!(f, "PreparedStatement"),
            RawResult::ResultSet(_) => write!(f, "ResultSet"),
        }
    }
}

/// Client handle to a logical connection.
///
/// Clones share the same logical connection. Call [`close`](Self::close)
/// when done; a handle dropped without closing is closed in the background
/// with a warning.
#[derive(Clone)]
pub struct ProxyConnection {
    logical: Arc<LogicalConnection>,
}

impl ProxyConnection {
    pub(crate) fn from_logical(logical: Arc<LogicalConnection>) -> Self {
        Self { logical }
    }

    /// Identity of the underlying physical connection
    pub fn connection_id(&self) -> ConnectionId {
        self.logical.pooled.id()
    }

    pub fn is_closed(&self) -> bool {
        !self.logical.is_open()
    }

    /// Whether two handles refer to the same logical connection
    pub fn same_logical(&self, other: &ProxyConnection) -> bool {
        Arc::ptr_eq(&self.logical, &other.logical)
    }

    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<StatementResult> {
        let pc = self.logical.open()?;
        pc.observe(pc.physical().execute(sql, params).await).await
    }

    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let pc = self.logical.open()?;
        pc.observe(pc.physical().query(sql, params).await).await
    }

    pub async fn create_statement(&self, options: &StatementOptions) -> Result<ProxyStatement> {
        let pc = self.logical.open()?;
        let inner = pc.observe(pc.physical().create_statement(options).await).await?;
        let track = pc.track_statement(TrackedStatement::Plain(inner.clone()));
        Ok(ProxyStatement {
            logical: self.logical.clone(),
            track,
            inner,
        })
    }

    /// Prepare `sql` with default options
    pub async fn prepare_statement(&self, sql: &str) -> Result<ProxyPreparedStatement> {
        self.prepare(&StatementRequest::prepared(sql)).await
    }

    /// Prepare a stored procedure call
    pub async fn prepare_call(&self, sql: &str) -> Result<ProxyPreparedStatement> {
        self.prepare(&StatementRequest::callable(sql)).await
    }

    /// Prepare a statement, going through the statement cache when the
    /// connection has one
    pub async fn prepare(&self, request: &StatementRequest) -> Result<ProxyPreparedStatement> {
        let pc = self.logical.open()?;
        match pc.statement_cache() {
            Some(cache) => {
                let checkout = cache
                    .checkout_statement(&**pc.physical(), pc.id(), request)
                    .await;
                let handle = pc.observe(checkout).await?;
                let inner = handle.statement().clone();
                let track = pc.track_cached(handle);
                Ok(ProxyPreparedStatement {
                    logical: self.logical.clone(),
                    track,
                    inner,
                    cached: true,
                })
            }
            None => {
                let inner = pc.observe(pc.physical().prepare(request).await).await?;
                let track = pc.track_statement(TrackedStatement::Prepared(inner.clone()));
                Ok(ProxyPreparedStatement {
                    logical: self.logical.clone(),
                    track,
                    inner,
                    cached: false,
                })
            }
        }
    }

    pub async fn auto_commit(&self) -> Result<bool> {
        let pc = self.logical.open()?;
        pc.observe(pc.physical().auto_commit().await).await
    }

    pub async fn set_auto_commit(&self, auto_commit: bool) -> Result<()> {
        let pc = self.logical.open()?;
        pc.observe(pc.physical().set_auto_commit(auto_commit).await)
            .await
    }

    pub async fn commit(&self) -> Result<()> {
        let pc = self.logical.open()?;
        pc.observe(pc.physical().commit().await).await
    }

    pub async fn rollback(&self) -> Result<()> {
        let pc = self.logical.open()?;
        pc.observe(pc.physical().rollback().await).await
    }

    pub async fn transaction_isolation(&self) -> Result<IsolationLevel> {
        let pc = self.logical.open()?;
        pc.observe(pc.physical().transaction_isolation().await)
            .await
    }

    pub async fn set_transaction_isolation(&self, level: IsolationLevel) -> Result<()> {
        let pc = self.logical.open()?;
        pc.observe(pc.physical().set_transaction_isolation(level).await)
            .await?;
        pc.note_isolation(level);
        Ok(())
    }

    pub async fn catalog(&self) -> Result<Option<String>> {
        let pc = self.logical.open()?;
        pc.observe(pc.physical().catalog().await).await
    }

    pub async fn set_catalog(&self, catalog: Option<&str>) -> Result<()> {
        let pc = self.logical.open()?;
        pc.observe(pc.physical().set_catalog(catalog).await).await?;
        pc.note_catalog(catalog);
        Ok(())
    }

    pub async fn holdability(&self) -> Result<Holdability> {
        let pc = self.logical.open()?;
        pc.observe(pc.physical().holdability().await).await
    }

    pub async fn set_holdability(&self, holdability: Holdability) -> Result<()> {
        let pc = self.logical.open()?;
        pc.observe(pc.physical().set_holdability(holdability).await)
            .await?;
        pc.note_holdability(holdability);
        Ok(())
    }

    pub async fn is_read_only(&self) -> Result<bool> {
        let pc = self.logical.open()?;
        pc.observe(pc.physical().is_read_only().await).await
    }

    pub async fn set_read_only(&self, read_only: bool) -> Result<()> {
        let pc = self.logical.open()?;
        pc.observe(pc.physical().set_read_only(read_only).await)
            .await?;
        pc.note_read_only(read_only);
        Ok(())
    }

    pub async fn type_map(&self) -> Result<TypeMap> {
        let pc = self.logical.open()?;
        pc.observe(pc.physical().type_map().await).await
    }

    pub async fn set_type_map(&self, type_map: TypeMap) -> Result<()> {
        let pc = self.logical.open()?;
        pc.observe(pc.physical().set_type_map(type_map.clone()).await)
            .await?;
        pc.note_type_map(&type_map);
        Ok(())
    }

    /// Return and clear warnings accumulated on the physical connection
    pub async fn take_warnings(&self) -> Result<Vec<String>> {
        let pc = self.logical.open()?;
        pc.observe(pc.physical().take_warnings().await).await
    }

    /// Run `op` against the unwrapped physical connection.
    ///
    /// Statements and result sets returned by `op` are wrapped and tracked
    /// like any other, so they are cleaned up when this logical connection
    /// closes. Errors are classified as for any other operation.
    pub async fn raw_connection_operation<F, Fut>(&self, op: F) -> Result<RawResult>
    where
        F: FnOnce(Arc<dyn Connection>) -> Fut,
        Fut: Future<Output = Result<RawOutcome>>,
    {
        let pc = self.logical.open()?;
        let outcome = pc.observe(op(pc.physical().clone()).await).await?;
        Ok(match outcome {
            RawOutcome::Unit => RawResult::Unit,
            RawOutcome::Value(value) => RawResult::Value(value),
            RawOutcome::Statement(inner) => {
                let track = pc.track_statement(TrackedStatement::Plain(inner.clone()));
                RawResult::Statement(ProxyStatement {
                    logical: self.logical.clone(),
                    track,
                    inner,
                })
            }
            RawOutcome::PreparedStatement(inner) => {
                let track = pc.track_statement(TrackedStatement::Prepared(inner.clone()));
                RawResult::PreparedStatement(ProxyPreparedStatement {
                    logical: self.logical.clone(),
                    track,
                    inner,
                    cached: false,
                })
            }
            RawOutcome::ResultSet(inner) => {
                let track = pc.track_result_set(None, inner.clone());
                RawResult::ResultSet(ProxyResultSet {
                    logical: self.logical.clone(),
                    owner: None,
                    track,
                    inner,
                })
            }
        })
    }

    /// Close the logical connection, resolving any open transaction
    pub async fn close(&self) -> Result<()> {
        self.logical.close(false).await
    }

    /// Close the logical connection when the caller has already committed or
    /// rolled back; skips transaction resolution.
    pub async fn close_resolved(&self) -> Result<()> {
        self.logical.close(true).await
    }
}

impl std::fmt::Debug for ProxyConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConnection")
            .field("connection_id", &self.connection_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Client handle to an unprepared statement
pub struct ProxyStatement {
    logical: Arc<LogicalConnection>,
    track: TrackId,
    inner: Arc<dyn Statement>,
}

impl ProxyStatement {
    fn open(&self) -> Result<&Arc<PooledConnection>> {
        let pc = self.logical.open()?;
        if !pc.is_tracked(self.track) {
            return Err(CisternError::Closed("statement is closed".into()));
        }
        Ok(pc)
    }

    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<StatementResult> {
        let pc = self.open()?;
        pc.observe(self.inner.execute(sql, params).await).await
    }

    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<ProxyResultSet> {
        let pc = self.open()?;
        let inner = pc.observe(self.inner.query(sql, params).await).await?;
        let track = pc.track_result_set(Some(self.track), inner.clone());
        Ok(ProxyResultSet {
            logical: self.logical.clone(),
            owner: Some(self.track),
            track,
            inner,
        })
    }

    pub async fn cancel(&self) -> Result<()> {
        let pc = self.open()?;
        pc.observe(self.inner.cancel().await).await
    }

    /// The logical connection this statement was created on
    pub fn connection(&self) -> ProxyConnection {
        ProxyConnection::from_logical(self.logical.clone())
    }

    pub fn is_closed(&self) -> bool {
        !self.logical.is_open() || !self.logical.pooled.is_tracked(self.track)
    }

    /// Close the statement and every result set it opened
    pub async fn close(&self) -> Result<()> {
        self.logical.pooled.close_statement(self.track).await
    }
}

/// Client handle to a prepared or callable statement
pub struct ProxyPreparedStatement {
    logical: Arc<LogicalConnection>,
    track: TrackId,
    inner: Arc<dyn PreparedStatement>,
    cached: bool,
}

impl ProxyPreparedStatement {
    fn open(&self) -> Result<&Arc<PooledConnection>> {
        let pc = self.logical.open()?;
        if !pc.is_tracked(self.track) {
            return Err(CisternError::Closed("statement is closed".into()));
        }
        Ok(pc)
    }

    /// Whether closing returns this statement to the statement cache
    pub fn is_cached(&self) -> bool {
        self.cached
    }

    pub async fn execute(&self, params: &[Value]) -> Result<StatementResult> {
        let pc = self.open()?;
        pc.observe(self.inner.execute(params).await).await
    }

    pub async fn query(&self, params: &[Value]) -> Result<ProxyResultSet> {
        let pc = self.open()?;
        let inner = pc.observe(self.inner.query(params).await).await?;
        let track = pc.track_result_set(Some(self.track), inner.clone());
        Ok(ProxyResultSet {
            logical: self.logical.clone(),
            owner: Some(self.track),
            track,
            inner,
        })
    }

    pub async fn clear_parameters(&self) -> Result<()> {
        let pc = self.open()?;
        pc.observe(self.inner.clear_parameters().await).await
    }

    pub async fn cancel(&self) -> Result<()> {
        let pc = self.open()?;
        pc.observe(self.inner.cancel().await).await
    }

    /// Run `op` against the unwrapped statement; returned result sets are
    /// tracked under this statement
    pub async fn raw_statement_operation<F, Fut>(&self, op: F) -> Result<RawResult>
    where
        F: FnOnce(Arc<dyn PreparedStatement>) -> Fut,
        Fut: Future<Output = Result<RawOutcome>>,
    {
        let pc = self.open()?;
        let outcome = pc.observe(op(self.inner.clone()).await).await?;
        match outcome {
            RawOutcome::Unit => Ok(RawResult::Unit),
            RawOutcome::Value(value) => Ok(RawResult::Value(value)),
            RawOutcome::ResultSet(inner) => {
                let track = pc.track_result_set(Some(self.track), inner.clone());
                Ok(RawResult::ResultSet(ProxyResultSet {
                    logical: self.logical.clone(),
                    owner: Some(self.track),
                    track,
                    inner,
                }))
            }
            RawOutcome::Statement(_) | RawOutcome::PreparedStatement(_) => {
                Err(CisternError::NotSupported(
                    "a statement operation cannot return another statement".into(),
                ))
            }
        }
    }

    pub fn connection(&self) -> ProxyConnection {
        ProxyConnection::from_logical(self.logical.clone())
    }

    pub fn is_closed(&self) -> bool {
        !self.logical.is_open() || !self.logical.pooled.is_tracked(self.track)
    }

    /// Close the statement's result sets and release it: cached statements
    /// return to the cache, others are closed
    pub async fn close(&self) -> Result<()> {
        self.logical.pooled.close_statement(self.track).await
    }
}

/// Client handle to a result set
pub struct ProxyResultSet {
    logical: Arc<LogicalConnection>,
    owner: Option<TrackId>,
    track: TrackId,
    inner: Arc<dyn ResultSet>,
}

impl ProxyResultSet {
    pub fn columns(&self) -> Vec<ColumnMeta> {
        self.inner.columns()
    }

    pub async fn next(&self) -> Result<Option<Row>> {
        let pc = self.logical.open()?;
        if self.inner.is_closed() {
            return Err(CisternError::Closed("result set is closed".into()));
        }
        pc.observe(self.inner.next().await).await
    }

    pub fn is_closed(&self) -> bool {
        !self.logical.is_open() || self.inner.is_closed()
    }

    pub async fn close(&self) -> Result<()> {
        self.logical
            .pooled
            .close_result_set(self.owner, self.track)
            .await
    }
}
