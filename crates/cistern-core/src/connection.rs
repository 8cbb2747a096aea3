//! Physical connection, statement and result set traits
//!
//! These are the contracts a driver implements. The pool wraps every one of
//! them in a tracking proxy before handing it to client code.

use crate::{
    ColumnMeta, CisternError, Holdability, IsolationLevel, QueryResult, Result, Row,
    SessionDefaults, StatementOptions, StatementRequest, StatementResult, TypeMap, Value,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Handle for cancelling a running query from any thread.
///
/// This trait allows database drivers to provide a way to interrupt
/// long-running queries. The handle is safe to call from any thread
/// and can be called multiple times (subsequent calls are no-ops).
pub trait QueryCancelHandle: Send + Sync {
    /// Cancel the currently running query on the associated connection.
    fn cancel(&self);
}

/// A physical database connection
#[async_trait]
pub trait Connection: Send + Sync {
    /// Get the driver name (e.g., "sqlite", "postgresql", "mysql")
    fn driver_name(&self) -> &str;

    /// Execute a statement that modifies data (INSERT/UPDATE/DELETE)
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<StatementResult>;

    /// Execute a query that returns rows (SELECT)
    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult>;

    /// Create an unprepared statement
    async fn create_statement(&self, options: &StatementOptions) -> Result<Arc<dyn Statement>>;

    /// Prepare a statement or stored procedure call
    async fn prepare(&self, request: &StatementRequest) -> Result<Arc<dyn PreparedStatement>>;

    async fn auto_commit(&self) -> Result<bool>;

    async fn set_auto_commit(&self, auto_commit: bool) -> Result<()>;

    async fn commit(&self) -> Result<()>;

    async fn rollback(&self) -> Result<()>;

    async fn transaction_isolation(&self) -> Result<IsolationLevel>;

    async fn set_transaction_isolation(&self, level: IsolationLevel) -> Result<()>;

    async fn catalog(&self) -> Result<Option<String>>;

    async fn set_catalog(&self, catalog: Option<&str>) -> Result<()>;

    async fn holdability(&self) -> Result<Holdability>;

    async fn set_holdability(&self, holdability: Holdability) -> Result<()>;

    async fn is_read_only(&self) -> Result<bool>;

    async fn set_read_only(&self, read_only: bool) -> Result<()>;

    async fn type_map(&self) -> Result<TypeMap> {
        Ok(TypeMap::new())
    }

    async fn set_type_map(&self, _type_map: TypeMap) -> Result<()> {
        Err(CisternError::NotSupported(
            "type maps are not supported by this driver".into(),
        ))
    }

    /// Read every resettable session property at once.
    async fn session_defaults(&self) -> Result<SessionDefaults> {
        Ok(SessionDefaults {
            isolation: self.transaction_isolation().await?,
            catalog: self.catalog().await?,
            holdability: self.holdability().await?,
            read_only: self.is_read_only().await?,
            type_map: self.type_map().await?,
        })
    }

    /// Driver-native liveness probe.
    ///
    /// Drivers without one return [`CisternError::NotSupported`], which makes
    /// connection testers fall back to a metadata probe.
    async fn is_valid(&self, _timeout: Duration) -> Result<bool> {
        Err(CisternError::NotSupported(
            "is_valid is not supported by this driver".into(),
        ))
    }

    /// Metadata lookup: whether a table with this name exists
    async fn table_exists(&self, table: &str) -> Result<bool>;

    /// Return and clear the warnings accumulated on this connection
    async fn take_warnings(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    /// Close the connection
    async fn close(&self) -> Result<()>;

    /// Check if the connection is closed
    fn is_closed(&self) -> bool;

    /// Get a handle that can be used to cancel running queries.
    ///
    /// Returns `None` if the driver does not support query cancellation.
    fn cancel_handle(&self) -> Option<Arc<dyn QueryCancelHandle>> {
        None
    }
}

/// An unprepared statement; SQL is supplied per execution
#[async_trait]
pub trait Statement: Send + Sync {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<StatementResult>;

    async fn query(&self, sql: &str, params: &[Value]) -> Result<Arc<dyn ResultSet>>;

    /// Cancel whatever this statement is currently executing
    async fn cancel(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// A prepared statement or stored procedure call
#[async_trait]
pub trait PreparedStatement: Send + Sync {
    /// Execute the prepared statement with parameters
    async fn execute(&self, params: &[Value]) -> Result<StatementResult>;

    /// Query the prepared statement with parameters
    async fn query(&self, params: &[Value]) -> Result<Arc<dyn ResultSet>>;

    /// Forget any bound parameter state
    async fn clear_parameters(&self) -> Result<()> {
        Ok(())
    }

    async fn cancel(&self) -> Result<()>;

    /// Close/deallocate the prepared statement
    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// A forward-only cursor over query rows
#[async_trait]
pub trait ResultSet: Send + Sync {
    fn columns(&self) -> Vec<ColumnMeta>;

    /// Advance the cursor, returning `None` at the end
    async fn next(&self) -> Result<Option<Row>>;

    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// A [`ResultSet`] backed by an already materialized [`QueryResult`].
///
/// Drivers that fetch eagerly can return this instead of writing their own
/// cursor type.
pub struct MaterializedResultSet {
    columns: Vec<ColumnMeta>,
    rows: Mutex<VecDeque<Row>>,
    closed: AtomicBool,
}

impl MaterializedResultSet {
    pub fn new(result: QueryResult) -> Self {
        Self {
            columns: result.columns,
            rows: Mutex::new(result.rows.into()),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ResultSet for MaterializedResultSet {
    fn columns(&self) -> Vec<ColumnMeta> {
        self.columns.clone()
    }

    async fn next(&self) -> Result<Option<Row>> {
        if self.is_closed() {
            return Err(CisternError::Closed("result set is closed".into()));
        }
        Ok(self.rows.lock().pop_front())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.rows.lock().clear();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_materialized_result_set_iterates_then_closes() {
        let columns = vec!["id".to_string()];
        let result = QueryResult::from_rows(vec![
            Row::new(columns.clone(), vec![Value::Int32(1)]),
            Row::new(columns, vec![Value::Int32(2)]),
        ]);
        let rs = MaterializedResultSet::new(result);

        assert_eq!(rs.columns().len(), 1);
        assert_eq!(rs.next().await.unwrap().unwrap().get(0), Some(&Value::Int32(1)));
        assert_eq!(rs.next().await.unwrap().unwrap().get(0), Some(&Value::Int32(2)));
        assert!(rs.next().await.unwrap().is_none());

        rs.close().await.unwrap();
        assert!(rs.is_closed());
        assert!(matches!(rs.next().await, Err(CisternError::Closed(_))));
    }
}
