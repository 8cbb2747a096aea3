//! cistern pool - connection pooling over cistern-core drivers
//!
//! This crate multiplexes a bounded set of physical connections across many
//! logical checkouts. It tests and recycles connections and caches prepared
//! statements per physical connection.
//!
//! The usual entry point is [`PooledDataSource`]:
//!
//! ```ignore
//! let ds = PooledDataSource::builder()
//!     .driver(driver)
//!     .config(PoolConfig::new(2, 10).with_max_statements(100))
//!     .build()?;
//! let conn = ds.get_connection().await?;
//! let stmt = conn.prepare_statement("SELECT name FROM users WHERE id = ?").await?;
//! let rows = stmt.query(&[Value::Int64(7)]).await?;
//! conn.close().await?;
//! ```

pub mod cache;
mod config;
mod customizer;
mod datasource;
pub mod manager;
pub mod pool;
pub mod pooled;
pub mod registry;
pub mod resource;
mod source;
pub mod tasks;
pub mod tester;

#[cfg(test)]
mod testing;

pub use cache::{CacheBounds, StatementCache, StatementCacheStats, StatementDestroyer};
pub use config::{ConfigChanges, PoolConfig, PoolConfigOverride, UserOverrides};
pub use customizer::ConnectionCustomizer;
pub use datasource::{PooledDataSource, PooledDataSourceBuilder};
pub use manager::{ManagerStats, PoolManager};
pub use pool::{PoolInfrastructure, PooledConnectionPool, PooledPoolStats};
pub use pooled::{
    ConnectionEventListener, ConnectionId, PooledConnection, ProxyConnection,
    ProxyPreparedStatement, ProxyResultSet, ProxyStatement,
};
pub use source::{
    AcquireContext, ConnectionPoolDataSource, SourceCapabilities, WrapperConnectionPoolDataSource,
};
pub use tasks::{TaskRunner, TaskRunnerStats};
pub use tester::{
    ConnectionStatus, ConnectionTester, DefaultConnectionTester, IsValidConnectionTester,
    TestOutcome,
};
