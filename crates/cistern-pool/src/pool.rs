//! Per-auth connection pools
//!
//! A [`PooledConnectionPool`] serves one [`DbAuth`](cistern_core::DbAuth).
//! It drives a [`ResourcePool`](crate::resource::ResourcePool) of
//! [`PooledConnection`](crate::pooled::PooledConnection)s, running
//! customizer hooks and connection tests under each connection's in-use
//! lock, and reacts to connection errors by evicting one connection or
//! resetting the whole pool.
//!
//! # Example
//!
//! ```ignore
//! let pool = PooledConnectionPool::new(auth, config, source, &infrastructure).await?;
//! let conn = pool.get_connection().await?;
//! conn.execute("UPDATE accounts SET active = true", &[]).await?;
//! conn.close().await?; // back to the pool
//! ```

mod pooled_pool;
mod resources;
mod stats;
mod test_table;

#[cfg(test)]
mod tests;

pub use pooled_pool::{PoolInfrastructure, PooledConnectionPool};
pub use stats::PooledPoolStats;
