//! Pooled connection lifecycle
//!
//! A [`PooledConnection`] owns one physical connection and hands out at most
//! one logical [`ProxyConnection`] at a time. Everything a client opens
//! through the proxy is tracked so that closing the logical connection can
//! return the physical one to a clean state.

mod connection;
mod events;
mod proxy;
mod session;


pub use connection::{ConnectionId, LifecycleOptions, PooledConnection};
pub use events::{ConnectionEventListener, ListenerId};
pub use proxy::{
    ProxyConnection, ProxyPreparedStatement, ProxyResultSet, ProxyStatement, RawOutcome,
    RawResult,
};
