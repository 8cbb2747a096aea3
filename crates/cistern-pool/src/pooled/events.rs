//! Connection event notification

use std::sync::Arc;

use async_trait::async_trait;
use cistern_core::CisternError;

use super::connection::PooledConnection;
use crate::tester::ConnectionStatus;

/// Receives lifecycle events from a [`PooledConnection`]
#[async_trait]
pub trait ConnectionEventListener: Send + Sync {
    /// The logical connection was closed and the physical connection reset
    async fn connection_closed(&self, connection: Arc<PooledConnection>);

    /// An error invalidated the connection. Fired at most once per
    /// physical connection.
    async fn connection_error_occurred(
        &self,
        connection: Arc<PooledConnection>,
        status: ConnectionStatus,
        error: CisternError,
    );
}

/// Handle for removing a registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);
