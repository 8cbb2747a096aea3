//! Per-connection in-use lock

use std::sync::Arc;

use cistern_core::{CisternError, Result};
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Mutual exclusion between foreground use of a physical connection and
/// background work on it (tests, deferred statement closes).
///
/// A connection is *marked* while a client or a refurbish step owns it.
/// Background work takes the lock transiently and therefore waits for the
/// mark to be released.
pub struct InUseLock {
    permit: Arc<Semaphore>,
    held: Mutex<Option<OwnedSemaphorePermit>>,
}

impl InUseLock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            permit: Arc::new(Semaphore::new(1)),
            held: Mutex::new(None),
        })
    }

    /// Mark the connection in use, waiting for any current holder
    pub async fn mark(&self) -> Result<()> {
        let permit = self
            .permit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CisternError::Closed("connection has been destroyed".into()))?;
        *self.held.lock() = Some(permit);
        Ok(())
    }

    /// Mark the connection in use if nobody holds it
    pub fn try_mark(&self) -> bool {
        match self.permit.clone().try_acquire_owned() {
            Ok(permit) => {
                *self.held.lock() = Some(permit);
                true
            }
            Err(_) => false,
        }
    }

    /// Release the mark. Returns whether the connection was marked.
    pub fn unmark(&self) -> bool {
        self.held.lock().take().is_some()
    }

    pub fn is_marked(&self) -> bool {
        self.held.lock().is_some()
    }

    /// Hold the lock for the lifetime of the returned permit.
    ///
    /// Returns `None` once the lock is closed; the connection is gone and
    /// there is nothing left to protect.
    pub async fn hold(&self) -> Option<OwnedSemaphorePermit> {
        self.permit.clone().acquire_owned().await.ok()
    }

    /// Release every waiter; used when the connection is destroyed
    pub fn close(&self) {
        self.permit.close();
        self.held.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.permit.is_closed()
    }
}
