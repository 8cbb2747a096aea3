//! Deferred, asynchronous statement closing

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use cistern_core::PreparedStatement;
use tokio::sync::Notify;

use super::in_use::InUseLock;
use crate::tasks::TaskRunner;

#[derive(Default)]
struct DestroyCounts {
    active: AtomicUsize,
    pending: AtomicUsize,
    failed: AtomicUsize,
    finished: Notify,
}

/// Keeps the counts right however a close task ends: finished, abandoned
/// on timeout or dropped unstarted by a closed runner.
struct Tracked {
    counts: Arc<DestroyCounts>,
    started: bool,
}

impl Tracked {
    fn start(&mut self) {
        self.counts.active.fetch_add(1, Ordering::SeqCst);
        self.counts.pending.fetch_sub(1, Ordering::SeqCst);
        self.started = true;
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        if self.started {
            self.counts.active.fetch_sub(1, Ordering::SeqCst);
        } else {
            self.counts.pending.fetch_sub(1, Ordering::SeqCst);
        }
        self.counts.finished.notify_waiters();
    }
}

/// Closes statements off the caller's path.
///
/// Each close takes a [`TaskRunner`] slot, then waits for the owning
/// connection's [`InUseLock`] and runs while holding it. Close failures are logged and
/// counted, never returned.
pub struct StatementDestroyer {
    runner: Arc<TaskRunner>,
    dedicated: bool,
    counts: Arc<DestroyCounts>,
}

impl StatementDestroyer {
    /// A destroyer with its own runner of `threads` tasks
    pub fn dedicated(threads: usize, max_task_time: Option<Duration>) -> Arc<Self> {
        let runner = TaskRunner::new("statement-destroyer", threads).with_max_task_time(max_task_time);
        Arc::new(Self {
            runner: Arc::new(runner),
            dedicated: true,
            counts: Arc::new(DestroyCounts::default()),
        })
    }

    /// A destroyer sharing an existing runner
    pub fn shared(runner: Arc<TaskRunner>) -> Arc<Self> {
        Arc::new(Self {
            runner,
            dedicated: false,
            counts: Arc::new(DestroyCounts::default()),
        })
    }

    pub fn is_dedicated(&self) -> bool {
        self.dedicated
    }

    /// Close `statement` once `lock` (if any) is free.
    ///
    /// The close takes a runner slot first and only then waits for the
    /// connection, so a close queued behind other helper work never holds
    /// the connection's lock.
    pub fn destroy(&self, statement: Arc<dyn PreparedStatement>, lock: Option<Arc<InUseLock>>) {
        self.counts.pending.fetch_add(1, Ordering::SeqCst);
        let mut tracked = Tracked {
            counts: self.counts.clone(),
            started: false,
        };

        let scheduled = self.runner.spawn("close_statement", async move {
            let guard = match &lock {
                Some(lock) => lock.hold().await,
                None => None,
            };
            tracked.start();
            if let Err(e) = statement.close().await {
                tracked.counts.failed.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(error = %e, "deferred statement close failed");
            }
            drop(guard);
        });
        if !scheduled {
            tracing::warn!(runner = %self.runner.name(), "statement destroyer unavailable, statement will not be closed");
        }
    }

    /// Closes started and not yet finished
    pub fn active_count(&self) -> usize {
        self.counts.active.load(Ordering::SeqCst)
    }

    /// Closes waiting for their connection or for a free task
    pub fn pending_count(&self) -> usize {
        self.counts.pending.load(Ordering::SeqCst)
    }

    pub fn failed_count(&self) -> usize {
        self.counts.failed.load(Ordering::SeqCst)
    }

    /// Wait until every scheduled close has finished
    pub async fn wait_idle(&self) {
        loop {
            let finished = self.counts.finished.notified();
            tokio::pin!(finished);
            finished.as_mut().enable();
            if self.active_count() == 0 && self.pending_count() == 0 {
                return;
            }
            finished.await;
        }
    }

    /// Stop a dedicated runner; a shared one belongs to its owner
    pub fn close(&self) {
        if self.dedicated {
            self.runner.close();
        }
    }
}
