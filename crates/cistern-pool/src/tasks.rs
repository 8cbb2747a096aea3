//! Bounded runner for administrative tasks
//!
//! Acquisitions, destroys, idle tests and deferred statement closes all run
//! here so that at most `num_threads` of them are in flight at once. A task
//! that outlives `max_task_time` is abandoned.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, Semaphore};

#[derive(Default)]
struct TaskCounts {
    active: AtomicUsize,
    pending: AtomicUsize,
    abandoned: AtomicUsize,
    finished: Notify,
}

/// Bounded set of tokio tasks with active and pending counts
pub struct TaskRunner {
    name: String,
    num_threads: usize,
    permits: Arc<Semaphore>,
    max_task_time: Option<Duration>,
    counts: Arc<TaskCounts>,
    closed: AtomicBool,
}

impl TaskRunner {
    /// Create a runner allowing `num_threads` concurrent tasks
    pub fn new(name: impl Into<String>, num_threads: usize) -> Self {
        let num_threads = num_threads.max(1);
        Self {
            name: name.into(),
            num_threads,
            permits: Arc::new(Semaphore::new(num_threads)),
            max_task_time: None,
            counts: Arc::new(TaskCounts::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// Abandon tasks that run longer than `max_task_time`
    pub fn with_max_task_time(mut self, max_task_time: Option<Duration>) -> Self {
        self.max_task_time = max_task_time;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Schedule `task`. Returns `false` if the runner is closed or there is no
    /// tokio runtime to run it on.
    pub fn spawn<F>(&self, label: &'static str, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            tracing::debug!(runner = %self.name, task = label, "runner closed, task dropped");
            return false;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(runner = %self.name, task = label, "no tokio runtime, task dropped");
            return false;
        };

        let permits = self.permits.clone();
        let counts = self.counts.clone();
        let max_task_time = self.max_task_time;
        let runner = self.name.clone();
        counts.pending.fetch_add(1, Ordering::SeqCst);

        handle.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                counts.pending.fetch_sub(1, Ordering::SeqCst);
                counts.finished.notify_waiters();
                return;
            };
            counts.active.fetch_add(1, Ordering::SeqCst);
            counts.pending.fetch_sub(1, Ordering::SeqCst);

            match max_task_time {
                Some(limit) => {
                    if tokio::time::timeout(limit, task).await.is_err() {
                        counts.abandoned.fetch_add(1, Ordering::SeqCst);
                        tracing::warn!(
                            runner = %runner,
                            task = label,
                            limit_ms = limit.as_millis() as u64,
                            "administrative task exceeded max_administrative_task_time and was abandoned"
                        );
                    }
                }
                None => task.await,
            }
            counts.active.fetch_sub(1, Ordering::SeqCst);
            counts.finished.notify_waiters();
        });
        true
    }

    /// Wait until no task is active or pending
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

    /// Stop accepting tasks; pending tasks are dropped, active ones finish
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.permits.close();
            tracing::debug!(runner = %self.name, "task runner closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub fn active_count(&self) -> usize {
        self.counts.active.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        self.counts.pending.load(Ordering::SeqCst)
    }

    pub fn abandoned_count(&self) -> usize {
        self.counts.abandoned.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> TaskRunnerStats {
        let active = self.active_count();
        TaskRunnerStats {
            num_threads: self.num_threads,
            active,
            idle: self.num_threads.saturating_sub(active),
            pending: self.pending_count(),
        }
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        self.permits.close();
    }
}

/// Snapshot of a [`TaskRunner`]'s load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskRunnerStats {
    pub num_threads: usize,
    pub active: usize,
    pub idle: usize,
    pub pending: usize,
}

impl TaskRunnerStats {
    /// Sum two snapshots, for aggregating over several runners
    pub fn merge(self, other: TaskRunnerStats) -> TaskRunnerStats {
        TaskRunnerStats {
            num_threads: self.num_threads + other.num_threads,
            active: self.active + other.active,
            idle: self.idle + other.idle,
            pending: self.pending + other.pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_runs_tasks_and_waits_idle() {
        let runner = TaskRunner::new("test", 2);
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let done = done.clone();
            assert!(runner.spawn("count", async move {
                done.fetch_add(1, Ordering::SeqCst);
            }));
        }
        runner.wait_idle().await;

        assert_eq!(done.load(Ordering::SeqCst), 5);
        assert_eq!(runner.stats().active, 0);
        assert_eq!(runner.stats().idle, 2);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let runner = TaskRunner::new("bounded", 2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..6 {
            let running = running.clone();
            let peak = peak.clone();
            runner.spawn("sleep", async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }
        runner.wait_idle().await;

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlong_task_is_abandoned() {
        let runner =
            TaskRunner::new("slow", 1).with_max_task_time(Some(Duration::from_millis(50)));
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();

        runner.spawn("hang", async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            flag.store(true, Ordering::SeqCst);
        });
        runner.wait_idle().await;

        assert!(!finished.load(Ordering::SeqCst));
        assert_eq!(runner.abandoned_count(), 1);
    }

    #[tokio::test]
    async fn test_closed_runner_rejects_tasks() {
        let runner = TaskRunner::new("closed", 1);
        runner.close();
        assert!(!runner.spawn("noop", async {}));
        assert!(runner.is_closed());
    }
}
