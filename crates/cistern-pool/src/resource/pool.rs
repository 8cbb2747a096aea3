//! Resource pool implementation

use std::backtrace::Backtrace;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use cistern_core::{CisternError, Result};
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::config::ResourcePoolConfig;
use super::stats::{FailureRecord, ResourcePoolStats};
use crate::tasks::TaskRunner;

/// Callbacks a [`ResourcePool`] uses to create, check and destroy resources
#[async_trait]
pub trait ResourceManager: Send + Sync + 'static {
    type Resource: Clone + Send + Sync + 'static;

    /// Stable identity of a resource within this pool
    fn resource_key(&self, resource: &Self::Resource) -> u64;

    async fn acquire_resource(&self) -> Result<Self::Resource>;

    /// Prepare an idle resource for a client. A `ConnectionInvalid` or
    /// `DatabaseInvalid` error discards the resource and the checkout tries
    /// another; any other error fails the checkout.
    async fn refurbish_resource_on_checkout(&self, resource: &Self::Resource) -> Result<()>;

    async fn refurbish_resource_on_checkin(&self, resource: &Self::Resource) -> Result<()>;

    async fn refurbish_idle_resource(&self, resource: &Self::Resource) -> Result<()>;

    /// `checked_out` is true when a client still held the resource
    async fn destroy_resource(&self, resource: &Self::Resource, checked_out: bool) -> Result<()>;
}

enum Phase {
    Idle { since: Instant },
    /// Being refurbished or tested; neither idle nor with a client
    Busy,
    CheckedOut {
        since: Instant,
        backtrace: Option<String>,
    },
}

struct Entry<R> {
    resource: R,
    created_at: Instant,
    phase: Phase,
    /// Destroy instead of returning to idle
    broken: bool,
}

struct PoolState<R> {
    entries: HashMap<u64, Entry<R>>,
    idle: VecDeque<u64>,
    /// Checked out when the pool was reset; destroyed at checkin
    excluded: HashSet<u64>,
    pending_acquires: usize,
    waiting: usize,
    /// Bumped whenever a full acquisition round fails
    failure_generation: u64,
    closed: bool,
    broken: bool,
    failed_checkouts: u64,
    failed_checkins: u64,
    failed_idle_tests: u64,
    last_acquisition_failure: Option<FailureRecord>,
    last_checkout_failure: Option<FailureRecord>,
    last_checkin_failure: Option<FailureRecord>,
    last_idle_test_failure: Option<FailureRecord>,
}

impl<R> PoolState<R> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            idle: VecDeque::new(),
            excluded: HashSet::new(),
            pending_acquires: 0,
            waiting: 0,
            failure_generation: 0,
            closed: false,
            broken: false,
            failed_checkouts: 0,
            failed_checkins: 0,
            failed_idle_tests: 0,
            last_acquisition_failure: None,
            last_checkout_failure: None,
            last_checkin_failure: None,
            last_idle_test_failure: None,
        }
    }

    fn awaiting_checkin(&self) -> usize {
        self.entries
            .values()
            .filter(|e| matches!(e.phase, Phase::CheckedOut { .. }))
            .count()
    }

    fn remove(&mut self, key: u64) -> Option<Entry<R>> {
        self.idle.retain(|k| *k != key);
        self.excluded.remove(&key);
        self.entries.remove(&key)
    }

    fn closed_error(&self) -> CisternError {
        if self.broken {
            let cause = self
                .last_acquisition_failure
                .as_ref()
                .map(|f| f.message.as_str())
                .unwrap_or("unknown");
            CisternError::CannotAcquire(format!(
                "pool was closed after an acquisition failure: {cause}"
            ))
        } else {
            CisternError::Closed("resource pool is closed".into())
        }
    }
}

struct Shared<M: ResourceManager> {
    name: String,
    manager: M,
    config: ResourcePoolConfig,
    runner: Arc<TaskRunner>,
    state: Mutex<PoolState<M::Resource>>,
    /// Signaled whenever checkouts should re-examine the pool
    available: Notify,
}

/// Bounded pool of resources created and checked by a [`ResourceManager`].
///
/// Acquisitions run on the shared [`TaskRunner`]. Idle testing and
/// expiration run on background loops that stop when the pool closes.
pub struct ResourcePool<M: ResourceManager> {
    shared: Arc<Shared<M>>,
}

enum Next<R> {
    Refurbish(u64, R),
    Wait(usize),
}

/// Keeps the waiting count accurate when a checkout is cancelled
struct WaitGuard<'a, M: ResourceManager> {
    shared: &'a Shared<M>,
    registered: bool,
}

impl<M: ResourceManager> Drop for WaitGuard<'_, M> {
    fn drop(&mut self) {
        if self.registered {
            let mut state = self.shared.state.lock();
            state.waiting = state.waiting.saturating_sub(1);
        }
    }
}

impl<M: ResourceManager> ResourcePool<M> {
    /// Create the pool, acquire its initial resources and start the
    /// maintenance loops.
    ///
    /// Initial acquisition failures are logged; checkouts retry later. With
    /// `break_after_acquire_failure` a failed initial round closes the pool.
    pub async fn new(
        name: impl Into<String>,
        manager: M,
        config: ResourcePoolConfig,
        runner: Arc<TaskRunner>,
    ) -> Self {
        let shared = Arc::new(Shared {
            name: name.into(),
            manager,
            config,
            runner,
            state: Mutex::new(PoolState::new()),
            available: Notify::new(),
        });

        let initial = shared.config.initial_size();
        shared.state.lock().pending_acquires += initial;
        join_all((0..initial).map(|_| shared.clone().acquire_with_retry())).await;
        tracing::debug!(
            pool = %shared.name,
            size = shared.state.lock().entries.len(),
            "resource pool initialized"
        );

        shared.start_maintenance();
        Self { shared }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn manager(&self) -> &M {
        &self.shared.manager
    }

    pub fn config(&self) -> &ResourcePoolConfig {
        &self.shared.config
    }

    /// Check out a resource, waiting up to the configured checkout timeout
    pub async fn checkout(&self) -> Result<M::Resource> {
        self.checkout_with_timeout(self.shared.config.checkout_timeout())
            .await
    }

    /// Check out a resource, waiting up to `timeout` (`None` waits forever).
    ///
    /// Fails with `CheckoutTimeout` when the wait runs out and with
    /// `CannotAcquire` when an acquisition round fails while waiting.
    pub async fn checkout_with_timeout(&self, timeout: Option<Duration>) -> Result<M::Resource> {
        let result = self.shared.clone().checkout(timeout).await;
        if let Err(e) = &result {
            let mut state = self.shared.state.lock();
            state.failed_checkouts += 1;
            state.last_checkout_failure = Some(FailureRecord::now(e.to_string()));
        }
        result
    }

    /// Return a checked-out resource.
    ///
    /// Broken or excluded resources are destroyed. A failed checkin
    /// refurbishment destroys the resource and returns the error.
    pub async fn checkin(&self, resource: &M::Resource) -> Result<()> {
        self.shared.clone().checkin(resource).await
    }

    /// Mark a resource as unusable. Idle resources are destroyed at once,
    /// checked-out ones when they come back.
    pub async fn mark_broken(&self, resource: &M::Resource) {
        self.shared.clone().mark_broken(resource).await
    }

    /// Destroy every idle resource and exclude every checked-out one, then
    /// refill to the minimum size
    pub async fn reset_pool(&self) {
        self.shared.clone().reset_pool().await
    }

    /// Destroy every resource, including checked-out ones, and fail pending
    /// and future checkouts
    pub async fn close(&self) {
        self.shared.close(true).await
    }

    /// Destroy idle resources and fail future checkouts, but leave
    /// checked-out resources with their clients until they are returned
    pub async fn close_gracefully(&self) {
        self.shared.close(false).await
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Whether the pool closed itself after a failed acquisition round
    pub fn is_broken(&self) -> bool {
        self.shared.state.lock().broken
    }

    pub fn size(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    pub fn available(&self) -> usize {
        self.shared.state.lock().idle.len()
    }

    pub fn awaiting_checkin(&self) -> usize {
        self.shared.state.lock().awaiting_checkin()
    }

    pub fn excluded(&self) -> usize {
        self.shared.state.lock().excluded.len()
    }

    pub fn last_acquisition_failure(&self) -> Option<FailureRecord> {
        self.shared.state.lock().last_acquisition_failure.clone()
    }

    pub fn stats(&self) -> ResourcePoolStats {
        let state = self.shared.state.lock();
        ResourcePoolStats {
            size: state.entries.len(),
            available: state.idle.len(),
            awaiting_checkin: state.awaiting_checkin(),
            excluded: state.excluded.len(),
            waiting: state.waiting,
            pending_acquires: state.pending_acquires,
            failed_checkouts: state.failed_checkouts,
            failed_checkins: state.failed_checkins,
            failed_idle_tests: state.failed_idle_tests,
            last_acquisition_failure: state.last_acquisition_failure.clone(),
            last_checkout_failure: state.last_checkout_failure.clone(),
            last_checkin_failure: state.last_checkin_failure.clone(),
            last_idle_test_failure: state.last_idle_test_failure.clone(),
        }
    }
}

impl<M: ResourceManager> Drop for ResourcePool<M> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        if !state.closed {
            tracing::debug!(pool = %self.shared.name, "resource pool dropped without close()");
            state.closed = true;
            self.shared.available.notify_waiters();
        }
    }
}

impl<M: ResourceManager> Shared<M> {
    async fn checkout(self: Arc<Self>, timeout: Option<Duration>) -> Result<M::Resource> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = WaitGuard {
            shared: &self,
            registered: false,
        };
        let start_generation = self.state.lock().failure_generation;

        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(state.closed_error());
                }
                match state.idle.pop_front() {
                    Some(key) => match state.entries.get_mut(&key) {
                        Some(entry) => {
                            entry.phase = Phase::Busy;
                            Next::Refurbish(key, entry.resource.clone())
                        }
                        None => continue,
                    },
                    None => {
                        if state.failure_generation != start_generation {
                            let cause = state
                                .last_acquisition_failure
                                .as_ref()
                                .map(|f| f.message.clone())
                                .unwrap_or_default();
                            return Err(CisternError::CannotAcquire(format!(
                                "could not acquire a resource: {cause}"
                            )));
                        }
                        if !guard.registered {
                            state.waiting += 1;
                            guard.registered = true;
                        }
                        Next::Wait(self.reserve_growth(&mut state))
                    }
                }
            };

            match next {
                Next::Refurbish(key, resource) => {
                    match self.manager.refurbish_resource_on_checkout(&resource).await {
                        Ok(()) => {
                            if self.finish_checkout(key).await {
                                return Ok(resource);
                            }
                        }
                        Err(e) => {
                            let retry = matches!(
                                e,
                                CisternError::ConnectionInvalid(_) | CisternError::DatabaseInvalid(_)
                            );
                            tracing::debug!(pool = %self.name, error = %e, "checkout refurbishment failed");
                            self.discard(key).await;
                            if matches!(e, CisternError::DatabaseInvalid(_)) {
                                self.clone().reset_pool().await;
                            } else {
                                self.refill();
                            }
                            if !retry {
                                return Err(e);
                            }
                        }
                    }
                }
                Next::Wait(grow) => {
                    self.spawn_acquires(grow);
                    match deadline {
                        Some(deadline) => {
                            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                                let waited = timeout.unwrap_or_default();
                                return Err(CisternError::CheckoutTimeout(format!(
                                    "timed out after {}ms waiting for a connection",
                                    waited.as_millis()
                                )));
                            }
                        }
                        None => notified.await,
                    }
                }
            }
        }
    }

    /// Hand a refurbished resource to the client, unless it was broken or
    /// removed meanwhile
    async fn finish_checkout(&self, key: u64) -> bool {
        let backtrace = self
            .config
            .debug_backtraces()
            .then(|| Backtrace::force_capture().to_string());
        let broken = {
            let mut state = self.state.lock();
            let closed = state.closed;
            match state.entries.get_mut(&key) {
                None => return false,
                Some(entry) if entry.broken || closed => true,
                Some(entry) => {
                    entry.phase = Phase::CheckedOut {
                        since: Instant::now(),
                        backtrace,
                    };
                    false
                }
            }
        };
        if broken {
            self.discard(key).await;
        }
        !broken
    }

    /// Number of acquisitions to start now; reserves them as pending
    fn reserve_growth(&self, state: &mut PoolState<M::Resource>) -> usize {
        if state.closed || state.broken {
            return 0;
        }
        let total = state.entries.len() + state.pending_acquires;
        let max = self.config.max_size();
        if total >= max {
            return 0;
        }
        let mut want = self.config.min_size().saturating_sub(total);
        if state.waiting > state.pending_acquires + state.idle.len() {
            want = want.max(self.config.increment());
        }
        let grow = want.min(max - total);
        state.pending_acquires += grow;
        grow
    }

    fn spawn_acquires(self: &Arc<Self>, count: usize) {
        for _ in 0..count {
            let shared = self.clone();
            if !self.runner.spawn("acquire", shared.acquire_with_retry()) {
                let mut state = self.state.lock();
                state.pending_acquires = state.pending_acquires.saturating_sub(1);
            }
        }
    }

    /// One acquisition, retried per the configured attempts and backoff.
    /// The caller must already have counted it as pending.
    async fn acquire_with_retry(self: Arc<Self>) {
        let attempts = self.config.acquire_attempts();
        let mut attempt: u32 = 0;
        loop {
            if self.state.lock().closed {
                self.finish_pending();
                return;
            }
            match self.manager.acquire_resource().await {
                Ok(resource) => {
                    self.add_acquired(resource).await;
                    return;
                }
                Err(e) => {
                    attempt += 1;
                    if attempts != 0 && attempt >= attempts {
                        self.acquisition_failed(e).await;
                        return;
                    }
                    let delay = self.config.acquire_backoff().calculate_delay(attempt - 1);
                    tracing::debug!(
                        pool = %self.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "acquisition attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn finish_pending(&self) {
        let mut state = self.state.lock();
        state.pending_acquires = state.pending_acquires.saturating_sub(1);
        drop(state);
        self.available.notify_waiters();
    }

    async fn add_acquired(&self, resource: M::Resource) {
        let key = self.manager.resource_key(&resource);
        let accepted = {
            let mut state = self.state.lock();
            state.pending_acquires = state.pending_acquires.saturating_sub(1);
            if state.closed {
                false
            } else {
                state.entries.insert(
                    key,
                    Entry {
                        resource: resource.clone(),
                        created_at: Instant::now(),
                        phase: Phase::Idle {
                            since: Instant::now(),
                        },
                        broken: false,
                    },
                );
                state.idle.push_back(key);
                true
            }
        };
        if accepted {
            tracing::trace!(pool = %self.name, resource = key, "resource acquired");
        } else {
            self.destroy(&resource, false).await;
        }
        self.available.notify_waiters();
    }

    async fn acquisition_failed(&self, error: CisternError) {
        let break_pool = self.config.break_after_acquire_failure();
        {
            let mut state = self.state.lock();
            state.pending_acquires = state.pending_acquires.saturating_sub(1);
            state.failure_generation += 1;
            state.last_acquisition_failure = Some(FailureRecord::now(error.to_string()));
        }
        tracing::warn!(
            pool = %self.name,
            attempts = self.config.acquire_attempts(),
            error = %error,
            "acquisition failed after all attempts"
        );
        if break_pool {
            self.state.lock().broken = true;
            tracing::error!(pool = %self.name, "closing pool after acquisition failure");
            self.close(true).await;
        }
        self.available.notify_waiters();
    }

    async fn checkin(self: Arc<Self>, resource: &M::Resource) -> Result<()> {
        let key = self.manager.resource_key(resource);
        let destroy = {
            let mut state = self.state.lock();
            let closed = state.closed;
            let excluded = state.excluded.contains(&key);
            match state.entries.get_mut(&key) {
                None => {
                    tracing::debug!(pool = %self.name, resource = key, "checkin of a resource the pool no longer owns");
                    return Ok(());
                }
                Some(entry) if !matches!(entry.phase, Phase::CheckedOut { .. }) => {
                    tracing::debug!(pool = %self.name, resource = key, "resource checked in twice");
                    return Ok(());
                }
                Some(entry) => {
                    let destroy = closed || excluded || entry.broken;
                    entry.phase = Phase::Busy;
                    destroy
                }
            }
        };

        if destroy {
            self.discard(key).await;
            self.refill();
            return Ok(());
        }

        match self.manager.refurbish_resource_on_checkin(resource).await {
            Ok(()) => {
                self.return_to_idle(key).await;
                Ok(())
            }
            Err(e) => {
                {
                    let mut state = self.state.lock();
                    state.failed_checkins += 1;
                    state.last_checkin_failure = Some(FailureRecord::now(e.to_string()));
                }
                tracing::debug!(pool = %self.name, resource = key, error = %e, "checkin refurbishment failed");
                self.discard(key).await;
                self.refill();
                Err(e)
            }
        }
    }

    /// Put a busy resource back into idle inventory, or destroy it if it was
    /// broken or the pool closed meanwhile
    async fn return_to_idle(self: &Arc<Self>, key: u64) {
        let destroy = {
            let mut state = self.state.lock();
            let closed = state.closed;
            match state.entries.get_mut(&key) {
                None => return,
                Some(entry) if entry.broken || closed => true,
                Some(entry) => {
                    entry.phase = Phase::Idle {
                        since: Instant::now(),
                    };
                    state.idle.push_back(key);
                    false
                }
            }
        };
        if destroy {
            self.discard(key).await;
            self.refill();
        } else {
            self.available.notify_waiters();
        }
    }

    async fn mark_broken(self: Arc<Self>, resource: &M::Resource) {
        let key = self.manager.resource_key(resource);
        let idle = {
            let mut state = self.state.lock();
            match state.entries.get_mut(&key) {
                None => return,
                Some(entry) => {
                    entry.broken = true;
                    matches!(entry.phase, Phase::Idle { .. })
                }
            }
        };
        tracing::debug!(pool = %self.name, resource = key, idle, "resource marked broken");
        if idle {
            self.discard(key).await;
            self.refill();
        }
    }

    async fn reset_pool(self: Arc<Self>) {
        let idle: Vec<M::Resource> = {
            let mut state = self.state.lock();
            let keys: Vec<u64> = state.idle.drain(..).collect();
            let idle = keys
                .iter()
                .filter_map(|key| state.entries.remove(key))
                .map(|entry| entry.resource)
                .collect();
            let outstanding: Vec<u64> = state.entries.keys().copied().collect();
            for key in outstanding {
                if let Some(entry) = state.entries.get_mut(&key) {
                    entry.broken = true;
                    if matches!(entry.phase, Phase::CheckedOut { .. }) {
                        state.excluded.insert(key);
                    }
                }
            }
            idle
        };
        tracing::info!(pool = %self.name, destroyed = idle.len(), "resetting resource pool");
        join_all(idle.iter().map(|r| self.destroy(r, false))).await;
        self.refill();
        self.available.notify_waiters();
    }

    async fn close(&self, include_checked_out: bool) {
        let entries: Vec<(M::Resource, bool)> = {
            let mut state = self.state.lock();
            if state.closed && state.entries.is_empty() {
                return;
            }
            state.closed = true;
            state.idle.clear();
            let keys: Vec<u64> = state
                .entries
                .iter()
                .filter(|(_, e)| {
                    include_checked_out || !matches!(e.phase, Phase::CheckedOut { .. })
                })
                .map(|(key, _)| *key)
                .collect();
            keys.into_iter()
                .filter_map(|key| state.remove(key))
                .map(|e| {
                    let checked_out = matches!(e.phase, Phase::CheckedOut { .. });
                    (e.resource, checked_out)
                })
                .collect()
        };
        self.available.notify_waiters();
        tracing::debug!(
            pool = %self.name,
            destroyed = entries.len(),
            include_checked_out,
            "closing resource pool"
        );
        join_all(entries.iter().map(|(r, out)| self.destroy(r, *out))).await;
    }

    /// Remove an entry and destroy its resource
    async fn discard(&self, key: u64) {
        let removed = self.state.lock().remove(key);
        if let Some(entry) = removed {
            let checked_out = matches!(entry.phase, Phase::CheckedOut { .. });
            self.destroy(&entry.resource, checked_out).await;
        }
        self.available.notify_waiters();
    }

    async fn destroy(&self, resource: &M::Resource, checked_out: bool) {
        if let Err(e) = self.manager.destroy_resource(resource, checked_out).await {
            tracing::warn!(pool = %self.name, error = %e, "failed to destroy resource");
        }
    }

    /// Start acquisitions needed to get back to the minimum size
    fn refill(self: &Arc<Self>) {
        let grow = {
            let mut state = self.state.lock();
            self.reserve_growth(&mut state)
        };
        if grow > 0 {
            tracing::debug!(pool = %self.name, count = grow, "refilling pool");
            self.spawn_acquires(grow);
        }
    }

    fn start_maintenance(self: &Arc<Self>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if let Some(period) = self.config.idle_test_period() {
            handle.spawn(idle_test_loop(Arc::downgrade(self), period));
        }
        if let Some(interval) = self.config.expiration_check_interval() {
            handle.spawn(expiration_loop(Arc::downgrade(self), interval));
        }
    }

    /// Test every idle resource once
    fn test_idle(self: &Arc<Self>) {
        let batch: Vec<(u64, M::Resource)> = {
            let mut state = self.state.lock();
            let keys: Vec<u64> = state.idle.drain(..).collect();
            keys.into_iter()
                .filter_map(|key| {
                    let entry = state.entries.get_mut(&key)?;
                    entry.phase = Phase::Busy;
                    Some((key, entry.resource.clone()))
                })
                .collect()
        };

        for (key, resource) in batch {
            let shared = self.clone();
            let scheduled = self.runner.spawn("idle-test", async move {
                match shared.manager.refurbish_idle_resource(&resource).await {
                    Ok(()) => shared.return_to_idle(key).await,
                    Err(e) => {
                        {
                            let mut state = shared.state.lock();
                            state.failed_idle_tests += 1;
                            state.last_idle_test_failure =
                                Some(FailureRecord::now(e.to_string()));
                        }
                        tracing::debug!(pool = %shared.name, resource = key, error = %e, "idle test failed");
                        shared.discard(key).await;
                        if matches!(e, CisternError::DatabaseInvalid(_)) {
                            shared.clone().reset_pool().await;
                        } else {
                            shared.refill();
                        }
                    }
                }
            });
            if !scheduled {
                let shared = self.clone();
                // runner gone; put the resource back untested
                tokio::spawn(async move { shared.return_to_idle(key).await });
            }
        }
    }

    /// Destroy resources past their idle, age or unreturned limits
    async fn expire(self: &Arc<Self>) {
        let now = Instant::now();
        let min = self.config.min_size();
        let mut expired: Vec<(M::Resource, bool)> = Vec::new();
        {
            let mut state = self.state.lock();
            let mut remaining = state.entries.len();
            let keys: Vec<u64> = state.entries.keys().copied().collect();
            for key in keys {
                let Some(entry) = state.entries.get_mut(&key) else {
                    continue;
                };
                let too_old = self
                    .config
                    .max_age()
                    .is_some_and(|age| now.duration_since(entry.created_at) > age);
                let expire = match &entry.phase {
                    Phase::Idle { since } => {
                        let idle_for = now.duration_since(*since);
                        too_old
                            || self.config.max_idle_time().is_some_and(|t| idle_for > t)
                            || (remaining > min
                                && self
                                    .config
                                    .max_idle_time_excess()
                                    .is_some_and(|t| idle_for > t))
                    }
                    Phase::CheckedOut { since, backtrace } => {
                        let out_for = now.duration_since(*since);
                        if self
                            .config
                            .unreturned_timeout()
                            .is_some_and(|t| out_for > t)
                        {
                            match backtrace {
                                Some(trace) => tracing::warn!(
                                    pool = %self.name,
                                    resource = key,
                                    checked_out_ms = out_for.as_millis() as u64,
                                    checkout_backtrace = %trace,
                                    "destroying resource not returned within the unreturned timeout"
                                ),
                                None => tracing::warn!(
                                    pool = %self.name,
                                    resource = key,
                                    checked_out_ms = out_for.as_millis() as u64,
                                    "destroying resource not returned within the unreturned timeout"
                                ),
                            }
                            true
                        } else {
                            if too_old {
                                entry.broken = true;
                            }
                            false
                        }
                    }
                    Phase::Busy => {
                        if too_old {
                            entry.broken = true;
                        }
                        false
                    }
                };
                if expire {
                    if let Some(entry) = state.remove(key) {
                        let checked_out = matches!(entry.phase, Phase::CheckedOut { .. });
                        expired.push((entry.resource, checked_out));
                        remaining -= 1;
                    }
                }
            }
        }

        if !expired.is_empty() {
            tracing::debug!(pool = %self.name, count = expired.len(), "expiring resources");
            join_all(expired.iter().map(|(r, out)| self.destroy(r, *out))).await;
            self.available.notify_waiters();
        }
        self.refill();
    }
}

async fn idle_test_loop<M: ResourceManager>(pool: Weak<Shared<M>>, period: Duration) {
    loop {
        tokio::time::sleep(period).await;
        let Some(shared) = pool.upgrade() else { return };
        if shared.state.lock().closed {
            return;
        }
        shared.test_idle();
    }
}

async fn expiration_loop<M: ResourceManager>(pool: Weak<Shared<M>>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        let Some(shared) = pool.upgrade() else { return };
        if shared.state.lock().closed {
            return;
        }
        shared.expire().await;
    }
}
