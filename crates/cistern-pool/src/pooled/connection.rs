//! The lifecycle wrapper around one physical connection

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Instant;

use cistern_core::{
    CisternError, Connection, Holdability, IsolationLevel, PreparedStatement, Result, ResultSet,
    SessionDefaults, Statement, TypeMap,
};
use parking_lot::Mutex;

use super::events::{ConnectionEventListener, ListenerId};
use super::proxy::{LogicalConnection, ProxyConnection};
use super::session::{NonDefaultFlags, reset_session};
use crate::cache::{CachedStatement, InUseLock, StatementCache};
use crate::config::PoolConfig;
use crate::tester::{ConnectionStatus, ConnectionTester};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a physical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pc-{}", self.0)
    }
}

/// How a logical close treats the physical connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LifecycleOptions {
    /// Commit rather than roll back a transaction left open by the client
    pub auto_commit_on_close: bool,
    /// Leave open transactions and auto-commit untouched on close
    pub force_ignore_unresolved_transactions: bool,
    /// Query the tester runs when classifying client errors
    pub test_query: Option<String>,
}

impl LifecycleOptions {
    pub fn from_config(config: &PoolConfig) -> Self {
        Self {
            auto_commit_on_close: config.auto_commit_on_close(),
            force_ignore_unresolved_transactions: config.force_ignore_unresolved_transactions(),
            test_query: config.effective_test_query(),
        }
    }
}

pub(crate) type TrackId = u64;

/// An uncached statement opened through a proxy
#[derive(Clone)]
pub(crate) enum TrackedStatement {
    Plain(Arc<dyn Statement>),
    Prepared(Arc<dyn PreparedStatement>),
}

impl TrackedStatement {
    async fn cancel(&self) -> Result<()> {
        match self {
            TrackedStatement::Plain(s) => s.cancel().await,
            TrackedStatement::Prepared(s) => s.cancel().await,
        }
    }

    async fn close(&self) -> Result<()> {
        match self {
            TrackedStatement::Plain(s) => s.close().await,
            TrackedStatement::Prepared(s) => s.close().await,
        }
    }
}

/// Everything opened through the current logical connection
#[derive(Default)]
struct Tracked {
    uncached: HashMap<TrackId, TrackedStatement>,
    cached: HashMap<TrackId, CachedStatement>,
    /// Open result sets by owning statement; `None` for raw result sets
    result_sets: HashMap<Option<TrackId>, HashMap<TrackId, Arc<dyn ResultSet>>>,
}

struct LifecycleState {
    status: ConnectionStatus,
    invalidated: bool,
    destroyed: bool,
    /// Generation and handle of the open logical connection
    current: Option<(u64, Weak<LogicalConnection>)>,
    generation: u64,
    next_track: TrackId,
    tracked: Tracked,
    flags: NonDefaultFlags,
}

/// Lifecycle wrapper around one physical connection.
///
/// Hands out logical connections, tracks what clients open through them,
/// resets session state when a logical connection closes, classifies client
/// errors and notifies listeners.
pub struct PooledConnection {
    id: ConnectionId,
    physical: Arc<dyn Connection>,
    tester: Arc<dyn ConnectionTester>,
    options: LifecycleOptions,
    defaults: SessionDefaults,
    parent_token: String,
    cache: OnceLock<Arc<StatementCache>>,
    in_use: Arc<InUseLock>,
    created_at: Instant,
    state: Mutex<LifecycleState>,
    /// Serializes logical close, error signaling and destroy
    monitor: tokio::sync::Mutex<()>,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn ConnectionEventListener>)>>,
    next_listener: AtomicU64,
    double_exposures: AtomicU64,
    self_ref: Weak<PooledConnection>,
}

impl PooledConnection {
    /// Wrap `physical`, capturing its current session state as the baseline
    /// restored after every logical close
    pub async fn new(
        physical: Arc<dyn Connection>,
        tester: Arc<dyn ConnectionTester>,
        options: LifecycleOptions,
        parent_token: impl Into<String>,
    ) -> Result<Arc<Self>> {
        let defaults = physical.session_defaults().await?;
        let id = ConnectionId::next();
        tracing::debug!(connection_id = %id, driver = physical.driver_name(), "pooled connection created");

        Ok(Arc::new_cyclic(|self_ref| Self {
            id,
            physical,
            tester,
            options,
            defaults,
            parent_token: parent_token.into(),
            cache: OnceLock::new(),
            in_use: InUseLock::new(),
            created_at: Instant::now(),
            state: Mutex::new(LifecycleState {
                status: ConnectionStatus::Okay,
                invalidated: false,
                destroyed: false,
                current: None,
                generation: 0,
                next_track: 1,
                tracked: Tracked::default(),
                flags: NonDefaultFlags::default(),
            }),
            monitor: tokio::sync::Mutex::new(()),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            double_exposures: AtomicU64::new(0),
            self_ref: self_ref.clone(),
        }))
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The physical connection, for pool-internal work (tests, customizers)
    pub fn physical(&self) -> &Arc<dyn Connection> {
        &self.physical
    }

    pub fn parent_token(&self) -> &str {
        &self.parent_token
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn session_defaults(&self) -> &SessionDefaults {
        &self.defaults
    }

    pub fn tester(&self) -> &Arc<dyn ConnectionTester> {
        &self.tester
    }

    pub fn test_query(&self) -> Option<&str> {
        self.options.test_query.as_deref()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.lock().status
    }

    /// Whether an invalidating error has been signaled
    pub fn is_invalidated(&self) -> bool {
        self.state.lock().invalidated
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    /// Whether a logical connection is currently open
    pub fn has_open_logical(&self) -> bool {
        self.state.lock().current.is_some()
    }

    /// How often `get_connection` was called while a logical connection was
    /// already open
    pub fn double_exposure_count(&self) -> u64 {
        self.double_exposures.load(Ordering::SeqCst)
    }

    /// Bind a statement cache. Only the first call has an effect.
    pub fn init_statement_cache(&self, cache: Arc<StatementCache>) {
        if self.cache.get().is_some() {
            return;
        }
        cache.register_connection(self.id, self.in_use.clone());
        let _ = self.cache.set(cache);
    }

    pub fn statement_cache(&self) -> Option<&Arc<StatementCache>> {
        self.cache.get()
    }

    pub fn in_use_lock(&self) -> &Arc<InUseLock> {
        &self.in_use
    }

    /// Mark the physical connection in use, waiting for background work
    pub async fn mark_in_use(&self) -> Result<()> {
        self.in_use.mark().await
    }

    pub fn try_mark_in_use(&self) -> bool {
        self.in_use.try_mark()
    }

    pub fn unmark_in_use(&self) -> bool {
        self.in_use.unmark()
    }

    pub fn add_listener(&self, listener: Arc<dyn ConnectionEventListener>) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::SeqCst));
        self.listeners.lock().push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(other, _)| *other != id);
        listeners.len() != before
    }

    fn listeners(&self) -> Vec<Arc<dyn ConnectionEventListener>> {
        self.listeners.lock().iter().map(|(_, l)| l.clone()).collect()
    }

    /// Open the logical connection.
    ///
    /// A second call while a logical connection is open returns a handle to
    /// that same logical connection and logs a warning.
    pub fn get_connection(&self) -> Result<ProxyConnection> {
        let this = self
            .self_ref
            .upgrade()
            .ok_or_else(|| CisternError::Closed("pooled connection is gone".into()))?;

        let mut state = self.state.lock();
        if state.destroyed {
            return Err(CisternError::Closed(format!("{} has been destroyed", self.id)));
        }
        if state.invalidated {
            return Err(state.status.into_error(format!(
                "{} was invalidated by an earlier error",
                self.id
            )));
        }

        if let Some((generation, weak)) = &state.current {
            return match weak.upgrade() {
                Some(logical) => {
                    self.double_exposures.fetch_add(1, Ordering::SeqCst);
                    tracing::warn!(
                        connection_id = %self.id,
                        generation,
                        "get_connection called while a logical connection is open; \
                         returning the same logical connection"
                    );
                    Ok(ProxyConnection::from_logical(logical))
                }
                None => Err(CisternError::Closed(format!(
                    "{}: previous logical connection is still closing",
                    self.id
                ))),
            };
        }

        state.generation += 1;
        let generation = state.generation;
        let logical = LogicalConnection::new(this, generation);
        state.current = Some((generation, Arc::downgrade(&logical)));
        tracing::trace!(connection_id = %self.id, generation, "logical connection opened");
        Ok(ProxyConnection::from_logical(logical))
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        matches!(self.state.lock().current, Some((g, _)) if g == generation)
    }

    pub(crate) fn track_statement(&self, statement: TrackedStatement) -> TrackId {
        let mut state = self.state.lock();
        let id = state.next_track;
        state.next_track += 1;
        state.tracked.uncached.insert(id, statement);
        id
    }

    pub(crate) fn track_cached(&self, handle: CachedStatement) -> TrackId {
        let mut state = self.state.lock();
        let id = state.next_track;
        state.next_track += 1;
        state.tracked.cached.insert(id, handle);
        id
    }

    pub(crate) fn track_result_set(
        &self,
        owner: Option<TrackId>,
        result_set: Arc<dyn ResultSet>,
    ) -> TrackId {
        let mut state = self.state.lock();
        let id = state.next_track;
        state.next_track += 1;
        state
            .tracked
            .result_sets
            .entry(owner)
            .or_default()
            .insert(id, result_set);
        id
    }

    pub(crate) fn is_tracked(&self, track: TrackId) -> bool {
        let state = self.state.lock();
        state.tracked.uncached.contains_key(&track) || state.tracked.cached.contains_key(&track)
    }

    /// Close one result set opened through a proxy
    pub(crate) async fn close_result_set(&self, owner: Option<TrackId>, track: TrackId) -> Result<()> {
        let result_set = {
            let mut state = self.state.lock();
            let sets = state.tracked.result_sets.get_mut(&owner);
            let removed = sets.and_then(|sets| sets.remove(&track));
            if state
                .tracked
                .result_sets
                .get(&owner)
                .is_some_and(|sets| sets.is_empty())
            {
                state.tracked.result_sets.remove(&owner);
            }
            removed
        };
        match result_set {
            Some(rs) => rs.close().await,
            None => Ok(()),
        }
    }

    /// Close one statement opened through a proxy, with its result sets.
    /// Cached statements go back to the cache instead of being closed.
    pub(crate) async fn close_statement(&self, track: TrackId) -> Result<()> {
        let (uncached, cached, result_sets) = {
            let mut state = self.state.lock();
            (
                state.tracked.uncached.remove(&track),
                state.tracked.cached.remove(&track),
                state.tracked.result_sets.remove(&Some(track)),
            )
        };

        let mut failures = Vec::new();
        for rs in result_sets.into_iter().flat_map(|sets| sets.into_values()) {
            if let Err(e) = rs.close().await {
                failures.push(format!("closing result set: {e}"));
            }
        }
        if let Some(statement) = uncached {
            if let Err(e) = statement.close().await {
                failures.push(format!("closing statement: {e}"));
            }
        }
        if let Some(handle) = cached {
            self.return_cached(handle).await;
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CisternError::Cleanup { failures })
        }
    }

    async fn return_cached(&self, handle: CachedStatement) {
        match self.cache.get() {
            Some(cache) => cache.checkin_statement(handle).await,
            None => {
                if let Err(e) = handle.statement().close().await {
                    tracing::warn!(connection_id = %self.id, error = %e, "failed to close statement");
                }
            }
        }
    }

    /// Record a session property change made through a proxy
    pub(crate) fn note_isolation(&self, level: IsolationLevel) {
        self.state.lock().flags.isolation = level != self.defaults.isolation;
    }

    pub(crate) fn note_catalog(&self, catalog: Option<&str>) {
        self.state.lock().flags.catalog = catalog != self.defaults.catalog.as_deref();
    }

    pub(crate) fn note_holdability(&self, holdability: Holdability) {
        self.state.lock().flags.holdability = holdability != self.defaults.holdability;
    }

    pub(crate) fn note_read_only(&self, read_only: bool) {
        self.state.lock().flags.read_only = read_only != self.defaults.read_only;
    }

    pub(crate) fn note_type_map(&self, type_map: &TypeMap) {
        self.state.lock().flags.type_map = type_map != &self.defaults.type_map;
    }

    /// Pass a result through, classifying any error.
    ///
    /// Errors that invalidate the connection fire `connection_error_occurred`
    /// the first time; the original error is returned either way.
    pub(crate) async fn observe<T>(&self, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(error) => {
                self.handle_error(&error).await;
                Err(error)
            }
        }
    }

    async fn handle_error(&self, error: &CisternError) {
        let outcome = self
            .tester
            .status_on_exception(&*self.physical, error, self.test_query())
            .await;
        if outcome.is_okay() {
            return;
        }
        self.signal_error(outcome.status, error.duplicate()).await;
    }

    /// Mark the connection invalid and notify listeners, once
    async fn signal_error(&self, status: ConnectionStatus, error: CisternError) {
        let first = {
            let _monitor = self.monitor.lock().await;
            let mut state = self.state.lock();
            if state.invalidated {
                false
            } else {
                state.invalidated = true;
                state.status = status;
                true
            }
        };

        if !first {
            tracing::debug!(
                connection_id = %self.id,
                error = %error,
                "further error on an already invalidated connection"
            );
            return;
        }

        tracing::warn!(
            connection_id = %self.id,
            status = %status,
            error = %error,
            "connection invalidated"
        );
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        for listener in self.listeners() {
            listener
                .connection_error_occurred(this.clone(), status, error.duplicate())
                .await;
        }
    }

    /// Close the logical connection with the given generation.
    ///
    /// Closes tracked result sets and statements, returns cached statements,
    /// resolves any open transaction (unless `known_resolved`), restores
    /// auto-commit and every session property the client changed, then fires
    /// `connection_closed`. Closing an already closed generation is a no-op.
    pub(crate) async fn close_logical(&self, generation: u64, known_resolved: bool) -> Result<()> {
        let (failures, invalidated) = {
            let _monitor = self.monitor.lock().await;
            let (tracked, flags) = {
                let mut state = self.state.lock();
                match state.current {
                    Some((g, _)) if g == generation => {}
                    _ => return Ok(()),
                }
                state.current = None;
                (std::mem::take(&mut state.tracked), state.flags)
            };

            let mut failures = self.release_tracked(tracked, true).await;

            if !self.options.force_ignore_unresolved_transactions {
                failures.extend(self.resolve_transaction(known_resolved).await);
            }

            if flags.any() {
                let (remaining, reset_failures) =
                    reset_session(&*self.physical, &self.defaults, flags).await;
                self.state.lock().flags = remaining;
                failures.extend(reset_failures);
            }

            (failures, self.state.lock().invalidated)
        };

        let result = if failures.is_empty() {
            Ok(())
        } else if invalidated {
            tracing::debug!(
                connection_id = %self.id,
                failures = ?failures,
                "cleanup of an invalidated connection failed"
            );
            Ok(())
        } else {
            let error = CisternError::Cleanup { failures };
            self.signal_error(ConnectionStatus::ConnectionInvalid, error.duplicate())
                .await;
            Err(error)
        };

        tracing::trace!(connection_id = %self.id, generation, "logical connection closed");
        if let Some(this) = self.self_ref.upgrade() {
            for listener in self.listeners() {
                listener.connection_closed(this.clone()).await;
            }
        }
        result
    }

    async fn resolve_transaction(&self, known_resolved: bool) -> Vec<String> {
        let mut failures = Vec::new();
        match self.physical.auto_commit().await {
            Ok(true) => {}
            Ok(false) => {
                if !known_resolved {
                    let resolved = if self.options.auto_commit_on_close {
                        self.physical.commit().await
                    } else {
                        self.physical.rollback().await
                    };
                    if let Err(e) = resolved {
                        failures.push(format!("resolving open transaction: {e}"));
                    }
                }
                if let Err(e) = self.physical.set_auto_commit(true).await {
                    failures.push(format!("restoring auto-commit: {e}"));
                }
            }
            Err(e) => failures.push(format!("reading auto-commit: {e}")),
        }
        failures
    }

    /// Close result sets, cancel and close uncached statements, and either
    /// return cached statements (`checkin_cached`) or leave them to the
    /// cache's `close_all`.
    async fn release_tracked(&self, tracked: Tracked, checkin_cached: bool) -> Vec<String> {
        let mut failures = Vec::new();

        for rs in tracked
            .result_sets
            .into_values()
            .flat_map(|sets| sets.into_values())
        {
            if let Err(e) = rs.close().await {
                failures.push(format!("closing result set: {e}"));
            }
        }

        for statement in tracked.uncached.into_values() {
            if let Err(e) = statement.cancel().await {
                if !matches!(e, CisternError::NotSupported(_)) {
                    tracing::debug!(connection_id = %self.id, error = %e, "statement cancel failed");
                }
            }
            if let Err(e) = statement.close().await {
                failures.push(format!("closing statement: {e}"));
            }
        }

        if checkin_cached {
            for handle in tracked.cached.into_values() {
                self.return_cached(handle).await;
            }
        }

        failures
    }

    /// Destroy the physical connection and everything opened on it.
    ///
    /// When an invalidating error was signaled earlier, failures are only
    /// logged; for a voluntary destroy they are returned.
    pub async fn destroy(&self) -> Result<()> {
        let _monitor = self.monitor.lock().await;
        let tracked = {
            let mut state = self.state.lock();
            if state.destroyed {
                return Ok(());
            }
            state.destroyed = true;
            state.current = None;
            std::mem::take(&mut state.tracked)
        };

        let mut failures = self.release_tracked(tracked, false).await;
        if let Some(cache) = self.cache.get() {
            if let Err(e) = cache.close_all(self.id).await {
                failures.push(format!("closing cached statements: {e}"));
            }
        }
        self.in_use.close();
        if let Err(e) = self.physical.close().await {
            failures.push(format!("closing physical connection: {e}"));
        }

        let invalidated = self.state.lock().invalidated;
        if failures.is_empty() {
            tracing::debug!(connection_id = %self.id, "pooled connection destroyed");
            Ok(())
        } else if invalidated {
            tracing::debug!(
                connection_id = %self.id,
                failures = ?failures,
                "errors while destroying an invalidated connection"
            );
            Ok(())
        } else {
            Err(CisternError::Cleanup { failures })
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
