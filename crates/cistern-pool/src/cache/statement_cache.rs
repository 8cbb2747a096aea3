//! The statement cache proper

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use cistern_core::{CisternError, Connection, PreparedStatement, Result, StatementRequest};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::destroyer::StatementDestroyer;
use super::in_use::InUseLock;
use crate::pooled::ConnectionId;

/// Capacity limits of a statement cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBounds {
    /// At most this many statements across all connections
    Global(usize),
    /// At most this many statements on any one connection
    PerConnection(usize),
    /// Both limits at once
    Both { global: usize, per_connection: usize },
}

impl CacheBounds {
    /// Bounds from the two configuration values, where 0 means "no limit on
    /// this axis". Returns `None` when both are 0: caching is disabled.
    pub fn new(max_statements: usize, max_statements_per_connection: usize) -> Option<Self> {
        match (max_statements, max_statements_per_connection) {
            (0, 0) => None,
            (global, 0) => Some(CacheBounds::Global(global)),
            (0, per_connection) => Some(CacheBounds::PerConnection(per_connection)),
            (global, per_connection) => Some(CacheBounds::Both {
                global,
                per_connection,
            }),
        }
    }

    pub fn global(&self) -> Option<usize> {
        match self {
            CacheBounds::Global(max) | CacheBounds::Both { global: max, .. } => Some(*max),
            CacheBounds::PerConnection(_) => None,
        }
    }

    pub fn per_connection(&self) -> Option<usize> {
        match self {
            CacheBounds::PerConnection(max)
            | CacheBounds::Both {
                per_connection: max,
                ..
            } => Some(*max),
            CacheBounds::Global(_) => None,
        }
    }
}

type CacheKey = (ConnectionId, StatementRequest);
type EntryId = u64;

struct Entry {
    connection: ConnectionId,
    request: StatementRequest,
    statement: Arc<dyn PreparedStatement>,
    checked_out: bool,
    /// Logical clock value of the last checkin; the LRU key
    last_checkin: u64,
}

struct ConnectionEntries {
    lock: Arc<InUseLock>,
    entries: HashSet<EntryId>,
}

#[derive(Default)]
struct CacheState {
    next_entry: EntryId,
    clock: u64,
    entries: HashMap<EntryId, Entry>,
    available: HashMap<CacheKey, Vec<EntryId>>,
    connections: HashMap<ConnectionId, ConnectionEntries>,
    /// Checked-in entries by last checkin, oldest first
    lru: BTreeMap<u64, EntryId>,
}

impl CacheState {
    fn take_available(&mut self, key: &CacheKey) -> Option<EntryId> {
        let ids = self.available.get_mut(key)?;
        let id = ids.pop()?;
        if ids.is_empty() {
            self.available.remove(key);
        }
        let entry = self.entries.get_mut(&id)?;
        self.lru.remove(&entry.last_checkin);
        entry.checked_out = true;
        Some(id)
    }

    fn make_available(&mut self, id: EntryId) -> bool {
        self.clock += 1;
        let clock = self.clock;
        let Some(entry) = self.entries.get_mut(&id) else {
            return false;
        };
        entry.checked_out = false;
        entry.last_checkin = clock;
        self.lru.insert(clock, id);
        self.available
            .entry((entry.connection, entry.request.clone()))
            .or_default()
            .push(id);
        true
    }

    fn remove_entry(&mut self, id: EntryId) -> Option<Entry> {
        let entry = self.entries.remove(&id)?;
        if !entry.checked_out {
            self.lru.remove(&entry.last_checkin);
            let key = (entry.connection, entry.request.clone());
            if let Some(ids) = self.available.get_mut(&key) {
                ids.retain(|other| *other != id);
                if ids.is_empty() {
                    self.available.remove(&key);
                }
            }
        }
        if let Some(conn) = self.connections.get_mut(&entry.connection) {
            conn.entries.remove(&id);
        }
        Some(entry)
    }

    fn connection_count(&self, connection: ConnectionId) -> usize {
        self.connections
            .get(&connection)
            .map_or(0, |c| c.entries.len())
    }

    fn oldest_checked_in(&self, connection: Option<ConnectionId>) -> Option<EntryId> {
        self.lru.values().copied().find(|id| match connection {
            Some(connection) => self
                .entries
                .get(id)
                .is_some_and(|e| e.connection == connection),
            None => true,
        })
    }

    fn lock_for(&self, connection: ConnectionId) -> Option<Arc<InUseLock>> {
        self.connections.get(&connection).map(|c| c.lock.clone())
    }

    /// Evict until `connection` may take one more entry. Evicted statements
    /// are pushed to `evicted` with the lock of the connection they live on.
    /// Returns `false` if the bounds cannot be met because every candidate is
    /// checked out.
    fn make_room(
        &mut self,
        connection: ConnectionId,
        bounds: CacheBounds,
        evicted: &mut Vec<(Arc<dyn PreparedStatement>, Option<Arc<InUseLock>>)>,
    ) -> bool {
        if let Some(max) = bounds.per_connection() {
            while self.connection_count(connection) >= max {
                let Some(id) = self.oldest_checked_in(Some(connection)) else {
                    return false;
                };
                self.evict(id, evicted);
            }
        }
        if let Some(max) = bounds.global() {
            while self.entries.len() >= max {
                let Some(id) = self.oldest_checked_in(None) else {
                    return false;
                };
                self.evict(id, evicted);
            }
        }
        true
    }

    fn evict(
        &mut self,
        id: EntryId,
        evicted: &mut Vec<(Arc<dyn PreparedStatement>, Option<Arc<InUseLock>>)>,
    ) {
        if let Some(entry) = self.remove_entry(id) {
            tracing::trace!(
                connection_id = %entry.connection,
                sql = entry.request.sql(),
                "evicting cached statement"
            );
            let lock = self.lock_for(entry.connection);
            evicted.push((entry.statement, lock));
        }
    }
}

/// A statement checked out of the cache.
///
/// Must be handed back with [`StatementCache::checkin_statement`]. Handles
/// for which the cache had no room are *uncached*: checking them in closes
/// the statement.
pub struct CachedStatement {
    entry: Option<EntryId>,
    connection: ConnectionId,
    request: StatementRequest,
    statement: Arc<dyn PreparedStatement>,
}

impl CachedStatement {
    pub fn statement(&self) -> &Arc<dyn PreparedStatement> {
        &self.statement
    }

    pub fn request(&self) -> &StatementRequest {
        &self.request
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn is_cached(&self) -> bool {
        self.entry.is_some()
    }
}

impl std::fmt::Debug for CachedStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedStatement")
            .field("entry", &self.entry)
            .field("connection", &self.connection)
            .field("sql", &self.request.sql())
            .finish()
    }
}

/// Cache of prepared statements across the physical connections of a pool
pub struct StatementCache {
    bounds: CacheBounds,
    destroyer: Arc<StatementDestroyer>,
    state: Mutex<CacheState>,
}

impl StatementCache {
    pub fn new(bounds: CacheBounds, destroyer: Arc<StatementDestroyer>) -> Self {
        Self {
            bounds,
            destroyer,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn bounds(&self) -> CacheBounds {
        self.bounds
    }

    pub fn destroyer(&self) -> &Arc<StatementDestroyer> {
        &self.destroyer
    }

    /// Start caching for a physical connection guarded by `lock`
    pub fn register_connection(&self, connection: ConnectionId, lock: Arc<InUseLock>) {
        self.state
            .lock()
            .connections
            .entry(connection)
            .or_insert_with(|| ConnectionEntries {
                lock,
                entries: HashSet::new(),
            });
    }

    pub fn is_registered(&self, connection: ConnectionId) -> bool {
        self.state.lock().connections.contains_key(&connection)
    }

    /// Check out a statement for `request` on `conn`, preparing one if no
    /// cached statement is available
    pub async fn checkout_statement(
        &self,
        conn: &dyn Connection,
        connection: ConnectionId,
        request: &StatementRequest,
    ) -> Result<CachedStatement> {
        let key = (connection, request.clone());
        let cached = {
            let mut state = self.state.lock();
            state
                .take_available(&key)
                .and_then(|id| state.entries.get(&id).map(|e| (id, e.statement.clone())))
        };
        if let Some((id, statement)) = cached {
            tracing::trace!(connection_id = %connection, sql = request.sql(), "statement cache hit");
            return Ok(CachedStatement {
                entry: Some(id),
                connection,
                request: request.clone(),
                statement,
            });
        }

        let statement = conn.prepare(request).await?;

        let mut evicted = Vec::new();
        let entry = {
            let mut state = self.state.lock();
            if !state.connections.contains_key(&connection) {
                None
            } else if !state.make_room(connection, self.bounds, &mut evicted) {
                tracing::debug!(
                    connection_id = %connection,
                    sql = request.sql(),
                    "statement cache full of checked-out statements; returning uncached statement"
                );
                None
            } else {
                let id = state.next_entry;
                state.next_entry += 1;
                state.entries.insert(
                    id,
                    Entry {
                        connection,
                        request: request.clone(),
                        statement: statement.clone(),
                        checked_out: true,
                        last_checkin: 0,
                    },
                );
                if let Some(conn_entries) = state.connections.get_mut(&connection) {
                    conn_entries.entries.insert(id);
                }
                Some(id)
            }
        };

        for (stmt, lock) in evicted {
            self.destroyer.destroy(stmt, lock);
        }

        Ok(CachedStatement {
            entry,
            connection,
            request: request.clone(),
            statement,
        })
    }

    /// Return a statement obtained from [`checkout_statement`](Self::checkout_statement)
    pub async fn checkin_statement(&self, handle: CachedStatement) {
        let CachedStatement {
            entry,
            connection,
            statement,
            ..
        } = handle;

        let Some(id) = entry else {
            let lock = self.state.lock().lock_for(connection);
            self.destroyer.destroy(statement, lock);
            return;
        };

        if let Err(e) = statement.clear_parameters().await {
            tracing::debug!(connection_id = %connection, error = %e, "could not refresh cached statement; discarding it");
            let (removed, lock) = {
                let mut state = self.state.lock();
                (state.remove_entry(id), state.lock_for(connection))
            };
            if removed.is_some() {
                self.destroyer.destroy(statement, lock);
            }
            return;
        }

        enum Checkin {
            Returned,
            AlreadyReturned,
            Gone(Option<Arc<InUseLock>>),
        }

        let outcome = {
            let mut state = self.state.lock();
            let checked_out = state.entries.get(&id).map(|e| e.checked_out);
            match checked_out {
                Some(true) => {
                    state.make_available(id);
                    Checkin::Returned
                }
                Some(false) => Checkin::AlreadyReturned,
                None => Checkin::Gone(state.lock_for(connection)),
            }
        };

        match outcome {
            Checkin::Returned => {}
            Checkin::AlreadyReturned => {
                tracing::debug!(connection_id = %connection, "statement was already checked in");
            }
            Checkin::Gone(lock) => {
                if !statement.is_closed() {
                    self.destroyer.destroy(statement, lock);
                }
            }
        }
    }

    /// Check in every statement of `connection` that is still checked out
    pub fn checkin_all(&self, connection: ConnectionId) -> usize {
        let mut state = self.state.lock();
        let outstanding: Vec<EntryId> = match state.connections.get(&connection) {
            Some(conn) => conn
                .entries
                .iter()
                .copied()
                .filter(|id| state.entries.get(id).is_some_and(|e| e.checked_out))
                .collect(),
            None => return 0,
        };
        for id in &outstanding {
            state.make_available(*id);
        }
        outstanding.len()
    }

    /// Close every statement of `connection` now and forget the connection
    pub async fn close_all(&self, connection: ConnectionId) -> Result<usize> {
        let statements: Vec<Arc<dyn PreparedStatement>> = {
            let mut state = self.state.lock();
            let Some(conn) = state.connections.remove(&connection) else {
                return Ok(0);
            };
            conn.entries
                .into_iter()
                .filter_map(|id| state.remove_entry(id))
                .map(|e| e.statement)
                .collect()
        };

        let mut failures = Vec::new();
        for statement in &statements {
            if let Err(e) = statement.close().await {
                failures.push(e.to_string());
            }
        }
        if !failures.is_empty() {
            return Err(CisternError::Cleanup { failures });
        }
        Ok(statements.len())
    }

    /// Mark `connection` in use, waiting for background work on it to finish
    pub async fn mark_connection_in_use(&self, connection: ConnectionId) -> Result<()> {
        let lock = self.state.lock().lock_for(connection);
        match lock {
            Some(lock) => lock.mark().await,
            None => Ok(()),
        }
    }

    /// Mark `connection` in use only if it is free
    pub fn try_mark_connection_in_use(&self, connection: ConnectionId) -> bool {
        self.state
            .lock()
            .lock_for(connection)
            .is_none_or(|lock| lock.try_mark())
    }

    pub fn unmark_connection_in_use(&self, connection: ConnectionId) {
        if let Some(lock) = self.state.lock().lock_for(connection) {
            lock.unmark();
        }
    }

    pub fn num_statements(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn num_checked_out(&self) -> usize {
        self.state
            .lock()
            .entries
            .values()
            .filter(|e| e.checked_out)
            .count()
    }

    pub fn num_connections_with_statements(&self) -> usize {
        self.state
            .lock()
            .connections
            .values()
            .filter(|c| !c.entries.is_empty())
            .count()
    }

    pub fn num_statements_for(&self, connection: ConnectionId) -> usize {
        self.state.lock().connection_count(connection)
    }

    pub fn stats(&self) -> StatementCacheStats {
        let state = self.state.lock();
        StatementCacheStats {
            statements: state.entries.len(),
            checked_out: state.entries.values().filter(|e| e.checked_out).count(),
            connections_with_statements: state
                .connections
                .values()
                .filter(|c| !c.entries.is_empty())
                .count(),
            deferred_close_active: self.destroyer.active_count(),
            deferred_close_pending: self.destroyer.pending_count(),
        }
    }
}

/// Snapshot of a [`StatementCache`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatementCacheStats {
    pub statements: usize,
    pub checked_out: usize,
    pub connections_with_statements: usize,
    pub deferred_close_active: usize,
    pub deferred_close_pending: usize,
}

impl StatementCacheStats {
    pub fn merge(self, other: StatementCacheStats) -> StatementCacheStats {
        StatementCacheStats {
            statements: self.statements + other.statements,
            checked_out: self.checked_out + other.checked_out,
            connections_with_statements: self.connections_with_statements
                + other.connections_with_statements,
            deferred_close_active: self.deferred_close_active + other.deferred_close_active,
            deferred_close_pending: self.deferred_close_pending + other.deferred_close_pending,
        }
    }
}
