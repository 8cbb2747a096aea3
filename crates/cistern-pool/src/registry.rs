//! Process-wide lookup of data sources by identity token
//!
//! An open [`PooledDataSource`] is held strongly, so looking it up by token
//! always works. Once it closes, the registry only keeps a weak reference
//! and a lookup succeeds only while someone else still holds the instance.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Weak};

use parking_lot::Mutex;

use crate::datasource::PooledDataSource;

enum Entry {
    Strong(Arc<PooledDataSource>),
    Weak(Weak<PooledDataSource>),
}

impl Entry {
    fn get(&self) -> Option<Arc<PooledDataSource>> {
        match self {
            Entry::Strong(ds) => Some(ds.clone()),
            Entry::Weak(ds) => ds.upgrade(),
        }
    }
}

static REGISTRY: LazyLock<Mutex<HashMap<String, Entry>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Register an open data source under its identity token
pub fn register(ds: &Arc<PooledDataSource>) {
    let token = ds.identity_token().to_string();
    let previous = REGISTRY
        .lock()
        .insert(token.clone(), Entry::Strong(ds.clone()));
    if previous.is_some() {
        tracing::warn!(identity_token = %token, "replaced a registered data source with the same token");
    }
}

/// The data source registered under `token`, if it is still reachable
pub fn lookup(token: &str) -> Option<Arc<PooledDataSource>> {
    let mut registry = REGISTRY.lock();
    let found = registry.get(token).and_then(Entry::get);
    if found.is_none() && registry.remove(token).is_some() {
        tracing::trace!(identity_token = %token, "dropped a dead registry entry");
    }
    found
}

/// Downgrade the entry for a closed data source to a weak reference
pub(crate) fn mark_closed(token: &str) {
    let mut registry = REGISTRY.lock();
    let weak = match registry.get(token) {
        Some(Entry::Strong(ds)) => Arc::downgrade(ds),
        _ => return,
    };
    registry.insert(token.to_string(), Entry::Weak(weak));
}

/// Forget `token` entirely. Returns whether it was registered.
pub fn remove(token: &str) -> bool {
    REGISTRY.lock().remove(token).is_some()
}

/// Tokens of every data source that is still reachable
pub fn registered_tokens() -> Vec<String> {
    let mut registry = REGISTRY.lock();
    registry.retain(|_, entry| entry.get().is_some());
    registry.keys().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::testing::MockDriver;

    async fn data_source() -> Arc<PooledDataSource> {
        PooledDataSource::builder()
            .driver(Arc::new(MockDriver::default()))
            .config(PoolConfig::new(0, 2))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_open_data_source_is_found() {
        let ds = data_source().await;
        let token = ds.identity_token().to_string();
        drop(ds);

        let found = lookup(&token).expect("registered while open");
        assert_eq!(found.identity_token(), token);
        assert!(registered_tokens().contains(&token));
        found.close().await;
    }

    #[tokio::test]
    async fn test_closed_data_source_is_held_weakly() {
        let ds = data_source().await;
        let token = ds.identity_token().to_string();
        ds.close().await;

        let found = lookup(&token).expect("still held by the test");
        assert!(found.is_closed());
        drop(found);
        drop(ds);

        assert!(lookup(&token).is_none());
        assert!(!registered_tokens().contains(&token));
    }

    #[tokio::test]
    async fn test_remove_forgets_token() {
        let ds = data_source().await;
        let token = ds.identity_token().to_string();

        assert!(remove(&token));
        assert!(!remove(&token));
        assert!(lookup(&token).is_none());
        ds.close().await;
    }

    #[test]
    fn test_unknown_token() {
        assert!(lookup("no-such-token").is_none());
        assert!(!remove("no-such-token"));
    }
}
