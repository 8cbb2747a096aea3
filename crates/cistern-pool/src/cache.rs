//! Prepared statement caching
//!
//! Statements are cached per physical connection and keyed by the
//! [`StatementRequest`](cistern_core::StatementRequest) that produced them.
//! Closing an evicted statement is deferred to a [`StatementDestroyer`] and
//! never runs while its connection is marked in use.

mod destroyer;
mod in_use;
mod statement_cache;


pub use destroyer::StatementDestroyer;
pub use in_use::InUseLock;
pub use statement_cache::{CacheBounds, CachedStatement, StatementCache, StatementCacheStats};
