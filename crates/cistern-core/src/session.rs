//! Per-connection session properties a client may change

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Transaction isolation level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    None,
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::None => "NONE",
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Whether open cursors survive a commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Holdability {
    HoldCursorsOverCommit,
    CloseCursorsAtCommit,
}

/// Mapping from user-defined SQL type names to client type names.
///
/// Ordered so that equality and hashing are stable.
pub type TypeMap = BTreeMap<String, String>;

/// Snapshot of the session properties the pool resets after each checkout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDefaults {
    pub isolation: IsolationLevel,
    pub catalog: Option<String>,
    pub holdability: Holdability,
    pub read_only: bool,
    pub type_map: TypeMap,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            isolation: IsolationLevel::ReadCommitted,
            catalog: None,
            holdability: Holdability::HoldCursorsOverCommit,
            read_only: false,
            type_map: TypeMap::new(),
        }
    }
}
