//! Descriptors for statement-producing requests
//!
//! A [`StatementRequest`] captures everything that went into creating a
//! prepared or callable statement. Two requests that compare equal produce
//! interchangeable statements on the same physical connection, which is what
//! makes them usable as statement cache keys.

use serde::{Deserialize, Serialize};

use crate::session::Holdability;

/// What kind of statement a request produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    Prepared,
    Callable,
}

/// Cursor scrolling behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSetType {
    #[default]
    ForwardOnly,
    ScrollInsensitive,
    ScrollSensitive,
}

/// Whether rows of a result set may be updated through it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSetConcurrency {
    #[default]
    ReadOnly,
    Updatable,
}

/// How generated keys are reported back from an insert
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeneratedKeys {
    #[default]
    None,
    All,
    ColumnIndexes(Vec<u32>),
    ColumnNames(Vec<String>),
}

/// A registered OUT parameter on a callable statement
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutParameter {
    pub index: u32,
    pub sql_type: String,
}

/// Creation parameters beyond the SQL text
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct StatementOptions {
    pub result_set_type: ResultSetType,
    pub concurrency: ResultSetConcurrency,
    pub holdability: Option<Holdability>,
    pub generated_keys: GeneratedKeys,
    pub out_parameters: Vec<OutParameter>,
}

/// A request to create a prepared or callable statement
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatementRequest {
    kind: StatementKind,
    sql: String,
    options: StatementOptions,
}

impl StatementRequest {
    /// A plain prepared statement with default options
    pub fn prepared(sql: impl Into<String>) -> Self {
        Self {
            kind: StatementKind::Prepared,
            sql: sql.into(),
            options: StatementOptions::default(),
        }
    }

    /// A callable statement (stored procedure call)
    pub fn callable(sql: impl Into<String>) -> Self {
        Self {
            kind: StatementKind::Callable,
            sql: sql.into(),
            options: StatementOptions::default(),
        }
    }

    pub fn with_result_set_type(mut self, result_set_type: ResultSetType) -> Self {
        self.options.result_set_type = result_set_type;
        self
    }

    pub fn with_concurrency(mut self, concurrency: ResultSetConcurrency) -> Self {
        self.options.concurrency = concurrency;
        self
    }

    pub fn with_holdability(mut self, holdability: Holdability) -> Self {
        self.options.holdability = Some(holdability);
        self
    }

    pub fn with_generated_keys(mut self, generated_keys: GeneratedKeys) -> Self {
        self.options.generated_keys = generated_keys;
        self
    }

    /// Register an OUT parameter (callable statements only)
    pub fn with_out_parameter(mut self, index: u32, sql_type: impl Into<String>) -> Self {
        self.options.out_parameters.push(OutParameter {
            index,
            sql_type: sql_type.into(),
        });
        self
    }

    pub fn kind(&self) -> StatementKind {
        self.kind
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn options(&self) -> &StatementOptions {
        &self.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requests_with_same_parameters_are_equal() {
        let a = StatementRequest::prepared("SELECT 1").with_result_set_type(ResultSetType::ScrollInsensitive);
        let b = StatementRequest::prepared("SELECT 1").with_result_set_type(ResultSetType::ScrollInsensitive);
        assert_eq!(a, b);
    }

    #[test]
    fn test_kind_and_options_distinguish_requests() {
        let prepared = StatementRequest::prepared("{call p(?)}");
        let callable = StatementRequest::callable("{call p(?)}");
        assert_ne!(prepared, callable);

        let with_out = StatementRequest::callable("{call p(?)}").with_out_parameter(1, "INTEGER");
        assert_ne!(callable, with_out);

        let keys = StatementRequest::prepared("INSERT INTO t VALUES (?)")
            .with_generated_keys(GeneratedKeys::All);
        assert_ne!(keys, StatementRequest::prepared("INSERT INTO t VALUES (?)"));
    }
}
