//! Error types for cistern

use thiserror::Error;

/// SQL states that mean the database itself is unreachable rather than a
/// single connection being broken.
pub const INVALID_DATABASE_SQL_STATES: &[&str] = &["08001", "08007"];

/// Core error type for cistern operations
#[derive(Error, Debug)]
pub enum CisternError {
    #[error("Connection error: {0}")]
    Connection(String),

    /// An error reported by the driver, optionally carrying a SQLSTATE code
    #[error("SQL error{}: {message}", fmt_state(.sql_state))]
    Sql {
        message: String,
        sql_state: Option<String>,
    },

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The pool was healthy but no connection became available in time
    #[error("Checkout timeout: {0}")]
    CheckoutTimeout(String),

    /// The pool could not obtain a physical connection at all
    #[error("Cannot acquire connection: {0}")]
    CannotAcquire(String),

    #[error("Connection invalid: {0}")]
    ConnectionInvalid(String),

    #[error("Database invalid: {0}")]
    DatabaseInvalid(String),

    /// One or more resources failed to close while cleaning up a logical connection
    #[error("Cleanup failed: {}", .failures.join("; "))]
    Cleanup { failures: Vec<String> },

    #[error("Connection customizer {hook} failed: {message}")]
    Customizer { hook: &'static str, message: String },

    #[error("Closed: {0}")]
    Closed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl CisternError {
    /// Build a SQL error with a SQLSTATE code.
    pub fn sql(message: impl Into<String>, sql_state: impl Into<String>) -> Self {
        CisternError::Sql {
            message: message.into(),
            sql_state: Some(sql_state.into()),
        }
    }

    /// The SQLSTATE attached to this error, if any.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            CisternError::Sql { sql_state, .. } => sql_state.as_deref(),
            _ => None,
        }
    }

    /// Whether this error came from the driver's SQL layer (as opposed to
    /// I/O, configuration or pool bookkeeping).
    pub fn is_sql(&self) -> bool {
        matches!(
            self,
            CisternError::Sql { .. } | CisternError::Driver(_) | CisternError::Connection(_)
        )
    }

    /// Whether the SQLSTATE marks the whole database as unreachable.
    pub fn is_database_invalid_state(&self) -> bool {
        self.sql_state()
            .is_some_and(|state| INVALID_DATABASE_SQL_STATES.contains(&state))
    }

    /// Whether this is a checkout timeout, as opposed to an acquisition failure.
    pub fn is_checkout_timeout(&self) -> bool {
        matches!(self, CisternError::CheckoutTimeout(_))
    }

    /// Cheap clone that keeps the variant where possible.
    ///
    /// `std::io::Error` is rebuilt from its kind and message. A
    /// `serde_json::Error` cannot be rebuilt and collapses into
    /// [`CisternError::Other`] with the same message.
    pub fn duplicate(&self) -> CisternError {
        match self {
            CisternError::Connection(m) => CisternError::Connection(m.clone()),
            CisternError::Sql { message, sql_state } => CisternError::Sql {
                message: message.clone(),
                sql_state: sql_state.clone(),
            },
            CisternError::Driver(m) => CisternError::Driver(m.clone()),
            CisternError::Configuration(m) => CisternError::Configuration(m.clone()),
            CisternError::CheckoutTimeout(m) => CisternError::CheckoutTimeout(m.clone()),
            CisternError::CannotAcquire(m) => CisternError::CannotAcquire(m.clone()),
            CisternError::ConnectionInvalid(m) => CisternError::ConnectionInvalid(m.clone()),
            CisternError::DatabaseInvalid(m) => CisternError::DatabaseInvalid(m.clone()),
            CisternError::Cleanup { failures } => CisternError::Cleanup {
                failures: failures.clone(),
            },
            CisternError::Customizer { hook, message } => CisternError::Customizer {
                hook: *hook,
                message: message.clone(),
            },
            CisternError::Closed(m) => CisternError::Closed(m.clone()),
            CisternError::NotSupported(m) => CisternError::NotSupported(m.clone()),
            CisternError::Timeout(m) => CisternError::Timeout(m.clone()),
            CisternError::Cancelled => CisternError::Cancelled,
            CisternError::Io(e) => CisternError::Io(std::io::Error::new(e.kind(), e.to_string())),
            other => CisternError::Other(other.to_string()),
        }
    }
}

fn fmt_state(state: &Option<String>) -> String {
    state
        .as_deref()
        .map(|s| format!(" [{s}]"))
        .unwrap_or_default()
}

/// Result type alias for cistern operations
pub type Result<T> = std::result::Result<T, CisternError>;
