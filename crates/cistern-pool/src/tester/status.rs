//! Test outcome classification

use cistern_core::CisternError;
use serde::{Deserialize, Serialize};

/// Result classification of a connection test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// The connection works
    #[default]
    Okay,
    /// This connection is broken; others may be fine
    ConnectionInvalid,
    /// The database is unreachable; every connection to it is suspect
    DatabaseInvalid,
}

impl ConnectionStatus {
    pub fn is_usable(&self) -> bool {
        matches!(self, ConnectionStatus::Okay)
    }

    /// Status implied by an error raised while testing
    pub fn from_test_error(error: &CisternError) -> Self {
        if error.is_database_invalid_state() {
            ConnectionStatus::DatabaseInvalid
        } else {
            ConnectionStatus::ConnectionInvalid
        }
    }

    /// The error a foreground caller sees when a test fails with this status
    pub fn into_error(self, detail: impl Into<String>) -> CisternError {
        let detail = detail.into();
        match self {
            ConnectionStatus::DatabaseInvalid => CisternError::DatabaseInvalid(detail),
            _ => CisternError::ConnectionInvalid(detail),
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Okay => write!(f, "okay"),
            ConnectionStatus::ConnectionInvalid => write!(f, "connection invalid"),
            ConnectionStatus::DatabaseInvalid => write!(f, "database invalid"),
        }
    }
}

/// Status of a test plus the error that caused a failure, if any
#[derive(Debug)]
pub struct TestOutcome {
    pub status: ConnectionStatus,
    pub cause: Option<CisternError>,
}

impl TestOutcome {
    pub fn okay() -> Self {
        Self {
            status: ConnectionStatus::Okay,
            cause: None,
        }
    }

    pub fn failed(status: ConnectionStatus, cause: CisternError) -> Self {
        Self {
            status,
            cause: Some(cause),
        }
    }

    /// Failed outcome classified from the error itself
    pub fn from_error(cause: CisternError) -> Self {
        Self::failed(ConnectionStatus::from_test_error(&cause), cause)
    }

    pub fn is_okay(&self) -> bool {
        self.status.is_usable()
    }

    /// Convert into a `Result`, mapping failures to their status error
    pub fn into_result(self) -> cistern_core::Result<()> {
        match self.status {
            ConnectionStatus::Okay => Ok(()),
            status => {
                let detail = self
                    .cause
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "connection test failed".to_string());
                Err(status.into_error(detail))
            }
        }
    }
}

/// Kind and configuration of a tester, used for equality between testers
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TesterFingerprint {
    kind: &'static str,
    config: String,
}

impl TesterFingerprint {
    pub fn new(kind: &'static str, config: impl Into<String>) -> Self {
        Self {
            kind,
            config: config.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }
}
