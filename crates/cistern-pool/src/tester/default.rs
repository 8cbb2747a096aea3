//! Built-in connection testers

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cistern_core::{CisternError, Connection};

use super::ConnectionTester;
use super::status::{ConnectionStatus, TestOutcome, TesterFingerprint};

/// Table name probed by the metadata fallback; it is never expected to exist
pub const NONEXISTENT_TEST_TABLE: &str = "CISTERN_NONEXISTENT_TEST_TABLE";

const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

static METADATA_FALLBACK_WARNED: AtomicBool = AtomicBool::new(false);

/// Tester that runs the test query if given, otherwise the driver's
/// `is_valid` probe, otherwise a metadata lookup.
#[derive(Debug, Clone)]
pub struct DefaultConnectionTester {
    timeout: Duration,
}

impl DefaultConnectionTester {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_TEST_TIMEOUT,
        }
    }

    /// Set how long a single test may take before the connection is
    /// considered invalid
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn probe(&self, conn: &dyn Connection, query: Option<&str>) -> TestOutcome {
        if let Some(query) = query {
            return match conn.query(query, &[]).await {
                Ok(_) => TestOutcome::okay(),
                Err(e) => TestOutcome::from_error(e),
            };
        }

        match conn.is_valid(self.timeout).await {
            Ok(true) => TestOutcome::okay(),
            Ok(false) => TestOutcome::failed(
                ConnectionStatus::ConnectionInvalid,
                CisternError::ConnectionInvalid("driver reported the connection invalid".into()),
            ),
            Err(CisternError::NotSupported(_)) => metadata_probe(conn).await,
            Err(e) => TestOutcome::from_error(e),
        }
    }
}

impl Default for DefaultConnectionTester {
    fn default() -> Self {
        Self::new()
    }
}

async fn metadata_probe(conn: &dyn Connection) -> TestOutcome {
    if !METADATA_FALLBACK_WARNED.swap(true, Ordering::SeqCst) {
        tracing::warn!(
            driver = conn.driver_name(),
            "no test query configured and the driver has no is_valid probe; \
             falling back to a slow metadata lookup. Configure preferred_test_query."
        );
    }
    match conn.table_exists(NONEXISTENT_TEST_TABLE).await {
        Ok(_) => TestOutcome::okay(),
        Err(e) => TestOutcome::from_error(e),
    }
}

async fn run_with_timeout<F>(timeout: Duration, probe: F) -> TestOutcome
where
    F: Future<Output = TestOutcome>,
{
    match tokio::time::timeout(timeout, probe).await {
        Ok(outcome) => outcome,
        Err(_) => TestOutcome::failed(
            ConnectionStatus::ConnectionInvalid,
            CisternError::Timeout(format!("connection test timed out after {timeout:?}")),
        ),
    }
}

/// Classify an error without probing, when the error alone decides
fn classify_without_probe(error: &CisternError) -> Option<TestOutcome> {
    if error.is_database_invalid_state() {
        return Some(TestOutcome::failed(
            ConnectionStatus::DatabaseInvalid,
            error.duplicate(),
        ));
    }
    match error {
        CisternError::DatabaseInvalid(_) => Some(TestOutcome::failed(
            ConnectionStatus::DatabaseInvalid,
            error.duplicate(),
        )),
        CisternError::Io(_) | CisternError::Closed(_) | CisternError::ConnectionInvalid(_) => Some(
            TestOutcome::failed(ConnectionStatus::ConnectionInvalid, error.duplicate()),
        ),
        // Errors that say nothing about the connection itself
        CisternError::NotSupported(_)
        | CisternError::Configuration(_)
        | CisternError::Cancelled
        | CisternError::Customizer { .. }
        | CisternError::Serialization(_) => Some(TestOutcome::okay()),
        _ => None,
    }
}

#[async_trait]
impl ConnectionTester for DefaultConnectionTester {
    async fn active_check_connection(
        &self,
        conn: &dyn Connection,
        query: Option<&str>,
    ) -> TestOutcome {
        if conn.is_closed() {
            return TestOutcome::failed(
                ConnectionStatus::ConnectionInvalid,
                CisternError::Closed("physical connection is closed".into()),
            );
        }
        let outcome = run_with_timeout(self.timeout, self.probe(conn, query)).await;
        if !outcome.is_okay() {
            tracing::debug!(
                status = %outcome.status,
                cause = ?outcome.cause,
                "connection test failed"
            );
        }
        outcome
    }

    async fn status_on_exception(
        &self,
        conn: &dyn Connection,
        error: &CisternError,
        query: Option<&str>,
    ) -> TestOutcome {
        if let Some(outcome) = classify_without_probe(error) {
            return outcome;
        }
        let outcome = self.active_check_connection(conn, query).await;
        if outcome.is_okay() {
            tracing::debug!(error = %error, "error did not invalidate the connection");
        }
        outcome
    }

    fn fingerprint(&self) -> TesterFingerprint {
        TesterFingerprint::new("default", format!("timeout={}ms", self.timeout.as_millis()))
    }
}

/// Tester that relies solely on the driver's `is_valid` probe.
///
/// Any configured test query is ignored. Drivers without the probe fail
/// every test.
#[derive(Debug, Clone)]
pub struct IsValidConnectionTester {
    timeout: Duration,
}

impl IsValidConnectionTester {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for IsValidConnectionTester {
    fn default() -> Self {
        Self::new(DEFAULT_TEST_TIMEOUT)
    }
}

#[async_trait]
impl ConnectionTester for IsValidConnectionTester {
    async fn active_check_connection(
        &self,
        conn: &dyn Connection,
        _query: Option<&str>,
    ) -> TestOutcome {
        let probe = async {
            match conn.is_valid(self.timeout).await {
                Ok(true) => TestOutcome::okay(),
                Ok(false) => TestOutcome::failed(
                    ConnectionStatus::ConnectionInvalid,
                    CisternError::ConnectionInvalid("is_valid returned false".into()),
                ),
                Err(e @ CisternError::NotSupported(_)) => {
                    TestOutcome::failed(ConnectionStatus::ConnectionInvalid, e)
                }
                Err(e) => TestOutcome::from_error(e),
            }
        };
        run_with_timeout(self.timeout, probe).await
    }

    async fn status_on_exception(
        &self,
        conn: &dyn Connection,
        error: &CisternError,
        query: Option<&str>,
    ) -> TestOutcome {
        match classify_without_probe(error) {
            Some(outcome) => outcome,
            None => self.active_check_connection(conn, query).await,
        }
    }

    fn fingerprint(&self) -> TesterFingerprint {
        TesterFingerprint::new("is_valid", format!("timeout={}ms", self.timeout.as_millis()))
    }
}
