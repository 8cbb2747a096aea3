//! Connection testing
//!
//! A [`ConnectionTester`] decides whether a physical connection is still
//! usable, either by probing it directly or by classifying an error a client
//! just saw on it.
//!
//! # Example
//!
//! ```ignore
//! use cistern_pool::tester::{ConnectionTester, DefaultConnectionTester};
//!
//! let tester = DefaultConnectionTester::new();
//! let outcome = tester.active_check_connection(&*conn, Some("SELECT 1")).await;
//! if !outcome.status.is_usable() {
//!     println!("connection failed its test: {:?}", outcome.cause);
//! }
//! ```

mod default;
mod status;


pub use default::{DefaultConnectionTester, IsValidConnectionTester, NONEXISTENT_TEST_TABLE};
pub use status::{ConnectionStatus, TestOutcome, TesterFingerprint};

use async_trait::async_trait;
use cistern_core::{CisternError, Connection};

/// Decides whether a physical connection is usable
#[async_trait]
pub trait ConnectionTester: Send + Sync {
    /// Probe the connection, running `query` when one is given
    async fn active_check_connection(&self, conn: &dyn Connection, query: Option<&str>)
    -> TestOutcome;

    /// Classify an error a client observed on `conn`
    async fn status_on_exception(
        &self,
        conn: &dyn Connection,
        error: &CisternError,
        query: Option<&str>,
    ) -> TestOutcome;

    /// Identity of this tester's kind and configuration.
    ///
    /// Two testers with equal fingerprints behave identically.
    fn fingerprint(&self) -> TesterFingerprint;
}
