//! cistern core - driver-facing abstractions for the connection pool
//!
//! This crate provides the traits and types every other cistern crate
//! depends on. It defines:
//!
//! - `Driver` - opens physical connections for a `DbAuth`
//! - `Connection`, `Statement`, `PreparedStatement`, `ResultSet` - what a driver hands back
//! - `StatementRequest` - the descriptor used to key the statement cache
//! - `SessionDefaults` - session properties the pool restores after each use
//! - `CisternError` - the error taxonomy shared by driver and pool

mod auth;
mod connection;
mod driver;
mod error;
mod session;
mod statement;
mod types;

pub use auth::*;
pub use connection::*;
pub use driver::*;
pub use error::*;
pub use session::*;
pub use statement::*;
pub use types::*;
