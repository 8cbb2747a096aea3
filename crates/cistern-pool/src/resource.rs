//! Generic resource pool
//!
//! A [`ResourcePool`] keeps between `min_size` and `max_size` resources,
//! delegating creation, checking and destruction to a [`ResourceManager`].
//! It is the sole authority on which resources are idle and which are
//! checked out.

mod backoff;
mod config;
mod pool;
mod stats;

#[cfg(test)]
mod tests;

pub use backoff::BackoffStrategy;
pub use config::ResourcePoolConfig;
pub use pool::{ResourceManager, ResourcePool};
pub use stats::{FailureRecord, ResourcePoolStats};
