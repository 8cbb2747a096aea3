//! Pool configuration types
//!
//! [`PoolConfig`] is the data source's own configuration. Per-user and forced
//! overrides are expressed as [`PoolConfigOverride`] and layered on top with
//! [`PoolConfig::resolve_for`].

use std::collections::HashMap;
use std::time::Duration;

use cistern_core::{CisternError, Result};
use serde::{Deserialize, Serialize};

use crate::cache::CacheBounds;
use crate::resource::ResourcePoolConfig;

/// Per-user configuration overrides, keyed by user name
pub type UserOverrides = HashMap<String, PoolConfigOverride>;

/// Configuration for a pooled data source
///
/// Controls pool sizing, acquisition, testing, expiration and statement
/// caching. Durations are stored in milliseconds; zero disables the
/// corresponding timeout or period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Connections acquired when a pool is first created
    initial_pool_size: usize,
    /// Minimum number of connections to maintain in each pool
    min_pool_size: usize,
    /// Maximum number of connections allowed in each pool
    max_pool_size: usize,
    /// Connections acquired at once when the pool needs to grow
    acquire_increment: usize,
    /// How long a checkout may wait; 0 waits forever
    checkout_timeout_ms: u64,
    /// Attempts per acquisition round; 0 retries forever
    acquire_retry_attempts: u32,
    acquire_retry_delay_ms: u64,
    /// Close the pool permanently after a failed acquisition round
    break_after_acquire_failure: bool,
    idle_connection_test_period_ms: u64,
    max_idle_time_ms: u64,
    /// Idle limit applied only to connections above `min_pool_size`
    max_idle_time_excess_connections_ms: u64,
    max_connection_age_ms: u64,
    /// Checked-out connections are destroyed after this long; 0 never
    unreturned_connection_timeout_ms: u64,
    /// Capture a backtrace at checkout so overdue connections can be traced
    debug_unreturned_connection_stack_traces: bool,
    /// How often expiration limits are enforced; 0 derives it from the limits
    expiration_check_interval_ms: u64,
    test_connection_on_checkout: bool,
    test_connection_on_checkin: bool,
    preferred_test_query: Option<String>,
    automatic_test_table: Option<String>,
    connection_test_timeout_ms: u64,
    /// Commit instead of rolling back unresolved transactions on close
    auto_commit_on_close: bool,
    force_ignore_unresolved_transactions: bool,
    max_statements: usize,
    max_statements_per_connection: usize,
    /// Dedicated tasks for deferred statement closes; 0 shares the helper pool
    statement_cache_num_deferred_close_threads: usize,
    num_helper_threads: usize,
    /// Administrative tasks running longer than this are abandoned; 0 never
    max_administrative_task_time_ms: u64,
}

impl PoolConfig {
    /// Create a new pool configuration with the given min and max sizes
    ///
    /// # Panics
    ///
    /// Panics if `min_pool_size > max_pool_size` or if `max_pool_size` is 0.
    pub fn new(min_pool_size: usize, max_pool_size: usize) -> Self {
        assert!(
            max_pool_size > 0,
            "max_pool_size must be greater than 0, got {}",
            max_pool_size
        );
        assert!(
            min_pool_size <= max_pool_size,
            "min_pool_size ({}) cannot exceed max_pool_size ({})",
            min_pool_size,
            max_pool_size
        );

        Self {
            initial_pool_size: min_pool_size,
            min_pool_size,
            max_pool_size,
            ..Self::default()
        }
    }

    /// Parse a configuration from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: PoolConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for contradictions
    pub fn validate(&self) -> Result<()> {
        if self.max_pool_size == 0 {
            return Err(CisternError::Configuration(
                "max_pool_size must be greater than 0".into(),
            ));
        }
        if self.min_pool_size > self.max_pool_size {
            return Err(CisternError::Configuration(format!(
                "min_pool_size ({}) cannot exceed max_pool_size ({})",
                self.min_pool_size, self.max_pool_size
            )));
        }
        if self.acquire_increment == 0 {
            return Err(CisternError::Configuration(
                "acquire_increment must be at least 1".into(),
            ));
        }
        if self.num_helper_threads == 0 {
            return Err(CisternError::Configuration(
                "num_helper_threads must be at least 1".into(),
            ));
        }
        if let Some(table) = &self.automatic_test_table {
            if table.is_empty() || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(CisternError::Configuration(format!(
                    "automatic_test_table must be a plain identifier, got {table:?}"
                )));
            }
        }
        Ok(())
    }

    pub fn with_initial_pool_size(mut self, size: usize) -> Self {
        self.initial_pool_size = size;
        self
    }

    pub fn with_min_pool_size(mut self, size: usize) -> Self {
        self.min_pool_size = size;
        self
    }

    pub fn with_max_pool_size(mut self, size: usize) -> Self {
        self.max_pool_size = size;
        self
    }

    pub fn with_acquire_increment(mut self, increment: usize) -> Self {
        self.acquire_increment = increment;
        self
    }

    /// Set the checkout timeout in milliseconds (0 waits forever)
    pub fn with_checkout_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.checkout_timeout_ms = timeout_ms;
        self
    }

    pub fn with_acquire_retry_attempts(mut self, attempts: u32) -> Self {
        self.acquire_retry_attempts = attempts;
        self
    }

    pub fn with_acquire_retry_delay_ms(mut self, delay_ms: u64) -> Self {
        self.acquire_retry_delay_ms = delay_ms;
        self
    }

    pub fn with_break_after_acquire_failure(mut self, enabled: bool) -> Self {
        self.break_after_acquire_failure = enabled;
        self
    }

    pub fn with_idle_connection_test_period_ms(mut self, period_ms: u64) -> Self {
        self.idle_connection_test_period_ms = period_ms;
        self
    }

    pub fn with_max_idle_time_ms(mut self, idle_ms: u64) -> Self {
        self.max_idle_time_ms = idle_ms;
        self
    }

    pub fn with_max_idle_time_excess_connections_ms(mut self, idle_ms: u64) -> Self {
        self.max_idle_time_excess_connections_ms = idle_ms;
        self
    }

    pub fn with_max_connection_age_ms(mut self, age_ms: u64) -> Self {
        self.max_connection_age_ms = age_ms;
        self
    }

    pub fn with_unreturned_connection_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.unreturned_connection_timeout_ms = timeout_ms;
        self
    }

    pub fn with_debug_unreturned_connection_stack_traces(mut self, enabled: bool) -> Self {
        self.debug_unreturned_connection_stack_traces = enabled;
        self
    }

    pub fn with_expiration_check_interval_ms(mut self, interval_ms: u64) -> Self {
        self.expiration_check_interval_ms = interval_ms;
        self
    }

    pub fn with_test_connection_on_checkout(mut self, enabled: bool) -> Self {
        self.test_connection_on_checkout = enabled;
        self
    }

    pub fn with_test_connection_on_checkin(mut self, enabled: bool) -> Self {
        self.test_connection_on_checkin = enabled;
        self
    }

    pub fn with_preferred_test_query(mut self, query: impl Into<String>) -> Self {
        self.preferred_test_query = Some(query.into());
        self
    }

    pub fn with_automatic_test_table(mut self, table: impl Into<String>) -> Self {
        self.automatic_test_table = Some(table.into());
        self
    }

    pub fn with_connection_test_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.connection_test_timeout_ms = timeout_ms;
        self
    }

    pub fn with_auto_commit_on_close(mut self, enabled: bool) -> Self {
        self.auto_commit_on_close = enabled;
        self
    }

    pub fn with_force_ignore_unresolved_transactions(mut self, enabled: bool) -> Self {
        self.force_ignore_unresolved_transactions = enabled;
        self
    }

    pub fn with_max_statements(mut self, max: usize) -> Self {
        self.max_statements = max;
        self
    }

    pub fn with_max_statements_per_connection(mut self, max: usize) -> Self {
        self.max_statements_per_connection = max;
        self
    }

    pub fn with_statement_cache_num_deferred_close_threads(mut self, threads: usize) -> Self {
        self.statement_cache_num_deferred_close_threads = threads;
        self
    }

    pub fn with_num_helper_threads(mut self, threads: usize) -> Self {
        self.num_helper_threads = threads;
        self
    }

    pub fn with_max_administrative_task_time_ms(mut self, time_ms: u64) -> Self {
        self.max_administrative_task_time_ms = time_ms;
        self
    }

    pub fn initial_pool_size(&self) -> usize {
        self.initial_pool_size
    }

    pub fn min_pool_size(&self) -> usize {
        self.min_pool_size
    }

    pub fn max_pool_size(&self) -> usize {
        self.max_pool_size
    }

    pub fn acquire_increment(&self) -> usize {
        self.acquire_increment
    }

    /// Get the checkout timeout, `None` meaning wait forever
    pub fn checkout_timeout(&self) -> Option<Duration> {
        non_zero(self.checkout_timeout_ms)
    }

    pub fn acquire_retry_attempts(&self) -> u32 {
        self.acquire_retry_attempts
    }

    pub fn acquire_retry_delay(&self) -> Duration {
        Duration::from_millis(self.acquire_retry_delay_ms)
    }

    pub fn break_after_acquire_failure(&self) -> bool {
        self.break_after_acquire_failure
    }

    pub fn idle_connection_test_period(&self) -> Option<Duration> {
        non_zero(self.idle_connection_test_period_ms)
    }

    pub fn max_idle_time(&self) -> Option<Duration> {
        non_zero(self.max_idle_time_ms)
    }

    pub fn max_idle_time_excess_connections(&self) -> Option<Duration> {
        non_zero(self.max_idle_time_excess_connections_ms)
    }

    pub fn max_connection_age(&self) -> Option<Duration> {
        non_zero(self.max_connection_age_ms)
    }

    pub fn unreturned_connection_timeout(&self) -> Option<Duration> {
        non_zero(self.unreturned_connection_timeout_ms)
    }

    pub fn debug_unreturned_connection_stack_traces(&self) -> bool {
        self.debug_unreturned_connection_stack_traces
    }

    pub fn expiration_check_interval(&self) -> Option<Duration> {
        non_zero(self.expiration_check_interval_ms)
    }

    pub fn test_connection_on_checkout(&self) -> bool {
        self.test_connection_on_checkout
    }

    pub fn test_connection_on_checkin(&self) -> bool {
        self.test_connection_on_checkin
    }

    pub fn preferred_test_query(&self) -> Option<&str> {
        self.preferred_test_query.as_deref()
    }

    pub fn automatic_test_table(&self) -> Option<&str> {
        self.automatic_test_table.as_deref()
    }

    /// The query testers should run: the preferred query, else the automatic
    /// test table probe, else none (driver probe).
    pub fn effective_test_query(&self) -> Option<String> {
        self.preferred_test_query.clone().or_else(|| {
            self.automatic_test_table
                .as_ref()
                .map(|table| format!("SELECT * FROM {table}"))
        })
    }

    pub fn connection_test_timeout(&self) -> Option<Duration> {
        non_zero(self.connection_test_timeout_ms)
    }

    pub fn auto_commit_on_close(&self) -> bool {
        self.auto_commit_on_close
    }

    pub fn force_ignore_unresolved_transactions(&self) -> bool {
        self.force_ignore_unresolved_transactions
    }

    pub fn max_statements(&self) -> usize {
        self.max_statements
    }

    pub fn max_statements_per_connection(&self) -> usize {
        self.max_statements_per_connection
    }

    /// Statement cache bounds, `None` when caching is disabled
    pub fn cache_bounds(&self) -> Option<CacheBounds> {
        CacheBounds::new(self.max_statements, self.max_statements_per_connection)
    }

    pub fn statement_cache_num_deferred_close_threads(&self) -> usize {
        self.statement_cache_num_deferred_close_threads
    }

    pub fn num_helper_threads(&self) -> usize {
        self.num_helper_threads
    }

    pub fn max_administrative_task_time(&self) -> Option<Duration> {
        non_zero(self.max_administrative_task_time_ms)
    }

    /// Resource pool settings derived from this configuration
    pub fn resource_pool_config(&self) -> ResourcePoolConfig {
        let initial = self
            .initial_pool_size
            .clamp(self.min_pool_size, self.max_pool_size);
        ResourcePoolConfig::new(self.min_pool_size, self.max_pool_size)
            .with_initial_size(initial)
            .with_increment(self.acquire_increment)
            .with_checkout_timeout(self.checkout_timeout())
            .with_acquire_attempts(self.acquire_retry_attempts)
            .with_acquire_delay(self.acquire_retry_delay())
            .with_break_after_acquire_failure(self.break_after_acquire_failure)
            .with_idle_test_period(self.idle_connection_test_period())
            .with_max_idle_time(self.max_idle_time())
            .with_max_idle_time_excess(self.max_idle_time_excess_connections())
            .with_max_age(self.max_connection_age())
            .with_unreturned_timeout(self.unreturned_connection_timeout())
            .with_debug_backtraces(self.debug_unreturned_connection_stack_traces)
            .with_expiration_check_interval(self.expiration_check_interval())
    }

    /// Effective configuration for `user`.
    ///
    /// Lookup order, most specific first: the forced override, then the
    /// user's entry in `overrides`, then this configuration.
    pub fn resolve_for(
        &self,
        user: Option<&str>,
        overrides: &UserOverrides,
        forced: Option<&PoolConfigOverride>,
    ) -> PoolConfig {
        let mut config = self.clone();
        if let Some(user_override) = user.and_then(|u| overrides.get(u)) {
            config = user_override.apply(config);
        }
        if let Some(forced) = forced {
            config = forced.apply(config);
        }
        config
    }

    /// Fields whose values differ between `self` and `other`
    pub fn diff(&self, other: &PoolConfig) -> ConfigChanges {
        let mut changed = Vec::new();
        macro_rules! cmp {
            ($($field:ident),* $(,)?) => {
                $(
                    if self.$field != other.$field {
                        changed.push(stringify!($field));
                    }
                )*
            };
        }
        cmp!(
            initial_pool_size,
            min_pool_size,
            max_pool_size,
            acquire_increment,
            checkout_timeout_ms,
            acquire_retry_attempts,
            acquire_retry_delay_ms,
            break_after_acquire_failure,
            idle_connection_test_period_ms,
            max_idle_time_ms,
            max_idle_time_excess_connections_ms,
            max_connection_age_ms,
            unreturned_connection_timeout_ms,
            debug_unreturned_connection_stack_traces,
            expiration_check_interval_ms,
            test_connection_on_checkout,
            test_connection_on_checkin,
            preferred_test_query,
            automatic_test_table,
            connection_test_timeout_ms,
            auto_commit_on_close,
            force_ignore_unresolved_transactions,
            max_statements,
            max_statements_per_connection,
            statement_cache_num_deferred_close_threads,
            num_helper_threads,
            max_administrative_task_time_ms,
        );
        ConfigChanges { changed }
    }
}

impl Default for PoolConfig {
    /// Defaults:
    /// - pool sizes: initial 3, min 3, max 15, increment 3
    /// - acquisition: 30 attempts, 1 second apart, checkout waits forever
    /// - testing, expiration and statement caching disabled
    /// - 3 helper tasks
    fn default() -> Self {
        Self {
            initial_pool_size: 3,
            min_pool_size: 3,
            max_pool_size: 15,
            acquire_increment: 3,
            checkout_timeout_ms: 0,
            acquire_retry_attempts: 30,
            acquire_retry_delay_ms: 1_000,
            break_after_acquire_failure: false,
            idle_connection_test_period_ms: 0,
            max_idle_time_ms: 0,
            max_idle_time_excess_connections_ms: 0,
            max_connection_age_ms: 0,
            unreturned_connection_timeout_ms: 0,
            debug_unreturned_connection_stack_traces: false,
            expiration_check_interval_ms: 0,
            test_connection_on_checkout: false,
            test_connection_on_checkin: false,
            preferred_test_query: None,
            automatic_test_table: None,
            connection_test_timeout_ms: 0,
            auto_commit_on_close: false,
            force_ignore_unresolved_transactions: false,
            max_statements: 0,
            max_statements_per_connection: 0,
            statement_cache_num_deferred_close_threads: 0,
            num_helper_threads: 3,
            max_administrative_task_time_ms: 0,
        }
    }
}

fn non_zero(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Optional replacements for the per-pool subset of [`PoolConfig`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfigOverride {
    pub initial_pool_size: Option<usize>,
    pub min_pool_size: Option<usize>,
    pub max_pool_size: Option<usize>,
    pub acquire_increment: Option<usize>,
    pub checkout_timeout_ms: Option<u64>,
    pub idle_connection_test_period_ms: Option<u64>,
    pub max_idle_time_ms: Option<u64>,
    pub max_idle_time_excess_connections_ms: Option<u64>,
    pub max_connection_age_ms: Option<u64>,
    pub unreturned_connection_timeout_ms: Option<u64>,
    pub test_connection_on_checkout: Option<bool>,
    pub test_connection_on_checkin: Option<bool>,
    pub preferred_test_query: Option<String>,
    pub max_statements: Option<usize>,
    pub max_statements_per_connection: Option<usize>,
}

impl PoolConfigOverride {
    pub fn is_empty(&self) -> bool {
        self == &PoolConfigOverride::default()
    }

    /// Overlay the fields that are set onto `base`
    pub fn apply(&self, mut base: PoolConfig) -> PoolConfig {
        macro_rules! overlay {
            ($($field:ident),* $(,)?) => {
                $(
                    if let Some(value) = &self.$field {
                        base.$field = value.clone();
                    }
                )*
            };
        }
        overlay!(
            initial_pool_size,
            min_pool_size,
            max_pool_size,
            acquire_increment,
            checkout_timeout_ms,
            idle_connection_test_period_ms,
            max_idle_time_ms,
            max_idle_time_excess_connections_ms,
            max_connection_age_ms,
            unreturned_connection_timeout_ms,
            test_connection_on_checkout,
            test_connection_on_checkin,
            max_statements,
            max_statements_per_connection,
        );
        if let Some(query) = &self.preferred_test_query {
            base.preferred_test_query = Some(query.clone());
        }
        base
    }
}

/// Result of [`PoolConfig::diff`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigChanges {
    changed: Vec<&'static str>,
}

/// Fields that are baked into shared infrastructure rather than per-auth pools
const MANAGER_FIELDS: &[&str] = &[
    "num_helper_threads",
    "max_administrative_task_time_ms",
    "statement_cache_num_deferred_close_threads",
];

impl ConfigChanges {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
    }

    pub fn changed_fields(&self) -> &[&'static str] {
        &self.changed
    }

    pub fn contains(&self, field: &str) -> bool {
        self.changed.iter().any(|changed| *changed == field)
    }

    /// Whether the manager's task runner or destroyer must be rebuilt
    pub fn requires_new_manager(&self) -> bool {
        self.changed.iter().any(|f| MANAGER_FIELDS.contains(f))
    }

    /// Whether existing per-auth pools must be rebuilt
    pub fn requires_pool_rebuild(&self) -> bool {
        self.changed.iter().any(|f| !MANAGER_FIELDS.contains(f))
    }
}
