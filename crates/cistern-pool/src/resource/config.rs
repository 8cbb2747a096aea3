//! Resource pool configuration

use std::time::Duration;

use super::backoff::BackoffStrategy;

/// Sizing, acquisition and expiration settings for a [`ResourcePool`].
///
/// `None` disables the corresponding timeout or period.
///
/// [`ResourcePool`]: super::ResourcePool
#[derive(Debug, Clone, PartialEq)]
pub struct ResourcePoolConfig {
    min_size: usize,
    max_size: usize,
    initial_size: usize,
    increment: usize,
    checkout_timeout: Option<Duration>,
    /// Attempts per acquisition round; 0 retries forever
    acquire_attempts: u32,
    acquire_backoff: BackoffStrategy,
    break_after_acquire_failure: bool,
    idle_test_period: Option<Duration>,
    max_idle_time: Option<Duration>,
    max_idle_time_excess: Option<Duration>,
    max_age: Option<Duration>,
    unreturned_timeout: Option<Duration>,
    debug_backtraces: bool,
    expiration_check_interval: Option<Duration>,
}

impl ResourcePoolConfig {
    /// # Panics
    ///
    /// Panics if `min_size > max_size` or if `max_size` is 0.
    pub fn new(min_size: usize, max_size: usize) -> Self {
        assert!(max_size > 0, "max_size must be greater than 0");
        assert!(
            min_size <= max_size,
            "min_size ({}) cannot exceed max_size ({})",
            min_size,
            max_size
        );
        Self {
            min_size,
            max_size,
            initial_size: min_size,
            increment: 1,
            checkout_timeout: None,
            acquire_attempts: 30,
            acquire_backoff: BackoffStrategy::default(),
            break_after_acquire_failure: false,
            idle_test_period: None,
            max_idle_time: None,
            max_idle_time_excess: None,
            max_age: None,
            unreturned_timeout: None,
            debug_backtraces: false,
            expiration_check_interval: None,
        }
    }

    /// Clamped to `min_size..=max_size`
    pub fn with_initial_size(mut self, size: usize) -> Self {
        self.initial_size = size.clamp(self.min_size, self.max_size);
        self
    }

    pub fn with_increment(mut self, increment: usize) -> Self {
        self.increment = increment.max(1);
        self
    }

    pub fn with_checkout_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.checkout_timeout = timeout;
        self
    }

    pub fn with_acquire_attempts(mut self, attempts: u32) -> Self {
        self.acquire_attempts = attempts;
        self
    }

    /// Fixed delay between acquisition attempts
    pub fn with_acquire_delay(mut self, delay: Duration) -> Self {
        self.acquire_backoff = BackoffStrategy::fixed(delay);
        self
    }

    pub fn with_acquire_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.acquire_backoff = backoff;
        self
    }

    pub fn with_break_after_acquire_failure(mut self, enabled: bool) -> Self {
        self.break_after_acquire_failure = enabled;
        self
    }

    pub fn with_idle_test_period(mut self, period: Option<Duration>) -> Self {
        self.idle_test_period = period;
        self
    }

    pub fn with_max_idle_time(mut self, idle: Option<Duration>) -> Self {
        self.max_idle_time = idle;
        self
    }

    pub fn with_max_idle_time_excess(mut self, idle: Option<Duration>) -> Self {
        self.max_idle_time_excess = idle;
        self
    }

    pub fn with_max_age(mut self, age: Option<Duration>) -> Self {
        self.max_age = age;
        self
    }

    pub fn with_unreturned_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.unreturned_timeout = timeout;
        self
    }

    pub fn with_debug_backtraces(mut self, enabled: bool) -> Self {
        self.debug_backtraces = enabled;
        self
    }

    pub fn with_expiration_check_interval(mut self, interval: Option<Duration>) -> Self {
        self.expiration_check_interval = interval;
        self
    }

    pub fn min_size(&self) -> usize {
        self.min_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn initial_size(&self) -> usize {
        self.initial_size
    }

    pub fn increment(&self) -> usize {
        self.increment
    }

    pub fn checkout_timeout(&self) -> Option<Duration> {
        self.checkout_timeout
    }

    pub fn acquire_attempts(&self) -> u32 {
        self.acquire_attempts
    }

    pub fn acquire_backoff(&self) -> &BackoffStrategy {
        &self.acquire_backoff
    }

    pub fn break_after_acquire_failure(&self) -> bool {
        self.break_after_acquire_failure
    }

    pub fn idle_test_period(&self) -> Option<Duration> {
        self.idle_test_period
    }

    pub fn max_idle_time(&self) -> Option<Duration> {
        self.max_idle_time
    }

    pub fn max_idle_time_excess(&self) -> Option<Duration> {
        self.max_idle_time_excess
    }

    pub fn max_age(&self) -> Option<Duration> {
        self.max_age
    }

    pub fn unreturned_timeout(&self) -> Option<Duration> {
        self.unreturned_timeout
    }

    pub fn debug_backtraces(&self) -> bool {
        self.debug_backtraces
    }

    /// How often expiration limits are enforced.
    ///
    /// Unless set explicitly, this is a sixth of the smallest enabled limit,
    /// clamped to at least 1 second; `None` when no limit is enabled.
    pub fn expiration_check_interval(&self) -> Option<Duration> {
        if self.expiration_check_interval.is_some() {
            return self.expiration_check_interval;
        }
        [
            self.max_idle_time,
            self.max_idle_time_excess,
            self.max_age,
            self.unreturned_timeout,
        ]
        .into_iter()
        .flatten()
        .min()
        .map(|limit| (limit / 6).max(Duration::from_secs(1)))
    }

    /// Whether any expiration limit is enabled
    pub fn has_expiration(&self) -> bool {
        self.max_idle_time.is_some()
            || self.max_idle_time_excess.is_some()
            || self.max_age.is_some()
            || self.unreturned_timeout.is_some()
    }
}

impl Default for ResourcePoolConfig {
    fn default() -> Self {
        Self::new(3, 15)
    }
}
