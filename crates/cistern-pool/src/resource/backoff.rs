//! Delay between acquisition attempts

use std::time::Duration;

/// Delay schedule for acquisition retries.
///
/// The delay for attempt `n` is `initial * multiplier^n`, capped at the
/// maximum. The default multiplier of 1.0 gives a fixed delay.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffStrategy {
    initial_ms: u64,
    max_ms: u64,
    multiplier: f64,
}

impl BackoffStrategy {
    /// Fixed delay of `delay` between attempts
    pub fn fixed(delay: Duration) -> Self {
        let ms = delay.as_millis() as u64;
        Self {
            initial_ms: ms,
            max_ms: ms,
            multiplier: 1.0,
        }
    }

    /// Growing delay starting at `initial_ms`, never above `max_ms`
    pub fn new(initial_ms: u64, max_ms: u64) -> Self {
        Self {
            initial_ms,
            max_ms: max_ms.max(initial_ms),
            multiplier: 2.0,
        }
    }

    /// Set the growth factor; values below 1.0 are treated as 1.0
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Delay before retry number `attempt` (0 is the first retry)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let delay_ms = (self.initial_ms as f64) * self.multiplier.powi(attempt as i32);
        Duration::from_millis(delay_ms.min(self.max_ms as f64) as u64)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }
}

impl Default for BackoffStrategy {
    /// One second between attempts
    fn default() -> Self {
        Self::fixed(Duration::from_millis(1000))
    }
}
