use std::time::Duration;

/// Bounded backoff for conflict retries.
///
/// The first retry waits `base_delay`; each later retry doubles the previous
/// delay, up to `max_delay`. At most `attempts` tries are made in total.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay,
            ..Self::default()
        }
    }

    /// Retries without sleeping.
    pub fn immediate(attempts: u32) -> Self {
        Self::new(attempts, Duration::ZERO)
    }

    /// The delay to wait after the `attempt`th failed try (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1 << shift)
            .min(self.max_delay)
    }

    /// Whether another try is allowed after `attempt` tries have failed.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.attempts
    }
}
