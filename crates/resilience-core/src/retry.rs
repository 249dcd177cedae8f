use std::time::Duration;

use rand::Rng;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 1_000;
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_JITTER_MAX_MS: u64 = 250;

/// Capped exponential backoff with uniform jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay_ms: u64,
    max_delay_ms: u64,
    jitter_max_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay_ms,
            max_delay_ms,
            jitter_max_ms: DEFAULT_JITTER_MAX_MS,
        }
    }

    pub fn with_jitter_max_ms(mut self, jitter_max_ms: u64) -> Self {
        self.jitter_max_ms = jitter_max_ms;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_initial_delay_ms(mut self, initial_delay_ms: u64) -> Self {
        self.initial_delay_ms = initial_delay_ms;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn initial_delay_ms(&self) -> u64 {
        self.initial_delay_ms
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    pub fn jitter_max_ms(&self) -> u64 {
        self.jitter_max_ms
    }

    /// Deterministic part of the delay after the 1-based `attempt` failed.
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let multiplier = 1_u64 << shift;
        let calculated = self.initial_delay_ms.saturating_mul(multiplier);
        Duration::from_millis(calculated.min(self.max_delay_ms))
    }

    /// Delay before the next run after the 1-based `attempt` failed.
    ///
    /// Lies in `[base, base + jitter_max)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.delay_for_attempt_with(attempt, &mut rand::rng())
    }

    pub fn delay_for_attempt_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let jitter = if self.jitter_max_ms == 0 {
            0
        } else {
            rng.random_range(0..self.jitter_max_ms)
        };
        self.base_delay_for_attempt(attempt) + Duration::from_millis(jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_ATTEMPTS,
            DEFAULT_INITIAL_DELAY_MS,
            DEFAULT_MAX_DELAY_MS,
        )
    }
}
