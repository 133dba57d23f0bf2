//! Capped exponential backoff with jitter
use std::time::Duration;

use rand::Rng;

/// Maximum exponent for exponential backoff calculation to prevent overflow
const MAX_BACKOFF_EXPONENT: u32 = 30;

/// Default jitter factor (0.0 = no jitter, 1.0 = full jitter)
const DEFAULT_JITTER_FACTOR: f64 = 0.2;

/// Stateful backoff sequence: `base * 2^attempt`, capped at `max`
///
/// Each call to [`Backoff::next_delay`] returns the delay for the current
/// attempt and moves to the next one. Used by waiters that must poll a
/// remote primitive without busy-spinning.
#[derive(Debug, Clone)]
pub struct Backoff {
    base_delay: Duration,
    max_delay: Duration,
    jitter_factor: f64,
    attempt: u32,
}

impl Backoff {
    /// Create a backoff starting at `base_delay` and never exceeding
    /// `max_delay`
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay: base_delay.min(max_delay),
            max_delay,
            jitter_factor: DEFAULT_JITTER_FACTOR,
            attempt: 0,
        }
    }

    /// Set the jitter factor (0.0 = no jitter, 1.0 = full jitter)
    pub fn with_jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Number of delays handed out so far
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Start over from the base delay
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay for the current attempt, then advance
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.apply_jitter(self.exponential_delay(self.attempt));
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    fn exponential_delay(&self, attempt: u32) -> Duration {
        let base_micros = self.base_delay.as_micros() as u64;
        let max_micros = self.max_delay.as_micros() as u64;

        let multiplier = 2_u64.saturating_pow(attempt.min(MAX_BACKOFF_EXPONENT));
        Duration::from_micros(base_micros.saturating_mul(multiplier).min(max_micros))
    }

    /// Jitter only ever shortens the delay so `max_delay` stays a hard cap
    fn apply_jitter(&self, delay: Duration) -> Duration {
        if self.jitter_factor == 0.0 || delay.is_zero() {
            return delay;
        }

        let micros = delay.as_micros() as f64;
        let jitter = rand::thread_rng().gen_range(0.0..=micros * self.jitter_factor);
        Duration::from_micros((micros - jitter).max(0.0) as u64)
    }
}
