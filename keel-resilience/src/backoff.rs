//! Exponential backoff with bounded jitter

use rand::Rng;
use std::time::Duration;

/// Backoff delay calculator
///
/// Retry numbers are 1-based: retry 1 is the wait before the second
/// overall attempt. The un-jittered delay before retry `n` is
/// `min(max_delay, base_delay * multiplier^(n-1))`.
#[derive(Debug, Clone)]
pub struct BackoffCalculator {
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter_fraction: f64,
}

impl BackoffCalculator {
    /// Create a new backoff calculator
    pub fn new(
        base_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
        jitter_fraction: f64,
    ) -> Self {
        Self {
            base_delay,
            max_delay,
            multiplier,
            jitter_fraction,
        }
    }

    /// Delay before retry `retry` without jitter
    pub fn base_delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let factor = self.multiplier.powi(exponent);
        let nanos = self.base_delay.as_nanos() as f64 * factor;
        let max_nanos = self.max_delay.as_nanos() as f64;

        if !nanos.is_finite() || nanos >= max_nanos {
            self.max_delay
        } else {
            Duration::from_nanos(nanos as u64)
        }
    }

    /// Delay before retry `retry` with jitter applied
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let delay = self.base_delay_for_retry(retry);
        self.apply_jitter(delay, &mut rand::thread_rng())
    }

    /// Perturb `delay` by up to `±delay * jitter_fraction`, never below zero
    pub fn apply_jitter<R: Rng + ?Sized>(&self, delay: Duration, rng: &mut R) -> Duration {
        if self.jitter_fraction <= 0.0 || delay.is_zero() {
            return delay;
        }

        let spread = self.jitter_fraction;
        let factor = 1.0 + rng.gen_range(-spread..=spread);
        let nanos = (delay.as_nanos() as f64 * factor).max(0.0);
        Duration::from_nanos(nanos as u64)
    }
}
