//! Exponential backoff for background job retries.
//!
//! A failed flush or compaction is retried after `next()`; the delay doubles
//! per failure up to `max`, with ±25% jitter, and `reset()` is called once a
//! job succeeds.

use fastrand::Rng;
use std::time::Duration;

#[derive(Debug)]
pub struct ExponentialBackoff {
    current: Duration,
    min: Duration,
    max: Duration,
    factor: u32,
    rng: Rng,
    attempts: u64,
}

impl ExponentialBackoff {
    /// 10ms doubling up to 5s.
    pub fn new() -> Self {
        Self::with_params(Duration::from_millis(10), Duration::from_secs(5), 2)
    }

    pub fn with_params(min: Duration, max: Duration, factor: u32) -> Self {
        Self {
            current: min,
            min,
            max,
            factor,
            rng: Rng::new(),
            attempts: 0,
        }
    }

    /// Delay before the next retry, with jitter applied.
    pub fn next(&mut self) -> Duration {
        self.attempts += 1;

        let duration = self.current;
        let jitter = self.rng.f64() * 0.5 - 0.25;
        self.current = (self.current * self.factor).min(self.max);

        duration.mul_f64(1.0 + jitter)
    }

    pub fn reset(&mut self) {
        self.current = self.min;
        self.attempts = 0;
    }

    /// Un-jittered delay the next call will be based on.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Failures since the last reset.
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    pub fn is_maxed(&self) -> bool {
        self.current >= self.max
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new()
    }
}
