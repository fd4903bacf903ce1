//! Token bucket for control-characteristic writes
//!
//! Holds up to `burst` tokens and refills one every `min_interval`. A full
//! bucket admits `burst` writes back-to-back; after that writes are spaced
//! `min_interval` apart. Time comes from `tokio::time` so a paused test
//! clock drives it.

use crate::config::WriteRateLimit;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};

#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    min_interval: Duration,
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(limit: WriteRateLimit) -> Self {
        let capacity = f64::from(limit.burst.max(1));
        Self {
            capacity,
            min_interval: limit.min_interval(),
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        if self.min_interval.is_zero() {
            self.tokens = self.capacity;
        } else {
            let elapsed = now.saturating_duration_since(self.last_refill);
            let earned = elapsed.as_secs_f64() / self.min_interval.as_secs_f64();
            self.tokens = (self.tokens + earned).min(self.capacity);
        }
        self.last_refill = now;
    }

    /// Take a token at `now`, or report how long until one is available
    pub fn try_acquire_at(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }
        let missing = 1.0 - self.tokens;
        Err(self.min_interval.mul_f64(missing))
    }

    pub fn try_acquire(&mut self) -> Result<(), Duration> {
        self.try_acquire_at(Instant::now())
    }

    /// Wait for the next permitted slot
    pub async fn acquire(&mut self) {
        loop {
            let now = Instant::now();
            match self.try_acquire_at(now) {
                Ok(()) => return,
                // Float rounding can leave a sliver short of a token
                Err(wait) => sleep_until(now + wait.max(Duration::from_micros(1))).await,
            }
        }
    }

    /// Whole tokens currently available
    pub fn available(&mut self) -> u32 {
        self.refill(Instant::now());
        self.tokens as u32
    }
}
