//! Bounded exponential back-off
//!
//! Used wherever the engine observes something that completes
//! asynchronously (a VM finishing boot, sshd coming up after resume).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential back-off with a cap on both delay and attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_delay_ms: 250,
            max_delay_ms: 8_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: initial_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
            multiplier: 2.0,
        }
    }

    /// Delays to sleep between attempts (`max_attempts - 1` of them)
    pub fn delays(&self) -> Backoff {
        Backoff {
            next: Duration::from_millis(self.initial_delay_ms),
            max: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier.max(1.0),
            remaining: self.max_attempts.saturating_sub(1),
        }
    }
}

/// Iterator over back-off delays
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
    multiplier: f64,
    remaining: u32,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let current = self.next.min(self.max);
        self.next = self.next.mul_f64(self.multiplier).min(self.max);
        Some(current)
    }
}
