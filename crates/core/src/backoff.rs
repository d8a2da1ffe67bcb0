// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Retry policy for failed sync items.

use std::time::Duration;

use rand::Rng as _;

/// Exponential backoff with additive jitter, bounded by a cap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Attempts allowed before an item is dead-lettered.
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
    /// Upper bound of the random delay added on top of the exponential step.
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            max_attempts: 5,
            base: Duration::from_secs(2),
            cap: Duration::from_secs(30),
            jitter: Duration::from_millis(250),
        }
    }
}

impl BackoffPolicy {
    /// Delay before the next try, given how many attempts have failed so far.
    ///
    /// Formula: `min(min(base * 2^(attempts - 1), cap) + jitter, cap)`, so the
    /// first three failures wait about 2s, 4s, and 8s with the defaults.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let step = self.exponential(attempts);
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        (step + jitter).min(self.cap)
    }

    /// The deterministic part of [`BackoffPolicy::delay_for_attempt`].
    pub fn exponential(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1);
        let factor = 1u32.checked_shl(exp).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// True once `attempts` failures leave no retries.
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

#[cfg(test)]
#[path = "backoff_tests.rs"]
mod tests;
