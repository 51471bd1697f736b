//! Unlock throttling.
//!
//! After `threshold` consecutive failed unlocks each further failure blocks
//! attempts for `base_ms * 2^(failures - threshold)`. A success resets the
//! counter.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Consecutive failures tolerated before backoff starts
    pub backoff_threshold: u32,
    /// Delay after the first throttled failure, doubled for each one after
    pub backoff_base_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            backoff_threshold: 5,
            backoff_base_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnlockStatus {
    pub consecutive_failures: u32,
    pub retry_after_ms: Option<u64>,
}

#[derive(Debug)]
pub struct UnlockThrottle {
    config: BackoffConfig,
    consecutive_failures: u32,
    blocked_until: Option<Instant>,
}

impl UnlockThrottle {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            consecutive_failures: 0,
            blocked_until: None,
        }
    }

    fn remaining(&self, now: Instant) -> Option<u64> {
        let until = self.blocked_until?;
        if now >= until {
            return None;
        }
        let remaining = until - now;
        Some(remaining.as_millis().clamp(1, u64::MAX as u128) as u64)
    }

    /// Refuse the attempt while a backoff window is open.
    pub fn check(&self, now: Instant) -> Result<()> {
        match self.remaining(now) {
            Some(retry_after_ms) => Err(Error::UnlockThrottled { retry_after_ms }),
            None => Ok(()),
        }
    }

    pub fn register_failure(&mut self, now: Instant) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        if self.consecutive_failures >= self.config.backoff_threshold {
            let exponent = self.consecutive_failures - self.config.backoff_threshold;
            let multiplier = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
            let delay = self.config.backoff_base_ms.saturating_mul(multiplier);
            self.blocked_until = now.checked_add(Duration::from_millis(delay));
        }
    }

    pub fn register_success(&mut self) {
        self.consecutive_failures = 0;
        self.blocked_until = None;
    }

    pub fn status(&self, now: Instant) -> UnlockStatus {
        UnlockStatus {
            consecutive_failures: self.consecutive_failures,
            retry_after_ms: self.remaining(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttle() -> UnlockThrottle {
        UnlockThrottle::new(BackoffConfig {
            backoff_threshold: 3,
            backoff_base_ms: 1000,
        })
    }

    #[test]
    fn test_no_backoff_below_threshold() {
        let mut throttle = throttle();
        let now = Instant::now();
        throttle.register_failure(now);
        throttle.register_failure(now);
        assert!(throttle.check(now).is_ok());
        assert_eq!(throttle.status(now).consecutive_failures, 2);
    }

    #[test]
    fn test_backoff_doubles() {
        let mut throttle = throttle();
        let now = Instant::now();
        for _ in 0..3 {
            throttle.register_failure(now);
        }
        assert_eq!(
            throttle.check(now),
            Err(Error::UnlockThrottled {
                retry_after_ms: 1000
            })
        );

        let later = now + Duration::from_millis(1000);
        assert!(throttle.check(later).is_ok());

        throttle.register_failure(later);
        assert_eq!(throttle.status(later).retry_after_ms, Some(2000));
    }

    #[test]
    fn test_success_resets() {
        let mut throttle = throttle();
        let now = Instant::now();
        for _ in 0..4 {
            throttle.register_failure(now);
        }
        throttle.register_success();
        assert!(throttle.check(now).is_ok());
        assert_eq!(throttle.status(now).consecutive_failures, 0);
    }
}
