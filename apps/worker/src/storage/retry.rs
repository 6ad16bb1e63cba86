//! Bounded retry policy and the classification step it runs on.

use std::time::Duration;

use super::backend::{ErrorClass, StorageError};
use crate::contracts::AttemptOutcome;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per operation call, including the first. Zero is
    /// treated as one.
    pub max_attempts: u32,

    /// Delay after the first failed attempt.
    pub delay: Duration,

    /// Growth factor applied per subsequent attempt; 1.0 keeps the delay fixed.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY)
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            multiplier: 1.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts,
            delay: base_delay,
            multiplier,
        }
    }

    fn attempt_limit(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to wait after attempt `attempt_number` (1-indexed) fails:
    /// `delay * multiplier^(attempt_number - 1)`.
    pub fn delay_after(&self, attempt_number: u32) -> Duration {
        let exponent = attempt_number.saturating_sub(1) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        Duration::try_from_secs_f64(self.delay.as_secs_f64() * factor).unwrap_or(Duration::MAX)
    }

    pub fn first_attempt(&self) -> RetryAttempt {
        RetryAttempt {
            attempt_number: 1,
            max_attempts: self.attempt_limit(),
            delay: self.delay_after(1),
        }
    }
}

/// Position in a retry chain. `attempt_number` only ever increases and never
/// passes `max_attempts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryAttempt {
    pub attempt_number: u32,
    pub max_attempts: u32,
    /// How long to wait before the following attempt.
    pub delay: Duration,
}

impl RetryAttempt {
    pub fn is_last(&self) -> bool {
        self.attempt_number >= self.max_attempts
    }

    pub fn next(&self, policy: &RetryPolicy) -> Option<RetryAttempt> {
        if self.is_last() {
            return None;
        }
        let attempt_number = self.attempt_number + 1;
        Some(RetryAttempt {
            attempt_number,
            max_attempts: self.max_attempts,
            delay: policy.delay_after(attempt_number),
        })
    }
}

/// Maps the raw result of one attempt onto the retry state machine.
pub fn classify<T>(result: Result<T, StorageError>) -> AttemptOutcome<T, StorageError> {
    match result {
        Ok(value) => AttemptOutcome::Success(value),
        Err(e) => match e.class() {
            ErrorClass::Authentication => AttemptOutcome::Reauthenticate(e),
            ErrorClass::Transient => AttemptOutcome::Retryable(e),
            ErrorClass::NonRetryable => AttemptOutcome::Fatal(e),
        },
    }
}
