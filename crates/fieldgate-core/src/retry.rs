//! Retry policy for field-bus exchanges.
//!
//! The policy is a pure decision function: given how many attempts have
//! already failed and the latest error, it says whether to try again and how
//! long to wait first. [`crate::MeterClient`] drives the attempt loop.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use fieldgate_core::{Error, RetryDecision, RetryPolicy};
//!
//! let policy = RetryPolicy::new(2).backoff_base(Duration::from_millis(10));
//! let noise = Error::ChecksumMismatch { frame: vec![] };
//!
//! assert_eq!(policy.decide(0, &noise), RetryDecision::RetryAfter(Duration::from_millis(10)));
//! assert_eq!(policy.decide(1, &noise), RetryDecision::RetryAfter(Duration::from_millis(20)));
//! assert_eq!(policy.decide(2, &noise), RetryDecision::GiveUp);
//! ```

use std::time::Duration;

use crate::error::Error;

/// Outcome of [`RetryPolicy::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait this long, then attempt the exchange again.
    RetryAfter(Duration),
    /// Stop and surface the error.
    GiveUp,
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (0 means a single attempt).
    pub max_retries: u32,
    /// Base delay; attempt `n` (zero-based) waits `base * (n + 1)`.
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_base: Duration::from_millis(10),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with `max_retries` and the default backoff.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// No retries.
    pub fn none() -> Self {
        Self::new(0)
    }

    /// Set maximum number of retries.
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the linear backoff base.
    #[must_use]
    pub fn backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Total attempts the policy allows.
    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before the attempt following zero-based `attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff_base.saturating_mul(attempt.saturating_add(1))
    }

    /// Decide what to do after zero-based `attempt` failed with `error`.
    pub fn decide(&self, attempt: u32, error: &Error) -> RetryDecision {
        if !error.is_retryable() || attempt >= self.max_retries {
            return RetryDecision::GiveUp;
        }
        RetryDecision::RetryAfter(self.delay_for_attempt(attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noise() -> Error {
        Error::ChecksumMismatch { frame: vec![0x00] }
    }

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.backoff_base, Duration::from_millis(10));
        assert_eq!(policy.total_attempts(), 3);
    }

    #[test]
    fn test_retry_policy_none() {
        let policy = RetryPolicy::none();
        assert_eq!(policy.decide(0, &noise()), RetryDecision::GiveUp);
    }

    #[test]
    fn test_linear_backoff() {
        let policy = RetryPolicy::new(5).backoff_base(Duration::from_millis(10));

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(10));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(20));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(50));
    }

    #[test]
    fn test_gives_up_at_budget() {
        let policy = RetryPolicy::new(2);

        assert!(matches!(
            policy.decide(0, &noise()),
            RetryDecision::RetryAfter(_)
        ));
        assert!(matches!(
            policy.decide(1, &noise()),
            RetryDecision::RetryAfter(_)
        ));
        assert_eq!(policy.decide(2, &noise()), RetryDecision::GiveUp);
    }

    #[test]
    fn test_non_retryable_gives_up_immediately() {
        let policy = RetryPolicy::new(5);

        let err = Error::AddressMismatch {
            expected: 1,
            actual: 2,
        };
        assert_eq!(policy.decide(0, &err), RetryDecision::GiveUp);

        let err = Error::DeviceException { code: 0x02 };
        assert_eq!(policy.decide(0, &err), RetryDecision::GiveUp);
    }

    #[test]
    fn test_timeout_is_retried() {
        let policy = RetryPolicy::default();
        let err = Error::TransportTimeout {
            expected: 21,
            received: 0,
        };
        assert_eq!(
            policy.decide(0, &err),
            RetryDecision::RetryAfter(Duration::from_millis(10))
        );
    }
}
