//! Retry classification shared by both protocols.

use std::time::Duration;

use crate::error::Error;

/// Retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: usize = 3;

/// Delay before the first retry; doubles for every further retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(250);

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Send the same request again after `backoff`.
    Retry { backoff: Duration },
    /// Drop the session, then send again after `backoff`.
    Renegotiate { backoff: Duration },
    /// Give up and return the error.
    Fail,
}

/// Decides, from the error alone, whether a request is sent again.
///
/// | error | decision |
/// |---|---|
/// | `ConnectionFailed` | retry |
/// | `Timeout`, `Retryable` | renegotiate, retry |
/// | `SessionRejected` | renegotiate, retry once |
/// | anything else | fail |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: usize, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Policy that never retries.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// `attempt` is the zero-based index of the attempt that just failed.
    pub fn decide(&self, error: &Error, attempt: usize) -> RetryDecision {
        if attempt >= self.max_retries {
            return RetryDecision::Fail;
        }
        let backoff = self.backoff(attempt);
        match error {
            Error::ConnectionFailed(_) => RetryDecision::Retry { backoff },
            Error::Timeout(_) | Error::Retryable(_) => RetryDecision::Renegotiate { backoff },
            Error::SessionRejected(_) if attempt == 0 => RetryDecision::Renegotiate { backoff },
            _ => RetryDecision::Fail,
        }
    }

    /// Exponential backoff, capped at 16 times the base delay.
    pub fn backoff(&self, attempt: usize) -> Duration {
        self.base_delay * (1u32 << attempt.min(4))
    }
}
