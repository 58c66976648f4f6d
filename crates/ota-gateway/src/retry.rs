use std::time::Duration;

/// Classifies whether a failed attempt may be repeated.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Pause, then try again.
    Retry { after: Duration },
    /// Retryable error, but the attempt budget is spent.
    GiveUp,
    /// The error must not be retried.
    Fatal,
}

/// Bounded retry with a fixed pause between attempts.
///
/// The policy only decides; the caller owns the sleeping, so tests can drive
/// it without a clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Decide after attempt number `attempt` (1-based) failed with `error`.
    pub fn decide<E: Retryable>(&self, attempt: u32, error: &E) -> RetryDecision {
        if !error.is_retryable() {
            RetryDecision::Fatal
        } else if attempt >= self.max_attempts {
            RetryDecision::GiveUp
        } else {
            RetryDecision::Retry {
                after: self.backoff,
            }
        }
    }
}
