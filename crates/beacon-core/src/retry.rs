//! Retry budget for queued deliveries.

use crate::constants::MAX_RETRIES;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Leave the item Pending for a later drain.
    Retry { attempts_left: u32 },
    /// Budget exhausted; the item becomes Abandoned.
    Abandon,
}

/// What to do after a failed attempt, given the retry count *after* the
/// failure has been counted.
pub fn decide(retry_count: u32, max_retries: u32) -> RetryDecision {
    if retry_count >= max_retries {
        RetryDecision::Abandon
    } else {
        RetryDecision::Retry {
            attempts_left: max_retries - retry_count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn decide(&self, retry_count: u32) -> RetryDecision {
        decide(retry_count, self.max_retries)
    }

    /// Items at or past the budget are never drain candidates.
    pub fn is_eligible(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }
}
