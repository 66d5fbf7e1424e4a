//! Retry eligibility shared by buffer jobs, transcriptions and attachment
//! downloads.

use chrono::{DateTime, Utc};

pub const DEFAULT_BACKOFF_MINUTES: [i64; 3] = [1, 5, 15];
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Outcome of asking whether another attempt may start.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Eligible now.
    Now,
    /// Not yet eligible; `minutes` is the remaining wait, rounded up.
    Wait { minutes: i64 },
    /// Attempts exhausted. Permanent.
    GiveUp,
}

impl RetryDecision {
    pub fn should_retry(self) -> bool {
        matches!(self, RetryDecision::Now)
    }

    pub fn wait_minutes(self) -> i64 {
        match self {
            RetryDecision::Wait { minutes } => minutes,
            _ => 0,
        }
    }
}

/// Tally of one pass over failed side-effects.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetrySweep {
    pub examined: usize,
    pub recovered: usize,
    pub still_failing: usize,
    pub abandoned: usize,
}

/// Backoff table indexed by the number of attempts already made.
///
/// With the default table `[1, 5, 15]` and 3 max attempts:
/// 0 attempts -> immediate, 1 -> 1 minute after the last attempt,
/// 2 -> 5 minutes, 3 or more -> give up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    table_minutes: Vec<i64>,
    max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_MINUTES.to_vec(), DEFAULT_MAX_ATTEMPTS)
    }
}

impl BackoffPolicy {
    pub fn new(table_minutes: Vec<i64>, max_attempts: u32) -> Self {
        Self {
            table_minutes,
            max_attempts,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Minimum spacing required after the `attempts`-th attempt.
    fn delay_after(&self, attempts: u32) -> i64 {
        if attempts == 0 {
            return 0;
        }
        let idx = (attempts - 1) as usize;
        self.table_minutes
            .get(idx)
            .or_else(|| self.table_minutes.last())
            .copied()
            .unwrap_or(0)
            .max(0)
    }

    /// `attempts` is how many attempts have already been made.
    pub fn should_retry(
        &self,
        attempts: u32,
        last_attempt: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        if attempts >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        let delay = self.delay_after(attempts);
        let Some(last) = last_attempt else {
            return RetryDecision::Now;
        };
        if delay == 0 {
            return RetryDecision::Now;
        }

        let eligible_at = last + chrono::Duration::minutes(delay);
        if now >= eligible_at {
            return RetryDecision::Now;
        }
        let remaining_secs = (eligible_at - now).num_seconds().max(1);
        RetryDecision::Wait {
            minutes: (remaining_secs + 59) / 60,
        }
    }
}
