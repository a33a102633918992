use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_config::ChannelConfig;

use crate::sender::{SendError, SendErrorKind};

/// What to do with a job after a failed send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Reschedule the job to run at the given time.
    Retry(DateTime<Utc>),
    /// Bury the job: attempts exhausted or the error will never succeed.
    Drop,
}

/// Exponential backoff policy with a cap.
///
/// Delay for the nth failed attempt is `base * 2^(n-1)`, capped. A
/// permanent error drops the job regardless of remaining attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_backoff: Duration,
    backoff_cap: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_backoff: Duration, backoff_cap: Duration) -> Self {
        Self {
            max_attempts,
            base_backoff,
            backoff_cap,
        }
    }

    pub fn from_channel_config(cfg: &ChannelConfig) -> Self {
        Self::new(
            cfg.max_attempts,
            Duration::from_millis(cfg.base_backoff_ms),
            Duration::from_millis(cfg.backoff_cap_ms),
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decide the fate of a job after its `attempts_made`-th failure.
    ///
    /// `attempts_made` counts the attempt that just failed, so the first
    /// failure passes 1.
    pub fn next_action(&self, attempts_made: u32, error: &SendError) -> RetryAction {
        if error.kind == SendErrorKind::Permanent {
            return RetryAction::Drop;
        }
        if attempts_made >= self.max_attempts {
            return RetryAction::Drop;
        }
        RetryAction::Retry(Utc::now() + self.backoff_for(attempts_made))
    }

    fn backoff_for(&self, attempts_made: u32) -> Duration {
        let exp = attempts_made.saturating_sub(1).min(31);
        let delay = self
            .base_backoff
            .saturating_mul(2u32.saturating_pow(exp));
        delay.min(self.backoff_cap)
    }
}
