use std::time::Duration;

use rand::Rng;
use reqwest::StatusCode;

use crate::{HttpRetryError, Response, Result, RetryOptions};

/// Outcome of one attempt, as seen by [`RetryPolicy::should_retry`].
#[derive(Clone, Copy, Debug)]
pub enum AttemptOutcome<'a> {
    /// The send primitive failed before producing a response.
    Error(&'a HttpRetryError),
    /// A response arrived with this status.
    Response(StatusCode),
}

impl<'a> AttemptOutcome<'a> {
    pub fn of(result: &'a Result<Response>) -> Self {
        match result {
            Ok(response) => Self::Response(response.status()),
            Err(err) => Self::Error(err),
        }
    }
}

/// Decides whether an attempt is retried and how long to wait before the
/// next one. Holds configuration only.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    retryable_status_codes: Vec<u16>,
    backoff_base: Duration,
    max_backoff: Option<Duration>,
    jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_options(&RetryOptions::default())
    }
}

impl RetryPolicy {
    pub fn from_options(opts: &RetryOptions) -> Self {
        Self {
            retryable_status_codes: opts.retryable_status_codes.clone(),
            backoff_base: opts.backoff_base,
            max_backoff: opts.max_backoff,
            jitter: opts.jitter,
        }
    }

    /// Transport errors are always retryable; responses only when their
    /// status is in the retryable set.
    pub fn should_retry(&self, outcome: &AttemptOutcome<'_>) -> bool {
        match outcome {
            AttemptOutcome::Error(_) => true,
            AttemptOutcome::Response(status) => self.is_retryable_status(*status),
        }
    }

    pub fn is_retryable_status(&self, status: StatusCode) -> bool {
        self.retryable_status_codes.contains(&status.as_u16())
    }

    /// `backoff_base * 2^attempt`, capped by `max_backoff` when set.
    ///
    /// The exponent is clamped at 31, so growth stops at `backoff_base * 2^31`,
    /// and the multiplication saturates. With jitter enabled the result is
    /// drawn uniformly from `[delay / 2, delay]`.
    pub fn backoff_delay(&self, attempt: usize) -> Duration {
        let exp = attempt.min(31) as u32;
        let mut delay = self.backoff_base.saturating_mul(1u32 << exp);

        if let Some(cap) = self.max_backoff {
            delay = delay.min(cap);
        }

        if self.jitter && !delay.is_zero() {
            let half = delay / 2;
            let spread = rand::thread_rng().gen_range(0..=(delay - half).as_nanos() as u64);
            delay = half + Duration::from_nanos(spread);
        }

        delay
    }
}
