//! Retrying executor with exponential backoff.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RetryPolicy;

use super::{ConfigError, RetryError};

/// Iterator over the waits between consecutive attempts of one execution.
///
/// Yields `max_attempts - 1` values: there is no wait after the final attempt.
#[derive(Debug, Clone)]
pub struct Backoff<'a> {
    policy: &'a RetryPolicy,
    next: Duration,
    remaining: u32,
}

impl Iterator for Backoff<'_> {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let current = self.next;
        self.next = self.policy.next_delay(current);
        Some(self.policy.jittered(current))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining as usize;
        (n, Some(n))
    }
}

/// Retries a fallible async operation according to a [`RetryPolicy`].
///
/// The policy is fixed at construction; every call to
/// [`execute`](Self::execute) starts its own backoff schedule.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Create an executor for a validated policy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the policy is invalid.
    pub fn new(policy: RetryPolicy) -> Result<Self, ConfigError> {
        policy.validate().map_err(ConfigError)?;
        Ok(Self { policy })
    }

    /// The policy in effect.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Backoff schedule for one execution.
    #[must_use]
    pub fn backoff(&self) -> Backoff<'_> {
        Backoff {
            policy: &self.policy,
            next: self.policy.capped(self.policy.delay()),
            remaining: self.policy.max_attempts.saturating_sub(1),
        }
    }

    /// Run `op` until it succeeds or `max_attempts` attempts have failed.
    ///
    /// Waits between attempts use `tokio::time::sleep`, so other tasks keep
    /// running.
    ///
    /// # Errors
    ///
    /// The error of the final attempt, unchanged.
    pub async fn execute<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut waits = self.backoff();
        let mut attempt: u32 = 1;
        loop {
            let err = match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };
            let Some(wait) = waits.next() else {
                warn!(attempts = attempt, "retry attempts exhausted");
                return Err(err);
            };
            debug!(attempt, wait = ?wait, "attempt failed, backing off");
            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }

    /// Like [`execute`](Self::execute), but gives up as soon as `token` is
    /// cancelled. Cancellation is checked before every attempt and interrupts
    /// the wait between attempts; an attempt already running is not
    /// interrupted.
    ///
    /// # Errors
    ///
    /// - [`RetryError::Cancelled`] if the token fired first
    /// - [`RetryError::Exhausted`] with the final attempt's error otherwise
    pub async fn execute_cancellable<T, E, F, Fut>(
        &self,
        token: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut waits = self.backoff();
        let mut attempt: u32 = 1;
        loop {
            if token.is_cancelled() {
                debug!(attempt, "retry cancelled before attempt");
                return Err(RetryError::Cancelled);
            }
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            let Some(wait) = waits.next() else {
                warn!(attempts = attempt, "retry attempts exhausted");
                return Err(RetryError::Exhausted(err));
            };
            tokio::select! {
                () = token.cancelled() => {
                    debug!(attempt, "retry cancelled during backoff");
                    return Err(RetryError::Cancelled);
                }
                () = tokio::time::sleep(wait) => {}
            }
            attempt += 1;
        }
    }
}
