//! Retry policy configuration.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry policy for [`RetryExecutor`](crate::core::RetryExecutor).
///
/// Defaults: 3 attempts, 1000 ms base delay, exponential backoff with a
/// multiplier of 2, no delay cap and no jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one. Must be at least 1.
    pub max_attempts: u32,
    /// Wait before the second attempt, in milliseconds.
    pub delay_ms: u64,
    /// Whether the wait grows after every failed attempt.
    pub backoff: bool,
    /// Growth factor applied when `backoff` is enabled.
    pub backoff_multiplier: f64,
    /// Upper bound for a single wait, in milliseconds.
    pub max_delay_ms: Option<u64>,
    /// Random spread applied to each wait, as a fraction in `[0, 1]`.
    /// `0.25` scales every wait by a factor drawn from `[0.75, 1.25]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 1000,
            backoff: true,
            backoff_multiplier: 2.0,
            max_delay_ms: None,
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the total number of attempts.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the base delay.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_ms = duration_to_ms(delay);
        self
    }

    /// Enable or disable exponential backoff.
    #[must_use]
    pub const fn with_backoff(mut self, backoff: bool) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the backoff multiplier.
    #[must_use]
    pub const fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Cap every wait at `max_delay`.
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay_ms = Some(duration_to_ms(max_delay));
        self
    }

    /// Set the jitter fraction.
    #[must_use]
    pub const fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Base delay as a [`Duration`].
    #[must_use]
    pub const fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Delay cap as a [`Duration`], if any.
    #[must_use]
    pub fn max_delay(&self) -> Option<Duration> {
        self.max_delay_ms.map(Duration::from_millis)
    }

    /// Validate retry policy values.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".into());
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err("backoff_multiplier must be a finite value >= 1.0".into());
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err("jitter must be within [0.0, 1.0]".into());
        }
        if let Some(max) = self.max_delay_ms {
            if max < self.delay_ms {
                return Err("max_delay_ms must not be smaller than delay_ms".into());
            }
        }
        Ok(())
    }

    /// Delay that follows `current` after one more failed attempt.
    #[must_use]
    pub fn next_delay(&self, current: Duration) -> Duration {
        let grown = if self.backoff {
            scale(current, self.backoff_multiplier)
        } else {
            current
        };
        self.capped(grown)
    }

    /// Apply the delay cap.
    #[must_use]
    pub fn capped(&self, delay: Duration) -> Duration {
        self.max_delay().map_or(delay, |max| delay.min(max))
    }

    /// Apply jitter to a wait. Identity when `jitter` is zero.
    #[must_use]
    pub fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = self.jitter.min(1.0);
        let factor = 1.0 + rand::rng().random_range(-spread..=spread);
        scale(delay, factor)
    }
}

/// Multiply a duration, rounding to the nearest nanosecond and saturating.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn scale(d: Duration, factor: f64) -> Duration {
    let nanos = d.as_nanos() as f64 * factor;
    if !nanos.is_finite() || nanos <= 0.0 {
        Duration::ZERO
    } else if nanos >= u64::MAX as f64 {
        Duration::MAX
    } else {
        Duration::from_nanos(nanos.round() as u64)
    }
}

fn duration_to_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
