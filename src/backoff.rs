//! Capped exponential backoff with optional jitter.
//!
//! Used by the worker pool between transient read failures and by
//! [`TaskPublisher::publish_with_retry`](crate::publisher::TaskPublisher::publish_with_retry).
//! Attempt semantics: attempt `0` is the initial call (no delay); retries start
//! at `attempt = 1` and wait `base * 2^(attempt - 1)`, capped at `max`.
//!
//! ```rust
//! use std::time::Duration;
//! use taskgate::backoff::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(100))
//!     .with_max(Duration::from_secs(1))
//!     .unwrap();
//! assert_eq!(backoff.delay(0), Duration::ZERO);
//! assert_eq!(backoff.delay(1), Duration::from_millis(100));
//! assert_eq!(backoff.delay(3), Duration::from_millis(400));
//! assert_eq!(backoff.delay(9), Duration::from_secs(1));
//! ```

use rand::{rng, Rng};
use std::time::Duration;
use thiserror::Error;

/// Upper bound applied when computations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackoffError {
    #[error("max must be greater than zero")]
    MaxMustBePositive,
    #[error("max ({max:?}) must be >= base ({base:?})")]
    MaxLessThanBase { base: Duration, max: Duration },
}

/// How a computed delay is randomized to keep restarting consumers apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    /// Use the exact delay.
    #[default]
    None,
    /// Uniform in `[0, delay]`.
    Full,
    /// Uniform in `[delay/2, delay]`.
    Equal,
}

impl Jitter {
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rng())
    }

    /// Apply jitter with a caller-supplied RNG (deterministic tests).
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        if millis == 0 {
            return Duration::ZERO;
        }
        match self {
            Jitter::None => delay,
            Jitter::Full => Duration::from_millis(rng.random_range(0..=millis)),
            Jitter::Equal => Duration::from_millis(rng.random_range(millis / 2..=millis)),
        }
    }
}

/// Exponential backoff policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: Jitter,
}

impl Backoff {
    pub fn exponential(base: Duration) -> Self {
        Self { base, max: MAX_BACKOFF, jitter: Jitter::None }
    }

    /// Cap every delay at `max`.
    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        if max < self.base {
            return Err(BackoffError::MaxLessThanBase { base: self.base, max });
        }
        self.max = max.min(MAX_BACKOFF);
        Ok(self)
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Un-jittered delay before retry `attempt`.
    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = u32::try_from(attempt - 1).unwrap_or(u32::MAX);
        let nanos = self.base.as_nanos().saturating_mul(2u128.saturating_pow(exponent));
        let capped = nanos.min(self.max.as_nanos());
        Duration::from_nanos(u64::try_from(capped).unwrap_or(u64::MAX))
    }

    /// Delay before retry `attempt`, with jitter applied.
    pub fn jittered_delay(&self, attempt: usize) -> Duration {
        self.jitter.apply(self.delay(attempt))
    }
}
