//! Backoff schedule for the retry policy.
//!
//! Attempt semantics: attempt `0` is the initial call (no delay); the delay before retry `n`
//! is `delay(n)`. The default schedule is exponential, `base * 2^(n-1)`, which with a 1s base
//! gives 1s, 2s, 4s for the three default retries.
//!
//! ```rust
//! use std::time::Duration;
//! use apiguard::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(1000))
//!     .with_max(Duration::from_secs(3))
//!     .unwrap();
//! assert_eq!(backoff.delay(0), Duration::ZERO);
//! assert_eq!(backoff.delay(1), Duration::from_millis(1000));
//! assert_eq!(backoff.delay(2), Duration::from_millis(2000));
//! assert_eq!(backoff.delay(3), Duration::from_secs(3)); // capped
//! ```
//!
//! Computations that would overflow saturate to [`MAX_BACKOFF`].

use crate::error::ConfigError;
use std::time::Duration;

/// Upper bound used when a delay computation overflows (1 hour).
pub const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Schedule {
    Constant,
    Exponential,
}

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    schedule: Schedule,
    base: Duration,
    max: Option<Duration>,
}

impl Backoff {
    /// Same delay before every retry.
    pub fn constant(delay: Duration) -> Self {
        Self { schedule: Schedule::Constant, base: delay, max: None }
    }

    /// `base * 2^(attempt-1)`.
    pub fn exponential(base: Duration) -> Self {
        Self { schedule: Schedule::Exponential, base, max: None }
    }

    /// Cap exponential growth. `max` must be at least the base delay.
    pub fn with_max(mut self, max: Duration) -> Result<Self, ConfigError> {
        if max < self.base {
            return Err(ConfigError::MaxDelayBelowBase { base: self.base, max });
        }
        self.max = Some(max);
        Ok(self)
    }

    /// Cap growth at `max`, lowering the base to `max` if it starts above it.
    pub fn capped_at(mut self, max: Duration) -> Self {
        self.base = self.base.min(max);
        self.max = Some(max);
        self
    }

    /// The base delay this schedule was built with.
    pub fn base(&self) -> Duration {
        self.base
    }

    /// Delay to wait before `attempt` (0 = initial call, no delay).
    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let raw = match self.schedule {
            Schedule::Constant => self.base,
            Schedule::Exponential => {
                let exponent = attempt.saturating_sub(1).min(u32::MAX as usize) as u32;
                let multiplier = 2u128.saturating_pow(exponent);
                let nanos = self.base.as_nanos().saturating_mul(multiplier);
                Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64)
            }
        };
        let capped = self.max.map_or(raw, |m| raw.min(m));
        capped.min(MAX_BACKOFF)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::exponential(Duration::from_secs(1))
    }
}
