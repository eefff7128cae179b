//! Client configuration.
//!
//! `ClientConfig` can be built in code or deserialized from the application's config file:
//!
//! ```rust
//! use apiguard::ClientConfig;
//! use std::time::Duration;
//!
//! let config: ClientConfig = serde_json::from_str(r#"{
//!     "base_url": "https://crm.example.com",
//!     "max_concurrent": 8,
//!     "throttle_interval": "250ms",
//!     "retries": 2
//! }"#).unwrap();
//! config.validate().unwrap();
//! assert_eq!(config.throttle_interval, Duration::from_millis(250));
//! assert_eq!(config.base_delay, Duration::from_secs(1)); // default
//! ```

use crate::backoff::Backoff;
use crate::error::ConfigError;
use crate::governor::AdmissionLimits;
use crate::jitter::Jitter;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

/// Default ceiling on distinct endpoints with an attempt in flight.
pub const DEFAULT_MAX_CONCURRENT: usize = 5;
/// Default minimum spacing between attempts to the same endpoint.
pub const DEFAULT_THROTTLE_INTERVAL: Duration = Duration::from_millis(1000);
/// Default number of retries after the first attempt.
pub const DEFAULT_RETRIES: usize = 3;
/// Default base delay for exponential backoff.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);

/// Settings shared by every scope created from one client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Relative request paths (`/api/customers`) are resolved against this URL.
    pub base_url: Option<Url>,
    pub max_concurrent: usize,
    #[serde(with = "humantime_serde")]
    pub throttle_interval: Duration,
    pub retries: usize,
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Cap on a single backoff delay.
    #[serde(with = "humantime_serde")]
    pub max_delay: Option<Duration>,
    /// Upper bound on one physical attempt; exceeding it counts as a retryable transport timeout.
    #[serde(with = "humantime_serde")]
    pub attempt_timeout: Option<Duration>,
    pub jitter: Jitter,
    /// Headers sent with every request. `Content-Type: application/json` is added for bodies.
    pub default_headers: BTreeMap<String, String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            throttle_interval: DEFAULT_THROTTLE_INTERVAL,
            retries: DEFAULT_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: None,
            attempt_timeout: None,
            jitter: Jitter::None,
            default_headers: BTreeMap::new(),
        }
    }
}

impl ClientConfig {
    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        self.backoff().map(|_| ())
    }

    /// Admission limits for scopes that don't override them.
    pub fn limits(&self) -> AdmissionLimits {
        AdmissionLimits { throttle: self.throttle_interval, max_concurrent: self.max_concurrent }
    }

    pub(crate) fn backoff(&self) -> Result<Backoff, ConfigError> {
        let backoff = Backoff::exponential(self.base_delay);
        match self.max_delay {
            Some(max) => backoff.with_max(max),
            None => Ok(backoff),
        }
    }
}
