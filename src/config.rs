//! Store configuration

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default grace window before an idle entry is reclaimed
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(20 * 60);

/// Default delay after the first failure
pub const DEFAULT_MIN_WAIT: Duration = Duration::from_secs(1);

/// Default upper bound of the retry delay
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(60);

/// Tunables for a [`crate::storage::Store`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// How long an entry with no requests stays cached
    #[serde(with = "duration_ms", rename = "idle_ttl_ms")]
    pub idle_ttl: Duration,
    /// Retry policy for failed subscriptions
    pub backoff: BackoffConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            idle_ttl: DEFAULT_IDLE_TTL,
            backoff: BackoffConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Set the idle grace window
    pub fn with_idle_ttl(mut self, ttl: Duration) -> Self {
        self.idle_ttl = ttl;
        self
    }

    /// Set the retry policy
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Load and validate a JSON config file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: StoreConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the store cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.idle_ttl.is_zero() {
            return Err(Error::Configuration(
                "idle_ttl_ms must be greater than zero".to_string(),
            ));
        }
        self.backoff.validate()
    }
}

/// Bounded exponential backoff with jitter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackoffConfig {
    /// Base delay, multiplied by `factor` for each consecutive failure
    #[serde(with = "duration_ms", rename = "min_wait_ms")]
    pub min_wait: Duration,
    /// Growth factor between consecutive delays
    pub factor: u32,
    /// Cap on the delay
    #[serde(with = "duration_ms", rename = "max_wait_ms")]
    pub max_wait: Duration,
    /// Random spread applied to each delay, as a percentage of it
    pub jitter_percent: u8,
    /// The materializer gives up on reaching this many consecutive failures
    pub max_failures: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_wait: DEFAULT_MIN_WAIT,
            factor: 2,
            max_wait: DEFAULT_MAX_WAIT,
            jitter_percent: 100,
            max_failures: None,
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_wait > self.max_wait {
            return Err(Error::Configuration(format!(
                "backoff min_wait_ms ({}) exceeds max_wait_ms ({})",
                self.min_wait.as_millis(),
                self.max_wait.as_millis()
            )));
        }
        if self.factor == 0 {
            return Err(Error::Configuration(
                "backoff factor must be at least 1".to_string(),
            ));
        }
        if self.jitter_percent > 100 {
            return Err(Error::Configuration(format!(
                "backoff jitter_percent must be at most 100, got {}",
                self.jitter_percent
            )));
        }
        if self.max_failures == Some(0) {
            return Err(Error::Configuration(
                "backoff max_failures must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
