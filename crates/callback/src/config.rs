//! Configuration for callback verification.
//!
//! This module provides [`CallbackConfig`], which tunes how long a fetched
//! signing key is trusted, whether it is refreshed in the background, and the
//! clock tolerance applied to token time claims.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    error::{CallbackError, Result},
    key_provider::DEFAULT_KEY_TTL,
    validation::DEFAULT_LEEWAY_SECS,
};

/// Default tolerance for `exp`/`nbf` checks (60 seconds).
const DEFAULT_LEEWAY: Duration = Duration::from_secs(DEFAULT_LEEWAY_SECS);

/// Configuration for [`KeyProvider`](crate::KeyProvider) and
/// [`CallbackHandler`](crate::CallbackHandler).
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use mmt_common_callback::CallbackConfig;
///
/// let config = CallbackConfig::builder()
///     .key_ttl(Duration::from_secs(900))
///     .refresh_interval(Duration::from_secs(600))  // Optional
///     .build()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
///
/// Durations deserialize from human-readable strings:
///
/// ```
/// use mmt_common_callback::CallbackConfig;
///
/// let config: CallbackConfig = serde_json::from_str(r#"{"key_ttl": "30m"}"#)?;
/// assert_eq!(config.key_ttl().as_secs(), 1800);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CallbackConfig {
    /// How long a fetched key is served without re-fetching.
    #[serde(with = "humantime_serde", default = "default_key_ttl")]
    pub(crate) key_ttl: Duration,

    /// Background refresh period; `None` refreshes only on demand.
    #[serde(with = "humantime_serde", default)]
    pub(crate) refresh_interval: Option<Duration>,

    /// Clock tolerance for `exp` and `nbf`.
    #[serde(with = "humantime_serde", default = "default_leeway")]
    pub(crate) leeway: Duration,
}

fn default_key_ttl() -> Duration {
    DEFAULT_KEY_TTL
}

fn default_leeway() -> Duration {
    DEFAULT_LEEWAY
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self { key_ttl: DEFAULT_KEY_TTL, refresh_interval: None, leeway: DEFAULT_LEEWAY }
    }
}

#[bon::bon]
impl CallbackConfig {
    /// Creates a new configuration, validating all fields.
    ///
    /// # Optional Fields
    ///
    /// * `key_ttl` - Key cache TTL (default: 1 hour).
    /// * `refresh_interval` - Background refresh period (default: none).
    /// * `leeway` - Clock tolerance for time claims (default: 60 seconds).
    ///
    /// # Errors
    ///
    /// Returns [`CallbackError::Config`] if:
    /// - `key_ttl` is zero
    /// - `refresh_interval` is zero or not shorter than `key_ttl`
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_KEY_TTL)] key_ttl: Duration,
        refresh_interval: Option<Duration>,
        #[builder(default = DEFAULT_LEEWAY)] leeway: Duration,
    ) -> Result<Self> {
        let config = Self { key_ttl, refresh_interval, leeway };
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants enforced by the builder.
    ///
    /// Deserialized configurations skip the builder; consumers call this
    /// before using one.
    ///
    /// # Errors
    ///
    /// Returns [`CallbackError::Config`] on the conditions listed in
    /// [`CallbackConfig::builder`].
    pub fn validate(&self) -> Result<()> {
        if self.key_ttl.is_zero() {
            return Err(CallbackError::Config("key_ttl must be greater than zero".into()));
        }

        if let Some(interval) = self.refresh_interval {
            if interval.is_zero() {
                return Err(CallbackError::Config(
                    "refresh_interval must be greater than zero".into(),
                ));
            }
            if interval >= self.key_ttl {
                return Err(CallbackError::Config(format!(
                    "refresh_interval ({interval:?}) must be shorter than key_ttl ({:?})",
                    self.key_ttl
                )));
            }
        }

        Ok(())
    }

    /// Returns the key cache TTL.
    #[must_use]
    pub fn key_ttl(&self) -> Duration {
        self.key_ttl
    }

    /// Returns the background refresh period, if enabled.
    #[must_use]
    pub fn refresh_interval(&self) -> Option<Duration> {
        self.refresh_interval
    }

    /// Returns the clock tolerance for time claims.
    #[must_use]
    pub fn leeway(&self) -> Duration {
        self.leeway
    }
}
