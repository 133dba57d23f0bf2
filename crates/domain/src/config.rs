//! Settings structures
//!
//! Every field has a default so partial config files and environment
//! overrides deserialize cleanly.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_KEY_PREFIX, DEFAULT_LOCK_TIMEOUT_SECS, DEFAULT_MAX_BACKOFF,
    DEFAULT_REFRESH_TICK_MS, DEFAULT_SWEEP_INTERVAL_SECS, DEFAULT_TTL_SECS,
};
use crate::errors::{CacheError, CacheResult};

/// How argument trees are turned into digests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintMode {
    /// Identity-aware, process-local. Handles cycles and opaque values.
    #[default]
    Isolated,
    /// Content-only and portable between processes. Rejects cycles and
    /// opaque values.
    Shared,
}

/// What a networked store does when the backend fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    /// Log and treat as a cache miss
    #[default]
    Silent,
    /// Propagate the backend error to the caller
    Raise,
}

impl fmt::Display for OnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Silent => f.write_str("silent"),
            Self::Raise => f.write_str("raise"),
        }
    }
}

impl FromStr for OnError {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "silent" => Ok(Self::Silent),
            "raise" => Ok(Self::Raise),
            other => Err(CacheError::Configuration(format!(
                "on_error must be 'silent' or 'raise', got '{other}'"
            ))),
        }
    }
}

/// Top-level settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoraSettings {
    /// TTL used when a memoizer is built without one
    pub default_ttl_secs: f64,
    /// In-process store settings
    pub memory: MemorySettings,
    /// Networked store and lease settings
    pub remote: RemoteSettings,
    /// Never-die refresh settings
    pub refresh: RefreshSettings,
}

impl Default for MemoraSettings {
    fn default() -> Self {
        Self {
            default_ttl_secs: DEFAULT_TTL_SECS,
            memory: MemorySettings::default(),
            remote: RemoteSettings::default(),
            refresh: RefreshSettings::default(),
        }
    }
}

impl MemoraSettings {
    /// `default_ttl_secs` as a duration, rejected unless positive
    pub fn default_ttl(&self) -> CacheResult<Duration> {
        positive_secs("default_ttl_secs", self.default_ttl_secs)
    }

    /// Reject values that would make the cache misbehave
    pub fn validate(&self) -> CacheResult<()> {
        self.default_ttl()?;
        if self.memory.sweep_interval_secs == 0 {
            return Err(CacheError::Configuration(
                "memory.sweep_interval_secs must be positive".into(),
            ));
        }
        self.remote.validate()?;
        self.refresh.validate()
    }
}

/// In-process store settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySettings {
    /// Seconds between sweeper passes
    pub sweep_interval_secs: u64,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self { sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS }
    }
}

impl MemorySettings {
    /// `sweep_interval_secs` as a duration
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Networked store and lease settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSettings {
    /// Namespace prepended to every backend key
    pub key_prefix: String,
    /// Lease lifetime; the heartbeat renews at half this interval
    pub lock_timeout_secs: u64,
    /// Behaviour when the backend fails
    pub on_error: OnError,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            lock_timeout_secs: DEFAULT_LOCK_TIMEOUT_SECS,
            on_error: OnError::default(),
        }
    }
}

impl RemoteSettings {
    /// Lease lifetime between heartbeats
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// Reject an empty prefix or zero lock timeout
    pub fn validate(&self) -> CacheResult<()> {
        if self.key_prefix.is_empty() {
            return Err(CacheError::Configuration("remote.key_prefix must not be empty".into()));
        }
        if self.lock_timeout_secs == 0 {
            return Err(CacheError::Configuration(
                "remote.lock_timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Never-die refresh settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshSettings {
    /// How often the refresh loop looks for due entries
    pub tick_millis: u64,
    /// Factor applied to an entry's backoff after each failed refresh
    pub backoff_multiplier: f64,
    /// Upper bound for the backoff factor
    pub max_backoff: f64,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            tick_millis: DEFAULT_REFRESH_TICK_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl RefreshSettings {
    /// Scheduler pass interval
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_millis)
    }

    /// Reject a zero tick or backoff factors below 1
    pub fn validate(&self) -> CacheResult<()> {
        if self.tick_millis == 0 {
            return Err(CacheError::Configuration("refresh.tick_millis must be positive".into()));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(CacheError::Configuration(
                "refresh.backoff_multiplier must be a finite number >= 1".into(),
            ));
        }
        if !self.max_backoff.is_finite() || self.max_backoff < 1.0 {
            return Err(CacheError::Configuration(
                "refresh.max_backoff must be a finite number >= 1".into(),
            ));
        }
        Ok(())
    }
}

/// Convert a seconds value into a strictly positive duration
pub fn positive_secs(field: &str, secs: f64) -> CacheResult<Duration> {
    if secs.is_finite() && secs > 0.0 {
        Duration::try_from_secs_f64(secs)
            .map_err(|e| CacheError::Configuration(format!("{field}: {e}")))
    } else {
        Err(CacheError::Configuration(format!("{field} must be a positive number, got {secs}")))
    }
}
