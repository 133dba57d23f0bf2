//! Library constants
//!
//! Defaults for every tunable knob. Settings loaded from the environment or a
//! config file override these.

// Argument handling
pub const SKIP_CACHE_ARG: &str = "skip_cache";

// Expiry
pub const DEFAULT_TTL_SECS: f64 = 300.0;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 10;

// Networked backend
pub const DEFAULT_KEY_PREFIX: &str = "cache";
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 10;
pub const LOCK_POLL_MIN_MS: u64 = 5;
pub const LOCK_POLL_MAX_MS: u64 = 100;

// Never-die refresh
pub const DEFAULT_REFRESH_TICK_MS: u64 = 100;
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 1.25;
pub const DEFAULT_MAX_BACKOFF: f64 = 10.0;

// Environment variables
pub const ENV_PREFIX: &str = "MEMORA_";
pub const ENV_CONFIG_PATH: &str = "MEMORA_CONFIG";
