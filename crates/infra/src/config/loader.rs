//! Settings loader
//!
//! ## Loading Strategy
//! 1. `MEMORA_CONFIG` names a file: load it (missing file is an error)
//! 2. Otherwise probe the standard locations; use defaults if none exists
//! 3. Apply `MEMORA_*` environment overrides
//! 4. Validate the result
//!
//! ## Environment Variables
//! - `MEMORA_DEFAULT_TTL_SECS`: TTL for memoizers built without one
//! - `MEMORA_SWEEP_INTERVAL_SECS`: in-process sweeper period
//! - `MEMORA_KEY_PREFIX`: namespace for networked keys
//! - `MEMORA_LOCK_TIMEOUT_SECS`: lease lifetime
//! - `MEMORA_ON_ERROR`: `silent` or `raise`
//! - `MEMORA_REFRESH_TICK_MILLIS`: never-die scheduler period
//! - `MEMORA_BACKOFF_MULTIPLIER`: growth factor after a failed refresh
//! - `MEMORA_MAX_BACKOFF`: ceiling for the backoff factor
//!
//! ## File Locations
//! `memora.toml` / `memora.json` in the working directory and up to two
//! parents, then next to the executable.

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use memora_domain::constants::{ENV_CONFIG_PATH, ENV_PREFIX};
use memora_domain::{CacheError, CacheResult, MemoraSettings, OnError};

const FILE_NAMES: [&str; 2] = ["memora.toml", "memora.json"];

/// Load settings from file (if any) and environment, then validate
///
/// # Errors
/// Returns `CacheError::Configuration` if an explicitly named file is
/// missing, a file or variable cannot be parsed, or the result is invalid.
pub fn load() -> CacheResult<MemoraSettings> {
    let base = match std::env::var(ENV_CONFIG_PATH) {
        Ok(path) => load_from_file(Some(PathBuf::from(path)))?,
        Err(_) => match probe_config_paths() {
            Some(path) => load_from_file(Some(path))?,
            None => {
                tracing::debug!("config.no_file_found");
                MemoraSettings::default()
            }
        },
    };
    load_from_env(base)
}

/// Apply `MEMORA_*` overrides on top of `base` and validate
///
/// # Errors
/// Returns `CacheError::Configuration` if a variable has an invalid value
/// or the merged settings fail validation.
pub fn load_from_env(base: MemoraSettings) -> CacheResult<MemoraSettings> {
    let mut settings = base;

    if let Some(ttl) = env_parse::<f64>("DEFAULT_TTL_SECS")? {
        settings.default_ttl_secs = ttl;
    }
    if let Some(interval) = env_parse::<u64>("SWEEP_INTERVAL_SECS")? {
        settings.memory.sweep_interval_secs = interval;
    }
    if let Some(prefix) = env_parse::<String>("KEY_PREFIX")? {
        settings.remote.key_prefix = prefix;
    }
    if let Some(timeout) = env_parse::<u64>("LOCK_TIMEOUT_SECS")? {
        settings.remote.lock_timeout_secs = timeout;
    }
    if let Some(on_error) = env_parse::<OnError>("ON_ERROR")? {
        settings.remote.on_error = on_error;
    }
    if let Some(tick) = env_parse::<u64>("REFRESH_TICK_MILLIS")? {
        settings.refresh.tick_millis = tick;
    }
    if let Some(multiplier) = env_parse::<f64>("BACKOFF_MULTIPLIER")? {
        settings.refresh.backoff_multiplier = multiplier;
    }
    if let Some(max) = env_parse::<f64>("MAX_BACKOFF")? {
        settings.refresh.max_backoff = max;
    }

    settings.validate()?;
    Ok(settings)
}

/// Load settings from a file
///
/// If `path` is `None`, probes the standard locations. Format is chosen by
/// extension. The file is not validated here; [`load`] validates after
/// applying overrides.
///
/// # Errors
/// Returns `CacheError::Configuration` if no file is found or it cannot be
/// read or parsed.
pub fn load_from_file(path: Option<PathBuf>) -> CacheResult<MemoraSettings> {
    let config_path = match path {
        Some(p) => {
            if !p.exists() {
                return Err(CacheError::Configuration(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            p
        }
        None => probe_config_paths().ok_or_else(|| {
            CacheError::Configuration(
                "No config file found in any of the standard locations".to_string(),
            )
        })?,
    };

    tracing::info!(path = %config_path.display(), "config.loading_file");

    let contents = std::fs::read_to_string(&config_path)
        .map_err(|e| CacheError::Configuration(format!("Failed to read config file: {e}")))?;

    parse_settings(&contents, &config_path)
}

/// Parse settings by file extension (`.toml` or `.json`)
fn parse_settings(contents: &str, path: &Path) -> CacheResult<MemoraSettings> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match extension {
        "toml" => toml::from_str(contents)
            .map_err(|e| CacheError::Configuration(format!("Invalid TOML format: {e}"))),
        "json" => serde_json::from_str(contents)
            .map_err(|e| CacheError::Configuration(format!("Invalid JSON format: {e}"))),
        _ => Err(CacheError::Configuration(format!("Unsupported config format: {extension}"))),
    }
}

/// First existing settings file in the standard locations
pub fn probe_config_paths() -> Option<PathBuf> {
    let mut dirs = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        dirs.extend([cwd.clone(), cwd.join(".."), cwd.join("../..")]);
    }
    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            dirs.push(exe_dir.to_path_buf());
        }
    }

    dirs.iter()
        .flat_map(|dir| FILE_NAMES.iter().map(move |name| dir.join(name)))
        .find(|path| path.exists())
}

/// Parse `MEMORA_{suffix}` if set; blank values count as unset
fn env_parse<T>(suffix: &str) -> CacheResult<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    let key = format!("{ENV_PREFIX}{suffix}");
    let Ok(raw) = std::env::var(&key) else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse::<T>()
        .map(Some)
        .map_err(|e| CacheError::Configuration(format!("Invalid value for {key}: {e}")))
}
