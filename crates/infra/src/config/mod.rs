//! Settings loading
//!
//! Settings come from an optional TOML or JSON file, then `MEMORA_*`
//! environment variables override individual fields.

pub mod loader;

pub use loader::{load, load_from_env, load_from_file, probe_config_paths};
