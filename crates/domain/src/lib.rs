//! # Memora Domain
//!
//! Value types shared by every Memora crate.
//!
//! This crate contains:
//! - The call-argument model ([`ArgValue`], [`CallArgs`]) that fingerprints
//!   are computed over
//! - [`CacheKey`], the `(function id, digest)` pair that identifies one
//!   memoized result
//! - Error types and Result definitions
//! - Settings structures and their defaults
//!
//! ## Architecture
//! - No dependencies on other Memora crates
//! - Pure data types; no I/O

pub mod args;
pub mod config;
pub mod constants;
pub mod errors;
pub mod key;

// Re-export commonly used items
pub use args::{ArgValue, CallArgs, KeyFn, OpaqueArg, SharedArg};
pub use config::*;
pub use errors::*;
pub use key::CacheKey;
