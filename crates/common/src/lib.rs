//! Modular common utilities shared across Memora crates.
//!
//! # Modules
//!
//! - `time`: clock abstraction (monotonic + wall clock) with a mock for tests
//! - `sync`: capped exponential backoff used by polling waiters
//! - `testing`: tracing bootstrap and polling helpers (`test-utils` feature)

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod sync;
pub mod time;

// Testing utilities
// ---------------------------------------------------------------
#[cfg(any(feature = "test-utils", test))]
pub mod testing;

// Re-export commonly used types and traits for convenience
// ------------------------
pub use sync::backoff::Backoff;
pub use time::clock::{Clock, MockClock, SharedClock, SystemClock};
