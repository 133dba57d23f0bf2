//! Synchronization helpers
//!
//! - [`backoff`]: capped exponential delays with jitter for poll-and-wait
//!   loops (distributed lease acquisition)

pub mod backoff;

pub use backoff::Backoff;
