//! Time utilities
//!
//! Everything that reads "now" goes through [`clock::Clock`] so expiry and
//! backoff logic can be driven deterministically from tests.

pub mod clock;

pub use clock::{Clock, MockClock, SharedClock, SystemClock};
