//! Testing utilities and helpers
//!
//! - [`init_test_tracing`]: install a `tracing` subscriber once per test
//!   binary, filtered by `RUST_LOG` (defaults to `debug` for memora crates)
//! - [`wait_until`]: poll a predicate until it holds or a deadline passes
//!
//! ## Usage
//!
//! ```rust
//! use std::time::Duration;
//!
//! use memora_common::testing::{init_test_tracing, wait_until};
//!
//! init_test_tracing();
//! assert!(wait_until(Duration::from_millis(50), || true));
//! ```

// Allow missing panic docs for test utilities
#![allow(clippy::missing_panics_doc)]

use std::time::{Duration, Instant};

use tracing_subscriber::EnvFilter;

const DEFAULT_TEST_FILTER: &str = "memora_core=debug,memora_infra=debug";

/// Install a test subscriber writing through the test harness capture
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_test_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_TEST_FILTER));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_test_writer().try_init();
}

/// Poll `predicate` every few milliseconds until it returns `true`
///
/// Returns `false` if `timeout` elapses first.
pub fn wait_until<F>(timeout: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}
