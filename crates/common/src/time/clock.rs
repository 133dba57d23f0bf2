//! Time abstraction for testability
//!
//! Cache entries kept in-process are stamped with the monotonic clock so
//! wall-clock adjustments never resurrect or kill them early. Entries that
//! leave the process are stamped with wall-clock seconds since the epoch,
//! since a monotonic instant is meaningless to another process.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//!
//! use memora_common::time::{Clock, MockClock};
//!
//! let mock = MockClock::new();
//! let start = mock.now();
//! mock.advance(Duration::from_secs(5));
//! assert_eq!(mock.now().duration_since(start), Duration::from_secs(5));
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Trait for time operations to enable testing
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Get current instant (monotonic time)
    fn now(&self) -> Instant;

    /// Get current system time (wall clock)
    fn system_time(&self) -> SystemTime;

    /// Seconds since the UNIX epoch with sub-second precision
    fn unix_secs(&self) -> f64 {
        self.system_time().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
    }
}

/// Clock handle shared between stores, refreshers and memoizers
pub type SharedClock = Arc<dyn Clock>;

/// Real system clock implementation
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Shared handle to the system clock
    pub fn shared() -> SharedClock {
        Arc::new(Self)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Implement Clock for Arc<T> where T: Clock for convenient cloning
impl<T: Clock + ?Sized> Clock for Arc<T> {
    fn now(&self) -> Instant {
        (**self).now()
    }

    fn system_time(&self) -> SystemTime {
        (**self).system_time()
    }
}

/// Mock clock for deterministic testing
///
/// Both the monotonic and the wall clock advance together, and only when
/// [`MockClock::advance`] is called. Clones share the same elapsed time.
#[derive(Debug, Clone)]
pub struct MockClock {
    start: Instant,
    elapsed: Arc<Mutex<Duration>>,
    base_system_time: SystemTime,
}

impl MockClock {
    /// Create a new mock clock starting at the current real time
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            elapsed: Arc::new(Mutex::new(Duration::ZERO)),
            base_system_time: SystemTime::now(),
        }
    }

    /// Shared handle to a clone of this clock
    pub fn shared(&self) -> SharedClock {
        Arc::new(self.clone())
    }

    /// Advance the mock clock by a duration
    pub fn advance(&self, duration: Duration) {
        *self.elapsed.lock() += duration;
    }

    /// Advance the mock clock by milliseconds (convenience method)
    pub fn advance_millis(&self, millis: u64) {
        self.advance(Duration::from_millis(millis));
    }

    /// Get the current elapsed time
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock()
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.start + *self.elapsed.lock()
    }

    fn system_time(&self) -> SystemTime {
        self.base_system_time + *self.elapsed.lock()
    }
}
