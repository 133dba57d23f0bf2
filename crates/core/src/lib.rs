//! # Memora Core
//!
//! Memoization logic with no infrastructure dependencies.
//!
//! This crate contains:
//! - [`fingerprint`]: argument trees to fixed-length digests
//! - [`entry`]: cached values with expiry bookkeeping
//! - [`ports`]: the [`Store`] and [`KeyedLock`] traits backends implement
//! - [`memoizer`]: the double-checked lookup/compute/store pipeline
//! - [`refresher`]: background refresh for never-die entries
//!
//! ## Architecture Principles
//! - Only depends on `memora-common` and `memora-domain`
//! - No network or storage code; backends arrive through the ports
//! - Every process-wide service can also be built standalone for tests

pub mod entry;
pub mod fingerprint;
pub mod memoizer;
pub mod ports;
pub mod refresher;

pub use entry::{Entry, WireEntry};
pub use fingerprint::Fingerprinter;
pub use memoizer::{Memoizer, MemoizerBuilder};
pub use ports::{with_lock, with_lock_blocking, KeyedLock, LockGuard, Store};
pub use refresher::{NeverDieEntry, RefreshJob, Refresher};
