//! In-process backend
//!
//! - [`MemoryStore`]: type-erased concurrent map with monotonic expiry
//! - [`LocalLocks`]: per-key mutex registry for threads and tasks
//! - sweeper: background purge of expired entries, one thread per store

pub mod locks;
pub mod store;
pub mod sweeper;

pub use locks::LocalLocks;
pub use store::MemoryStore;
