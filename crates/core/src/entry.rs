//! Cached values with expiry bookkeeping
//!
//! [`Entry`] is stamped with the monotonic clock and never leaves the
//! process. [`WireEntry`] carries wall-clock seconds since the epoch so it
//! stays meaningful after a round trip through a networked store.
//!
//! Both follow the same rule: an entry without a TTL never expires, and an
//! entry with one is expired once `now > expires_at`.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// In-process cache entry
#[derive(Debug, Clone)]
pub struct Entry<V> {
    value: V,
    ttl: Option<Duration>,
    created_at: Instant,
    expires_at: Option<Instant>,
}

impl<V> Entry<V> {
    /// `expires_at` is fixed here, at creation
    pub fn new(value: V, ttl: Option<Duration>, now: Instant) -> Self {
        Self { value, ttl, created_at: now, expires_at: ttl.and_then(|ttl| now.checked_add(ttl)) }
    }

    /// Stored value
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Take the stored value
    pub fn into_value(self) -> V {
        self.value
    }

    /// TTL the entry was stored with; `None` never expires
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// Monotonic instant the entry was stored
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Deadline after which the entry reads as a miss
    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    /// `true` strictly after the deadline
    pub fn is_expired_at(&self, now: Instant) -> bool {
        match (self.ttl, self.expires_at) {
            (Some(_), Some(deadline)) => now > deadline,
            // A TTL too large to represent as an instant never lapses.
            _ => false,
        }
    }
}

/// Serialized form of an entry in a networked store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEntry<V> {
    /// Cached result
    pub value: V,
    /// TTL in seconds; absent for entries that never expire
    pub ttl_secs: Option<f64>,
    /// Wall-clock seconds since the UNIX epoch
    pub cached_at: f64,
    /// Wall-clock deadline, seconds since the UNIX epoch
    pub expires_at: Option<f64>,
}

impl<V> WireEntry<V> {
    /// Document for `value` stored at `now_secs`
    pub fn new(value: V, ttl: Option<Duration>, now_secs: f64) -> Self {
        let ttl_secs = ttl.map(|ttl| ttl.as_secs_f64());
        let expires_at = ttl_secs.map(|ttl| now_secs + ttl);
        Self { value, ttl_secs, cached_at: now_secs, expires_at }
    }

    /// `true` strictly after `expires_at`
    pub fn is_expired_at(&self, now_secs: f64) -> bool {
        match (self.ttl_secs, self.expires_at) {
            (Some(_), Some(deadline)) => now_secs > deadline,
            _ => false,
        }
    }

    /// Native expiry to request from the backend, in whole seconds
    ///
    /// Rounded up past the logical deadline so the key is never physically
    /// gone while the entry is still logically fresh.
    pub fn native_ttl_secs(&self) -> Option<u64> {
        self.ttl_secs.map(|ttl| (ttl.max(0.0).floor() as u64).saturating_add(1))
    }
}
