//! Background purge of expired in-process entries
//!
//! Not needed for correctness (reads re-check expiry); it only keeps the map
//! from growing without bound. One named thread per store, started at most
//! once, holding a weak reference so it exits after its store is dropped.

use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use memora_domain::{CacheError, CacheResult};
use tracing::{debug, info, warn};

use super::store::{Inner, MemoryStore};

impl MemoryStore {
    /// Start the sweeper thread unless one is already running
    ///
    /// Returns `true` if this call started it.
    pub fn start_sweeper(&self, interval: Duration) -> bool {
        let mut running = self.inner.sweep_interval.lock();
        if running.is_some() {
            return false;
        }

        let store = Arc::downgrade(&self.inner);
        let spawned = thread::Builder::new()
            .name("memora-sweeper".into())
            .spawn(move || sweep_loop(store, interval));
        match spawned {
            Ok(_) => {
                *running = Some(interval);
                info!(interval_secs = interval.as_secs_f64(), "sweeper.started");
                true
            }
            Err(error) => {
                warn!(error = %error, "sweeper.start_failed");
                false
            }
        }
    }

    /// Like [`MemoryStore::start_sweeper`], but a sweeper already running
    /// at another interval is a configuration error
    pub fn require_sweeper(&self, interval: Duration) -> CacheResult<()> {
        self.start_sweeper(interval);
        match self.sweeper_interval() {
            Some(running) if running == interval => Ok(()),
            Some(running) => Err(CacheError::Configuration(format!(
                "sweeper already running every {}s, {}s requested",
                running.as_secs_f64(),
                interval.as_secs_f64()
            ))),
            None => Err(CacheError::Configuration("sweeper thread could not start".into())),
        }
    }

    /// Whether a sweeper thread is running
    pub fn sweeper_started(&self) -> bool {
        self.sweeper_interval().is_some()
    }

    /// Interval of the running sweeper
    pub fn sweeper_interval(&self) -> Option<Duration> {
        *self.inner.sweep_interval.lock()
    }

    /// One sweep pass; returns how many entries were dropped
    pub fn sweep_once(&self) -> usize {
        sweep(&self.inner)
    }
}

fn sweep(inner: &Inner) -> usize {
    let removed = inner.purge_expired();
    if removed > 0 {
        debug!(removed, remaining = inner.entries.len(), "sweeper.swept");
    }
    removed
}

fn sweep_loop(store: Weak<Inner>, interval: Duration) {
    loop {
        thread::sleep(interval);
        let Some(inner) = store.upgrade() else {
            debug!("sweeper.stopped");
            return;
        };
        sweep(&inner);
    }
}
