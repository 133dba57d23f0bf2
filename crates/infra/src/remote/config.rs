//! Networked backend configuration
//!
//! A [`RemoteConfig`] bundles the client handles with [`RemoteSettings`].
//! One instance can be installed process-wide with [`setup_remote_config`];
//! installing a second one fails until [`reset_remote_config`] is called.
//! Stores and leases built against the global config resolve it on every
//! call, so they can be constructed before the config is installed.

use std::sync::Arc;

use memora_common::{SharedClock, SystemClock};
use memora_domain::{CacheError, CacheKey, CacheResult, RemoteSettings};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::info;

use super::client::{AsyncKvClient, KvClient};

static GLOBAL: Lazy<RwLock<Option<Arc<RemoteConfig>>>> = Lazy::new(|| RwLock::new(None));

/// Client handles and settings for the networked backend
#[derive(Clone)]
pub struct RemoteConfig {
    sync_client: Option<Arc<dyn KvClient>>,
    async_client: Option<Arc<dyn AsyncKvClient>>,
    settings: RemoteSettings,
    clock: SharedClock,
}

impl std::fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("sync_client", &self.sync_client.is_some())
            .field("async_client", &self.async_client.is_some())
            .field("settings", &self.settings)
            .finish()
    }
}

impl RemoteConfig {
    /// Configuration without clients, on the system clock
    pub fn new(settings: RemoteSettings) -> Self {
        Self { sync_client: None, async_client: None, settings, clock: SystemClock::shared() }
    }

    /// Client used by blocking calls
    pub fn with_sync_client(mut self, client: Arc<dyn KvClient>) -> Self {
        self.sync_client = Some(client);
        self
    }

    /// Client used by async calls
    pub fn with_async_client(mut self, client: Arc<dyn AsyncKvClient>) -> Self {
        self.async_client = Some(client);
        self
    }

    /// Clock used for the wall-clock stamps of serialized entries
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Blocking client, or a configuration error when none was set up
    pub fn sync_client(&self) -> CacheResult<&Arc<dyn KvClient>> {
        self.sync_client.as_ref().ok_or_else(|| {
            CacheError::Configuration(
                "blocking call on the networked backend but no blocking client is configured"
                    .into(),
            )
        })
    }

    /// Async client, or a configuration error when none was set up
    pub fn async_client(&self) -> CacheResult<&Arc<dyn AsyncKvClient>> {
        self.async_client.as_ref().ok_or_else(|| {
            CacheError::Configuration(
                "async call on the networked backend but no async client is configured".into(),
            )
        })
    }

    /// Prefix, lock timeout and failure policy
    pub fn settings(&self) -> &RemoteSettings {
        &self.settings
    }

    /// Clock stamping wire entries
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Backend key holding the entry for `key`
    pub fn entry_key(&self, key: &CacheKey) -> String {
        format!("{}:{}:{}", self.settings.key_prefix, key.function_id(), key.digest())
    }

    /// Backend key holding the lease token for `key`
    pub fn lock_key(&self, key: &CacheKey) -> String {
        format!("{}:lock:{}:{}", self.settings.key_prefix, key.function_id(), key.digest())
    }

    /// At least one client is required and the settings must be usable
    pub fn validate(&self) -> CacheResult<()> {
        if self.sync_client.is_none() && self.async_client.is_none() {
            return Err(CacheError::Configuration(
                "networked backend needs a blocking or an async client".into(),
            ));
        }
        self.settings.validate()
    }
}

/// Install the process-wide remote configuration
///
/// # Errors
///
/// Fails when `config` is invalid or a configuration is already installed.
pub fn setup_remote_config(config: RemoteConfig) -> CacheResult<Arc<RemoteConfig>> {
    config.validate()?;
    let mut slot = GLOBAL.write();
    if slot.is_some() {
        return Err(CacheError::Configuration(
            "remote configuration is already set up; call reset_remote_config first".into(),
        ));
    }
    let config = Arc::new(config);
    *slot = Some(Arc::clone(&config));
    info!(
        key_prefix = %config.settings.key_prefix,
        lock_timeout_secs = config.settings.lock_timeout_secs,
        on_error = %config.settings.on_error,
        "remote_config.installed"
    );
    Ok(config)
}

/// The installed configuration, if any
pub fn remote_config() -> Option<Arc<RemoteConfig>> {
    GLOBAL.read().clone()
}

/// Remove the installed configuration; returns the previous one
pub fn reset_remote_config() -> Option<Arc<RemoteConfig>> {
    GLOBAL.write().take()
}

/// Where a store or lease finds its configuration
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// The process-wide configuration, looked up on each call
    Global,
    /// A configuration bound at construction
    Fixed(Arc<RemoteConfig>),
}

impl ConfigSource {
    /// Configuration to use for the current call
    pub fn resolve(&self) -> CacheResult<Arc<RemoteConfig>> {
        match self {
            Self::Global => remote_config().ok_or_else(|| {
                CacheError::Configuration(
                    "networked backend used before setup_remote_config was called".into(),
                )
            }),
            Self::Fixed(config) => Ok(Arc::clone(config)),
        }
    }
}
