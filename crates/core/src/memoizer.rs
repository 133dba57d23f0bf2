//! The memoization pipeline
//!
//! Every call goes through the same steps:
//!
//! 1. Fingerprint the arguments into a [`CacheKey`]
//! 2. Never-die only: register the call with the [`Refresher`]
//! 3. Look the key up without locking (skipped for `skip_cache` calls)
//! 4. On a miss, take the keyed lock and look again, so callers that missed
//!    together collapse onto one computation
//! 5. Still missing: compute, store with the configured TTL, return
//!
//! For any number of concurrent callers with the same key the computation
//! runs once per miss, provided they use the same call style.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use memora_domain::constants::DEFAULT_TTL_SECS;
use memora_domain::{
    positive_secs, ArgValue, CacheError, CacheKey, CacheResult, CallArgs, CallError,
    FingerprintMode, KeyFn,
};
use tokio::runtime::Handle;
use tracing::{debug, trace};

use crate::fingerprint::Fingerprinter;
use crate::ports::{KeyedLock, Store};
use crate::refresher::{AsyncRefresh, BlockingRefresh, NeverDieEntry, RefreshJob, Refresher};

/// Wraps computations for one function id
pub struct Memoizer<V> {
    function_id: Arc<str>,
    ttl: Duration,
    never_die: bool,
    key_fn: Option<KeyFn>,
    ignore_fields: BTreeSet<String>,
    fingerprinter: Fingerprinter,
    store: Arc<dyn Store<V>>,
    lock: Arc<dyn KeyedLock>,
    refresher: Refresher,
}

impl<V> Clone for Memoizer<V> {
    fn clone(&self) -> Self {
        Self {
            function_id: Arc::clone(&self.function_id),
            ttl: self.ttl,
            never_die: self.never_die,
            key_fn: self.key_fn.clone(),
            ignore_fields: self.ignore_fields.clone(),
            fingerprinter: self.fingerprinter,
            store: Arc::clone(&self.store),
            lock: Arc::clone(&self.lock),
            refresher: self.refresher.clone(),
        }
    }
}

impl<V> fmt::Debug for Memoizer<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memoizer")
            .field("function_id", &self.function_id)
            .field("ttl", &self.ttl)
            .field("never_die", &self.never_die)
            .field("mode", &self.fingerprinter.mode())
            .field("ignore_fields", &self.ignore_fields)
            .finish_non_exhaustive()
    }
}

impl<V> Memoizer<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Start configuring a memoizer for `function_id`
    pub fn builder(function_id: impl Into<Arc<str>>) -> MemoizerBuilder<V> {
        MemoizerBuilder::new(function_id)
    }

    /// Namespace of every key this memoizer produces
    pub fn function_id(&self) -> &str {
        &self.function_id
    }

    /// Freshness window of stored results
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Whether results are kept warm by the refresher
    pub fn is_never_die(&self) -> bool {
        self.never_die
    }

    /// Fingerprinter deriving this memoizer's keys
    pub fn fingerprinter(&self) -> Fingerprinter {
        self.fingerprinter
    }

    /// Refresher never-die calls register with
    pub fn refresher(&self) -> &Refresher {
        &self.refresher
    }

    /// Cache key these arguments map to
    pub fn key_for(&self, args: &CallArgs) -> CacheResult<CacheKey> {
        self.fingerprinter.key_for(
            &self.function_id,
            args,
            self.key_fn.as_ref(),
            &self.ignore_fields,
        )
    }

    /// Store-level TTL; never-die entries manage freshness themselves
    fn store_ttl(&self) -> Option<Duration> {
        (!self.never_die).then_some(self.ttl)
    }

    /// Memoized blocking call
    ///
    /// `compute` is kept for never-die refreshes, hence `Fn` and `'static`.
    pub fn call_blocking<F, E>(&self, args: CallArgs, compute: F) -> Result<V, CallError<E>>
    where
        F: Fn() -> Result<V, E> + Send + Sync + 'static,
        E: fmt::Display + Send + 'static,
    {
        let key = self.key_for(&args)?;
        let compute = Arc::new(compute);
        if self.never_die {
            self.register_blocking(&key, &args, Arc::clone(&compute));
        }

        let skip = args.skips_cache();
        if !skip {
            if let Some(value) = self.store.get(&key)? {
                trace!(function_id = key.function_id(), digest = key.digest(), "memoizer.hit");
                return Ok(value);
            }
        }

        let _guard = self.lock.acquire_blocking(&key)?;
        if !skip {
            if let Some(value) = self.store.get(&key)? {
                debug!(
                    function_id = key.function_id(),
                    digest = key.digest(),
                    "memoizer.hit_after_wait"
                );
                return Ok(value);
            }
        }

        debug!(
            function_id = key.function_id(),
            digest = key.digest(),
            skip_cache = skip,
            "memoizer.miss"
        );
        let value = compute().map_err(CallError::Computation)?;
        self.store.set(&key, value.clone(), self.store_ttl())?;
        Ok(value)
    }

    /// Memoized async call
    ///
    /// Same pipeline as [`Memoizer::call_blocking`], with every wait
    /// suspending instead of blocking.
    pub async fn call<F, Fut, E>(&self, args: CallArgs, compute: F) -> Result<V, CallError<E>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let key = self.key_for(&args)?;
        let compute = Arc::new(compute);
        if self.never_die {
            self.register_async(&key, &args, Arc::clone(&compute))?;
        }

        let skip = args.skips_cache();
        if !skip {
            if let Some(value) = self.store.get_async(&key).await? {
                trace!(function_id = key.function_id(), digest = key.digest(), "memoizer.hit");
                return Ok(value);
            }
        }

        let _guard = self.lock.acquire(&key).await?;
        if !skip {
            if let Some(value) = self.store.get_async(&key).await? {
                debug!(
                    function_id = key.function_id(),
                    digest = key.digest(),
                    "memoizer.hit_after_wait"
                );
                return Ok(value);
            }
        }

        debug!(
            function_id = key.function_id(),
            digest = key.digest(),
            skip_cache = skip,
            "memoizer.miss"
        );
        let value = compute().await.map_err(CallError::Computation)?;
        self.store.set_async(&key, value.clone(), self.store_ttl()).await?;
        Ok(value)
    }

    /// Drop the stored result for these arguments
    pub fn invalidate_blocking(&self, args: &CallArgs) -> CacheResult<()> {
        let key = self.key_for(args)?;
        self.store.remove(&key)
    }

    /// Async form of [`Memoizer::invalidate_blocking`]
    pub async fn invalidate(&self, args: &CallArgs) -> CacheResult<()> {
        let key = self.key_for(args)?;
        self.store.remove_async(&key).await
    }

    fn never_die_entry(&self, key: &CacheKey, args: &CallArgs, job: RefreshJob) -> NeverDieEntry {
        NeverDieEntry::new(
            key.clone(),
            args.clone(),
            self.ignore_fields.clone(),
            self.ttl,
            job,
            self.refresher.clock().now(),
        )
    }

    fn register_blocking<F, E>(&self, key: &CacheKey, args: &CallArgs, compute: Arc<F>)
    where
        F: Fn() -> Result<V, E> + Send + Sync + 'static,
        E: fmt::Display + Send + 'static,
    {
        if self.refresher.contains(key) {
            return;
        }

        let store = Arc::clone(&self.store);
        let lock = Arc::clone(&self.lock);
        let target = key.clone();
        let job: BlockingRefresh = Arc::new(move || -> Result<(), String> {
            let _guard = lock.acquire_blocking(&target).map_err(|e| e.to_string())?;
            let value = compute().map_err(|e| e.to_string())?;
            store.set(&target, value, None).map_err(|e| e.to_string())
        });

        self.refresher.register(self.never_die_entry(key, args, RefreshJob::Blocking(job)));
    }

    fn register_async<F, Fut, E>(
        &self,
        key: &CacheKey,
        args: &CallArgs,
        compute: Arc<F>,
    ) -> CacheResult<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        if self.refresher.contains(key) {
            return Ok(());
        }
        let handle = Handle::try_current().map_err(|_| {
            CacheError::Configuration(
                "never_die async calls must run inside a tokio runtime".to_string(),
            )
        })?;

        let store = Arc::clone(&self.store);
        let lock = Arc::clone(&self.lock);
        let target = key.clone();
        let job: AsyncRefresh = Arc::new(move || -> BoxFuture<'static, Result<(), String>> {
            let store = Arc::clone(&store);
            let lock = Arc::clone(&lock);
            let target = target.clone();
            let compute = Arc::clone(&compute);
            async move {
                let _guard = lock.acquire(&target).await.map_err(|e| e.to_string())?;
                let value = compute().await.map_err(|e| e.to_string())?;
                store.set_async(&target, value, None).await.map_err(|e| e.to_string())?;
                Ok::<(), String>(())
            }
            .boxed()
        });

        self.refresher.register(self.never_die_entry(key, args, RefreshJob::Async { handle, job }));
        Ok(())
    }
}

/// Validating builder for [`Memoizer`]
pub struct MemoizerBuilder<V> {
    function_id: Arc<str>,
    ttl_secs: f64,
    never_die: bool,
    key_fn: Option<KeyFn>,
    ignore_fields: BTreeSet<String>,
    mode: FingerprintMode,
    store: Option<Arc<dyn Store<V>>>,
    lock: Option<Arc<dyn KeyedLock>>,
    refresher: Option<Refresher>,
}

impl<V> fmt::Debug for MemoizerBuilder<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoizerBuilder")
            .field("function_id", &self.function_id)
            .field("ttl_secs", &self.ttl_secs)
            .field("never_die", &self.never_die)
            .field("mode", &self.mode)
            .field("has_store", &self.store.is_some())
            .field("has_lock", &self.lock.is_some())
            .finish_non_exhaustive()
    }
}

impl<V> MemoizerBuilder<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Builder with the default TTL and isolated fingerprints
    pub fn new(function_id: impl Into<Arc<str>>) -> Self {
        Self {
            function_id: function_id.into(),
            ttl_secs: DEFAULT_TTL_SECS,
            never_die: false,
            key_fn: None,
            ignore_fields: BTreeSet::new(),
            mode: FingerprintMode::default(),
            store: None,
            lock: None,
            refresher: None,
        }
    }

    /// Freshness window of stored results
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl_secs = ttl.as_secs_f64();
        self
    }

    /// TTL in seconds; must be positive
    pub fn ttl_secs(mut self, secs: f64) -> Self {
        self.ttl_secs = secs;
        self
    }

    /// Keep results warm in the background instead of letting them expire
    pub fn never_die(mut self, enabled: bool) -> Self {
        self.never_die = enabled;
        self
    }

    /// Fingerprint `key_fn(args)` instead of the arguments
    pub fn key_fn<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&CallArgs) -> Option<ArgValue> + Send + Sync + 'static,
    {
        self.key_fn = Some(Arc::new(key_fn));
        self
    }

    /// Argument names left out of the fingerprint
    pub fn ignore_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignore_fields.extend(fields.into_iter().map(Into::into));
        self
    }

    /// Fingerprint strategy; isolated unless set
    pub fn fingerprint_mode(mut self, mode: FingerprintMode) -> Self {
        self.mode = mode;
        self
    }

    /// Backend results are stored in (required)
    pub fn store(mut self, store: Arc<dyn Store<V>>) -> Self {
        self.store = Some(store);
        self
    }

    /// Lock serializing misses per key (required)
    pub fn lock(mut self, lock: Arc<dyn KeyedLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Defaults to [`Refresher::global`]
    pub fn refresher(mut self, refresher: Refresher) -> Self {
        self.refresher = Some(refresher);
        self
    }

    /// Validate options before any call can happen
    pub fn build(self) -> CacheResult<Memoizer<V>> {
        if self.key_fn.is_some() && !self.ignore_fields.is_empty() {
            return Err(CacheError::configuration_conflict());
        }
        let ttl = positive_secs("ttl", self.ttl_secs)?;
        let store = self.store.ok_or_else(|| {
            CacheError::Configuration(format!("no store configured for {}", self.function_id))
        })?;
        let lock = self.lock.ok_or_else(|| {
            CacheError::Configuration(format!("no lock configured for {}", self.function_id))
        })?;

        Ok(Memoizer {
            function_id: self.function_id,
            ttl,
            never_die: self.never_die,
            key_fn: self.key_fn,
            ignore_fields: self.ignore_fields,
            fingerprinter: Fingerprinter::new(self.mode),
            store,
            lock,
            refresher: self.refresher.unwrap_or_else(Refresher::global),
        })
    }
}
