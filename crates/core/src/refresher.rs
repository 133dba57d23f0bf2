//! Never-die refresh scheduler
//!
//! Entries registered here are recomputed in the background whenever their
//! own freshness deadline passes, so readers keep getting a value even when
//! the upstream is slow or failing. The store never expires them; each
//! [`NeverDieEntry`] tracks its deadline itself.
//!
//! Per entry the cycle is `fresh -> due -> refreshing -> fresh | backoff`.
//! A failed refresh keeps the previous value and pushes the next attempt out
//! to `now + ttl * backoff`, with `backoff` growing geometrically up to a
//! ceiling. A success resets `backoff` to 1.
//!
//! Blocking jobs run on short-lived worker threads. Async jobs are spawned on
//! the tokio runtime that was current when they were registered; if that
//! runtime is gone the entry is marked orphaned and skipped from then on.

use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use memora_common::{SharedClock, SystemClock};
use memora_domain::{CacheError, CacheKey, CacheResult, CallArgs, RefreshSettings};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// Deadline used when `now + delay` is not representable
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Recompute and store one entry, blocking the calling thread
pub type BlockingRefresh = Arc<dyn Fn() -> Result<(), String> + Send + Sync>;

/// Recompute and store one entry on a tokio runtime
pub type AsyncRefresh = Arc<dyn Fn() -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// How a never-die entry is recomputed
#[derive(Clone)]
pub enum RefreshJob {
    /// Run on a short-lived worker thread
    Blocking(BlockingRefresh),
    /// Spawned on `handle`, the runtime the entry was registered from
    Async {
        /// Runtime the entry was registered from
        handle: Handle,
        /// Future factory run on `handle`
        job: AsyncRefresh,
    },
}

impl fmt::Debug for RefreshJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocking(_) => f.write_str("RefreshJob::Blocking"),
            Self::Async { .. } => f.write_str("RefreshJob::Async"),
        }
    }
}

#[derive(Debug)]
struct Schedule {
    backoff: f64,
    next_due_at: Instant,
}

/// A call kept warm by the [`Refresher`]
///
/// Identity is the cache key; registering the same key twice is a no-op.
#[derive(Debug)]
pub struct NeverDieEntry {
    key: CacheKey,
    args: CallArgs,
    ignored_fields: BTreeSet<String>,
    ttl: Duration,
    job: RefreshJob,
    schedule: Mutex<Schedule>,
    orphaned: AtomicBool,
}

impl NeverDieEntry {
    /// Entry first due one `ttl` after `now`
    pub fn new(
        key: CacheKey,
        args: CallArgs,
        ignored_fields: BTreeSet<String>,
        ttl: Duration,
        job: RefreshJob,
        now: Instant,
    ) -> Self {
        Self {
            key,
            args,
            ignored_fields,
            ttl,
            job,
            schedule: Mutex::new(Schedule { backoff: 1.0, next_due_at: deadline(now, ttl) }),
            orphaned: AtomicBool::new(false),
        }
    }

    /// Key the entry refreshes
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Arguments of the call that registered the entry
    pub fn args(&self) -> &CallArgs {
        &self.args
    }

    /// Fields stripped before fingerprinting
    pub fn ignored_fields(&self) -> &BTreeSet<String> {
        &self.ignored_fields
    }

    /// Freshness window between successful refreshes
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Current backoff factor; 1 after a success
    pub fn backoff(&self) -> f64 {
        self.schedule.lock().backoff
    }

    /// Earliest instant the next refresh may start
    pub fn next_due_at(&self) -> Instant {
        self.schedule.lock().next_due_at
    }

    /// Whether a refresh may start at `now`
    pub fn is_due(&self, now: Instant) -> bool {
        now > self.schedule.lock().next_due_at
    }

    /// `true` once the runtime it refreshes on is gone
    pub fn is_orphaned(&self) -> bool {
        self.orphaned.load(Ordering::Acquire)
    }

    /// After a successful refresh
    pub fn reset(&self, now: Instant) {
        let mut schedule = self.schedule.lock();
        schedule.backoff = 1.0;
        schedule.next_due_at = deadline(now, self.ttl);
    }

    /// After a failed refresh
    pub fn revive(&self, now: Instant, settings: &RefreshSettings) {
        let mut schedule = self.schedule.lock();
        schedule.backoff =
            (schedule.backoff * settings.backoff_multiplier).min(settings.max_backoff);
        let delay = Duration::try_from_secs_f64(self.ttl.as_secs_f64() * schedule.backoff)
            .unwrap_or(FAR_FUTURE);
        schedule.next_due_at = deadline(now, delay);
    }

    fn orphan(&self) {
        self.orphaned.store(true, Ordering::Release);
    }
}

fn deadline(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay).or_else(|| now.checked_add(FAR_FUTURE)).unwrap_or(now)
}

enum InFlight {
    Thread(thread::JoinHandle<()>),
    Task { task: tokio::task::JoinHandle<()>, started: Arc<AtomicBool> },
}

impl InFlight {
    fn is_finished(&self) -> bool {
        match self {
            Self::Thread(handle) => handle.is_finished(),
            Self::Task { task, .. } => task.is_finished(),
        }
    }
}

struct Inner {
    registry: DashMap<CacheKey, Arc<NeverDieEntry>>,
    in_flight: Mutex<HashMap<CacheKey, InFlight>>,
    clock: SharedClock,
    settings: RefreshSettings,
    autostart: bool,
    loop_started: Mutex<bool>,
}

static GLOBAL: OnceCell<Refresher> = OnceCell::new();

/// Handle to a never-die registry and its scheduler loop
///
/// Clones share state. [`Refresher::global`] is the process-wide instance;
/// independent instances are used for isolated tests.
#[derive(Clone)]
pub struct Refresher {
    inner: Arc<Inner>,
}

impl fmt::Debug for Refresher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Refresher")
            .field("registered", &self.len())
            .field("autostart", &self.inner.autostart)
            .finish()
    }
}

impl Refresher {
    /// Refresher whose loop thread starts on first registration
    pub fn new(clock: SharedClock, settings: RefreshSettings) -> Self {
        Self::build(clock, settings, true)
    }

    /// Refresher without a loop thread; the owner drives [`Refresher::tick`]
    pub fn manual(clock: SharedClock, settings: RefreshSettings) -> Self {
        Self::build(clock, settings, false)
    }

    fn build(clock: SharedClock, settings: RefreshSettings, autostart: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: DashMap::new(),
                in_flight: Mutex::new(HashMap::new()),
                clock,
                settings,
                autostart,
                loop_started: Mutex::new(false),
            }),
        }
    }

    /// Process-wide refresher
    ///
    /// Created with default settings unless [`Refresher::init_global`] ran
    /// first.
    pub fn global() -> Self {
        GLOBAL.get_or_init(|| Self::new(SystemClock::shared(), RefreshSettings::default())).clone()
    }

    /// Create the process-wide refresher with `settings`
    ///
    /// Succeeds again with equal settings. Fails with a configuration error
    /// once the global refresher exists with different ones, since its loop
    /// may already be running on them.
    pub fn init_global(settings: RefreshSettings) -> CacheResult<Self> {
        settings.validate()?;
        let mut created = false;
        let global = GLOBAL.get_or_init(|| {
            created = true;
            Self::new(SystemClock::shared(), settings.clone())
        });

        if created {
            info!(
                tick_ms = settings.tick_millis,
                backoff_multiplier = settings.backoff_multiplier,
                max_backoff = settings.max_backoff,
                "refresher.global_configured"
            );
        } else if global.settings() != &settings {
            return Err(CacheError::Configuration(format!(
                "global refresher already running with {:?}",
                global.settings()
            )));
        }
        Ok(global.clone())
    }

    /// Clock deadlines are measured on
    pub fn clock(&self) -> &SharedClock {
        &self.inner.clock
    }

    /// Tick interval and backoff this refresher runs with
    pub fn settings(&self) -> &RefreshSettings {
        &self.inner.settings
    }

    /// Whether `key` is registered
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.registry.contains_key(key)
    }

    /// Registered entry for `key`
    pub fn get(&self, key: &CacheKey) -> Option<Arc<NeverDieEntry>> {
        self.inner.registry.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of registered entries
    pub fn len(&self) -> usize {
        self.inner.registry.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.inner.registry.is_empty()
    }

    /// Refreshes launched and not yet finished
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.lock().values().filter(|job| !job.is_finished()).count()
    }

    /// Add an entry unless its key is already registered
    ///
    /// Returns `true` when the entry was added.
    pub fn register(&self, entry: NeverDieEntry) -> bool {
        let key = entry.key.clone();
        let inserted = match self.inner.registry.entry(key.clone()) {
            MapEntry::Occupied(_) => false,
            MapEntry::Vacant(slot) => {
                slot.insert(Arc::new(entry));
                true
            }
        };

        if inserted {
            debug!(
                function_id = key.function_id(),
                digest = key.digest(),
                "refresher.registered"
            );
            self.ensure_loop();
        }
        inserted
    }

    /// Drop every registered entry and forget running refreshes
    pub fn clear(&self) {
        self.inner.registry.clear();
        self.inner.in_flight.lock().clear();
    }

    /// One scheduler pass: launch every due entry that is not already
    /// refreshing
    pub fn tick(&self) {
        let now = self.inner.clock.now();
        let mut in_flight = self.inner.in_flight.lock();
        self.reap(&mut in_flight);

        let due: Vec<Arc<NeverDieEntry>> = self
            .inner
            .registry
            .iter()
            .filter(|entry| !entry.is_orphaned() && entry.is_due(now))
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for entry in due {
            if in_flight.contains_key(entry.key()) {
                continue;
            }
            if let Some(job) = self.launch(&entry) {
                in_flight.insert(entry.key().clone(), job);
            }
        }
    }

    /// Forget finished refreshes; an async refresh that finished without
    /// ever starting lost its runtime
    fn reap(&self, in_flight: &mut HashMap<CacheKey, InFlight>) {
        in_flight.retain(|key, job| {
            if !job.is_finished() {
                return true;
            }
            if let InFlight::Task { started, .. } = job {
                if !started.load(Ordering::Acquire) {
                    if let Some(entry) = self.inner.registry.get(key) {
                        entry.orphan();
                    }
                    warn!(
                        function_id = key.function_id(),
                        digest = key.digest(),
                        "refresher.context_gone"
                    );
                }
            }
            false
        });
    }

    fn launch(&self, entry: &Arc<NeverDieEntry>) -> Option<InFlight> {
        let target = Arc::clone(entry);
        let refresher = self.clone();

        match &entry.job {
            RefreshJob::Blocking(job) => {
                let job = Arc::clone(job);
                let spawned = thread::Builder::new().name("memora-refresh".into()).spawn(move || {
                    let outcome = catch_unwind(AssertUnwindSafe(|| job()))
                        .unwrap_or_else(|payload| Err(panic_message(&*payload)));
                    refresher.finish(&target, outcome);
                });
                match spawned {
                    Ok(handle) => Some(InFlight::Thread(handle)),
                    Err(error) => {
                        warn!(
                            function_id = entry.key.function_id(),
                            error = %error,
                            "refresher.spawn_failed"
                        );
                        None
                    }
                }
            }
            RefreshJob::Async { handle, job } => {
                let job = Arc::clone(job);
                let started = Arc::new(AtomicBool::new(false));
                let flag = Arc::clone(&started);
                let task = handle.spawn(async move {
                    flag.store(true, Ordering::Release);
                    let outcome = AssertUnwindSafe(job())
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|payload| Err(panic_message(&*payload)));
                    refresher.finish(&target, outcome);
                });
                Some(InFlight::Task { task, started })
            }
        }
    }

    fn finish(&self, entry: &NeverDieEntry, outcome: Result<(), String>) {
        let now = self.inner.clock.now();
        match outcome {
            Ok(()) => {
                entry.reset(now);
                debug!(
                    function_id = entry.key.function_id(),
                    digest = entry.key.digest(),
                    "refresher.refreshed"
                );
            }
            Err(error) => {
                entry.revive(now, &self.inner.settings);
                debug!(
                    function_id = entry.key.function_id(),
                    digest = entry.key.digest(),
                    backoff = entry.backoff(),
                    error = %error,
                    "refresher.refresh_failed"
                );
            }
        }
    }

    fn ensure_loop(&self) {
        if !self.inner.autostart {
            return;
        }
        let mut started = self.inner.loop_started.lock();
        if *started {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let tick = self.inner.settings.tick();
        let spawned = thread::Builder::new()
            .name("memora-refresher".into())
            .spawn(move || run_loop(weak, tick));
        match spawned {
            Ok(_) => {
                *started = true;
                info!(tick_ms = tick.as_millis() as u64, "refresher.started");
            }
            Err(error) => warn!(error = %error, "refresher.start_failed"),
        }
    }
}

/// Exits once every [`Refresher`] handle is gone
fn run_loop(inner: Weak<Inner>, tick: Duration) {
    loop {
        thread::sleep(tick);
        let Some(inner) = inner.upgrade() else {
            debug!("refresher.stopped");
            return;
        };
        Refresher { inner }.tick();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for refresher.
    use std::sync::atomic::AtomicUsize;

    use memora_common::testing::{init_test_tracing, wait_until};
    use memora_common::{Clock, MockClock};

    use super::*;

    const TTL: Duration = Duration::from_secs(10);

    fn counting_job(calls: &Arc<AtomicUsize>, fail: &Arc<AtomicBool>) -> RefreshJob {
        let calls = Arc::clone(calls);
        let fail = Arc::clone(fail);
        RefreshJob::Blocking(Arc::new(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            if fail.load(Ordering::SeqCst) {
                Err("upstream down".to_string())
            } else {
                Ok(())
            }
        }))
    }

    fn entry(name: &str, job: RefreshJob, clock: &MockClock) -> NeverDieEntry {
        NeverDieEntry::new(
            CacheKey::new(name, "00"),
            CallArgs::new(),
            BTreeSet::new(),
            TTL,
            job,
            clock.now(),
        )
    }

    fn settle(refresher: &Refresher) {
        assert!(wait_until(Duration::from_secs(5), || refresher.in_flight() == 0));
    }

    /// Advance to just past the entry's deadline and run one refresh
    fn refresh_once(refresher: &Refresher, clock: &MockClock, key: &CacheKey) {
        let entry = refresher.get(key).unwrap();
        let wait = entry.next_due_at().duration_since(clock.now());
        clock.advance(wait + Duration::from_millis(1));
        refresher.tick();
        settle(refresher);
    }

    #[test]
    fn test_register_is_idempotent() {
        let clock = MockClock::new();
        let refresher = Refresher::manual(clock.shared(), RefreshSettings::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let fail = Arc::new(AtomicBool::new(false));

        assert!(refresher.register(entry("f", counting_job(&calls, &fail), &clock)));
        assert!(!refresher.register(entry("f", counting_job(&calls, &fail), &clock)));
        assert_eq!(refresher.len(), 1);
    }

    #[test]
    fn test_entry_is_not_refreshed_before_due() {
        let clock = MockClock::new();
        let refresher = Refresher::manual(clock.shared(), RefreshSettings::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let fail = Arc::new(AtomicBool::new(false));
        refresher.register(entry("f", counting_job(&calls, &fail), &clock));

        clock.advance(TTL);
        refresher.tick();
        settle(&refresher);

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    /// Validates backoff growth on repeated failures and reset on success.
    ///
    /// Assertions:
    /// - The delay to the next attempt never shrinks while failing
    /// - It never exceeds `ttl * 10` and reaches that ceiling
    /// - One success brings it back to `ttl`
    #[test]
    fn test_backoff_grows_caps_and_resets() {
        init_test_tracing();
        let clock = MockClock::new();
        let refresher = Refresher::manual(clock.shared(), RefreshSettings::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let fail = Arc::new(AtomicBool::new(true));
        let key = CacheKey::new("f", "00");
        refresher.register(entry("f", counting_job(&calls, &fail), &clock));

        let mut delays = Vec::new();
        for _ in 0..15 {
            refresh_once(&refresher, &clock, &key);
            let next = refresher.get(&key).unwrap().next_due_at();
            delays.push(next.duration_since(clock.now()));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 15);
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(delays.iter().all(|delay| *delay <= TTL * 10));
        assert_eq!(delays.last().copied(), Some(TTL * 10));
        assert!(delays[0] > TTL);

        fail.store(false, Ordering::SeqCst);
        refresh_once(&refresher, &clock, &key);

        let entry = refresher.get(&key).unwrap();
        assert_eq!(entry.next_due_at().duration_since(clock.now()), TTL);
        assert!((entry.backoff() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    #[allow(clippy::panic)]
    fn test_panicking_job_counts_as_failure() {
        let clock = MockClock::new();
        let refresher = Refresher::manual(clock.shared(), RefreshSettings::default());
        let key = CacheKey::new("f", "00");
        let job = RefreshJob::Blocking(Arc::new(|| -> Result<(), String> {
            panic!("refresh blew up")
        }));
        refresher.register(entry("f", job, &clock));

        refresh_once(&refresher, &clock, &key);

        assert!((refresher.get(&key).unwrap().backoff() - 1.25).abs() < 1e-9);
    }

    #[test]
    fn test_async_entry_on_dead_runtime_is_orphaned() {
        init_test_tracing();
        let clock = MockClock::new();
        let refresher = Refresher::manual(clock.shared(), RefreshSettings::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let key = CacheKey::new("f", "00");

        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let counter = Arc::clone(&calls);
        let job = RefreshJob::Async {
            handle: runtime.handle().clone(),
            job: Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<(), String>(()) }.boxed()
            }),
        };
        refresher.register(entry("f", job, &clock));
        drop(runtime);

        refresh_once(&refresher, &clock, &key);
        refresher.tick();

        let entry = refresher.get(&key).unwrap();
        assert!(entry.is_orphaned());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        clock.advance(TTL * 20);
        refresher.tick();
        settle(&refresher);
        assert_eq!(refresher.in_flight(), 0);
        assert_eq!(refresher.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_async_entry_refreshes_on_its_runtime() {
        let clock = MockClock::new();
        let refresher = Refresher::manual(clock.shared(), RefreshSettings::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let key = CacheKey::new("f", "00");

        let counter = Arc::clone(&calls);
        let job = RefreshJob::Async {
            handle: Handle::current(),
            job: Arc::new(move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), String>(())
                }
                .boxed()
            }),
        };
        refresher.register(entry("f", job, &clock));

        clock.advance(TTL + Duration::from_millis(1));
        refresher.tick();
        for _ in 0..200 {
            if calls.load(Ordering::SeqCst) == 1 && refresher.in_flight() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            refresher.get(&key).unwrap().next_due_at().duration_since(clock.now()),
            TTL
        );
    }

    #[test]
    fn test_clear_empties_registry() {
        let clock = MockClock::new();
        let refresher = Refresher::manual(clock.shared(), RefreshSettings::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let fail = Arc::new(AtomicBool::new(false));
        refresher.register(entry("f", counting_job(&calls, &fail), &clock));
        refresher.register(entry("g", counting_job(&calls, &fail), &clock));

        refresher.clear();

        assert!(refresher.is_empty());
        assert!(refresher.get(&CacheKey::new("f", "00")).is_none());
    }
}
