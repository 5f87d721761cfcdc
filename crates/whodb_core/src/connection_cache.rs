use crate::{Credential, EngineError};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, RwLock};
use std::time::{Duration, Instant};

/// A live driver handle owned by the cache.
///
/// The pool owns the handle; callers hold scoped `Lease` borrows. `close`
/// is called exactly once, after the last borrow is gone and the entry is
/// stale or explicitly removed.
pub trait ManagedConnection: Send + Sync + 'static {
    fn close(&self);

    /// Downcast hook so driver crates can reach their concrete handle type.
    fn as_any(&self) -> &dyn Any;
}

/// Deterministic cache key derived from a credential.
///
/// Kind, host, and user are lowercase-normalized; the advanced list is
/// sorted by key so permutations of the same parameters collide. The
/// password participates so a changed password invalidates the entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(credential: &Credential) -> Self {
        let mut advanced: Vec<(String, &str)> = credential
            .advanced
            .iter()
            .map(|r| (r.key.to_lowercase(), r.value.as_str()))
            .collect();
        advanced.sort_by(|a, b| a.0.cmp(&b.0));

        let advanced_part = advanced
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(";");

        Fingerprint(format!(
            "{}|{}|{}|{}|{}|{advanced_part}",
            credential.kind.id(),
            credential.hostname.to_lowercase(),
            credential.username.to_lowercase(),
            credential.database,
            credential.password,
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

struct CacheEntry {
    handle: Arc<dyn ManagedConnection>,
    /// Milliseconds since the cache epoch at the last acquire/release;
    /// one epoch for every entry so values are comparable across entries.
    last_used_at: AtomicU64,
    ref_count: AtomicUsize,
    /// Set by explicit removal or eviction; the last release closes.
    marked_for_removal: AtomicBool,
    closed: AtomicBool,
}

impl CacheEntry {
    fn new(handle: Arc<dyn ManagedConnection>) -> Self {
        Self {
            handle,
            last_used_at: AtomicU64::new(0),
            ref_count: AtomicUsize::new(0),
            marked_for_removal: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    fn touch(&self, epoch: Instant) {
        let elapsed = epoch.elapsed().as_millis() as u64;
        self.last_used_at.store(elapsed, Ordering::Relaxed);
    }

    fn idle_for(&self, epoch: Instant) -> Duration {
        let elapsed = epoch.elapsed().as_millis() as u64;
        let last = self.last_used_at.load(Ordering::Relaxed);
        Duration::from_millis(elapsed.saturating_sub(last))
    }

    fn is_idle(&self) -> bool {
        self.ref_count.load(Ordering::Acquire) == 0
    }

    fn close_once(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.handle.close();
        }
    }
}

/// Scoped borrow of a pooled connection. The entry's ref count is held for
/// the lifetime of the lease, which pins the handle against eviction.
pub struct Lease {
    entry: Arc<CacheEntry>,
    epoch: Instant,
}

impl Lease {
    pub fn handle(&self) -> &Arc<dyn ManagedConnection> {
        &self.entry.handle
    }

    /// Reach the driver's concrete handle type.
    pub fn downcast<T: 'static>(&self) -> Result<&T, EngineError> {
        self.entry
            .handle
            .as_any()
            .downcast_ref::<T>()
            .ok_or_else(|| EngineError::internal("cached handle has unexpected type"))
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.entry.touch(self.epoch);
        let remaining = self.entry.ref_count.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 && self.entry.marked_for_removal.load(Ordering::Acquire) {
            self.entry.close_once();
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CacheOptions {
    /// Idle entries older than this are closed by the janitor.
    pub ttl: Duration,
    /// Janitor period; must not exceed `ttl`.
    pub sweep_interval: Duration,
    /// Soft capacity; idle LRU entries are evicted on insert beyond it.
    pub max_entries: usize,
    /// Bounded wait for busy entries during shutdown.
    pub drain_timeout: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            max_entries: 64,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// Process-wide, reference-counted, TTL-evicted pool of live driver
/// handles, keyed by credential fingerprint across all engines.
///
/// A single RW lock guards the map; entries carry atomic counters so
/// acquire/release never take the map lock for bookkeeping. Per-key build
/// locks give concurrent misses on the same fingerprint singleflight
/// semantics without serializing unrelated keys.
pub struct ConnectionCache {
    entries: RwLock<HashMap<Fingerprint, Arc<CacheEntry>>>,
    building: Mutex<HashMap<Fingerprint, Arc<Mutex<()>>>>,
    options: CacheOptions,
    epoch: Instant,
    janitor_stop: Arc<(Mutex<bool>, Condvar)>,
}

impl ConnectionCache {
    pub fn new(options: CacheOptions) -> Arc<Self> {
        Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
            building: Mutex::new(HashMap::new()),
            options,
            epoch: Instant::now(),
            janitor_stop: Arc::new((Mutex::new(false), Condvar::new())),
        })
    }

    /// Spawn the background sweep thread. Called once at startup.
    pub fn start_janitor(self: &Arc<Self>) {
        let cache = Arc::clone(self);
        let stop = Arc::clone(&self.janitor_stop);
        let interval = self.options.sweep_interval.min(self.options.ttl);
        std::thread::Builder::new()
            .name("whodb-cache-janitor".into())
            .spawn(move || {
                let (lock, condvar) = &*stop;
                let mut stopped = lock.lock().unwrap_or_else(|e| e.into_inner());
                loop {
                    if *stopped {
                        return;
                    }
                    let (guard, _timeout) = condvar
                        .wait_timeout(stopped, interval)
                        .unwrap_or_else(|e| e.into_inner());
                    stopped = guard;
                    if *stopped {
                        return;
                    }
                    cache.sweep();
                }
            })
            .expect("failed to spawn cache janitor");
    }

    /// Acquire a handle, constructing one through `factory` on a miss.
    ///
    /// Concurrent misses on the same fingerprint share one construction;
    /// a factory error inserts nothing. The only suspension points are the
    /// factory call, the per-key build lock, and the map lock. A miss on
    /// one key never blocks behind another key's factory.
    pub fn get_or_create<F>(
        &self,
        credential: &Credential,
        factory: F,
    ) -> Result<Lease, EngineError>
    where
        F: FnOnce(&Credential) -> Result<Arc<dyn ManagedConnection>, EngineError>,
    {
        let key = Fingerprint::of(credential);

        if let Some(lease) = self.try_acquire(&key) {
            return Ok(lease);
        }

        let build_lock = {
            let mut building = self.building.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(building.entry(key.clone()).or_default())
        };
        let _build_guard = build_lock.lock().unwrap_or_else(|e| e.into_inner());

        // Another caller may have finished building while we waited.
        if let Some(lease) = self.try_acquire(&key) {
            return Ok(lease);
        }

        let handle = match factory(credential) {
            Ok(handle) => handle,
            Err(e) => {
                // The build lock must go too, or repeated connection
                // failures accumulate entries the janitor never sees.
                self.release_build_lock(&key);
                return Err(e);
            }
        };
        let entry = Arc::new(CacheEntry::new(handle));
        entry.ref_count.store(1, Ordering::Release);
        entry.touch(self.epoch);

        {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            if entries.len() >= self.options.max_entries {
                Self::evict_idle_lru(&mut entries);
            }
            // A failed build releases its lock early, so a raced second
            // construction can land here with an entry already present.
            // The newer handle wins; the displaced one closes on its last
            // release.
            if let Some(previous) = entries.insert(key.clone(), Arc::clone(&entry)) {
                previous.marked_for_removal.store(true, Ordering::Release);
                if previous.is_idle() {
                    previous.close_once();
                }
            }
        }

        self.release_build_lock(&key);

        log::debug!("cached new {} connection", credential.kind);
        Ok(Lease {
            entry,
            epoch: self.epoch,
        })
    }

    fn release_build_lock(&self, key: &Fingerprint) {
        self.building
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    fn try_acquire(&self, key: &Fingerprint) -> Option<Lease> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let entry = entries.get(key)?;
        // The ref count is taken while holding the read lock, so eviction
        // (which needs the write lock) can never observe this entry idle.
        entry.ref_count.fetch_add(1, Ordering::AcqRel);
        entry.touch(self.epoch);
        Some(Lease {
            entry: Arc::clone(entry),
            epoch: self.epoch,
        })
    }

    /// Remove the idle entry with the oldest last use. Busy entries are
    /// never evicted; if everything is busy the insert proceeds over
    /// capacity.
    fn evict_idle_lru(entries: &mut HashMap<Fingerprint, Arc<CacheEntry>>) {
        let victim = entries
            .iter()
            .filter(|(_, e)| e.is_idle())
            .min_by_key(|(_, e)| e.last_used_at.load(Ordering::Relaxed))
            .map(|(k, _)| k.clone());

        if let Some(key) = victim
            && let Some(entry) = entries.remove(&key)
        {
            entry.marked_for_removal.store(true, Ordering::Release);
            if entry.is_idle() {
                entry.close_once();
            }
        }
    }

    /// Close idle entries whose last use is older than the TTL. Busy
    /// entries stay, regardless of age.
    pub fn sweep(&self) {
        let mut closed = 0usize;
        {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            let stale: Vec<Fingerprint> = entries
                .iter()
                .filter(|(_, e)| e.is_idle() && e.idle_for(self.epoch) > self.options.ttl)
                .map(|(k, _)| k.clone())
                .collect();
            for key in stale {
                if let Some(entry) = entries.remove(&key) {
                    entry.marked_for_removal.store(true, Ordering::Release);
                    if entry.is_idle() {
                        entry.close_once();
                        closed += 1;
                    }
                }
            }
        }
        if closed > 0 {
            log::debug!("cache janitor closed {closed} idle connections");
        }
    }

    /// Drop the entry for a credential. Idle entries close now; busy ones
    /// close on last release. Calling twice is the same as calling once.
    pub fn remove(&self, credential: &Credential) {
        let key = Fingerprint::of(credential);
        let entry = {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            entries.remove(&key)
        };
        if let Some(entry) = entry {
            entry.marked_for_removal.store(true, Ordering::Release);
            if entry.is_idle() {
                entry.close_once();
            }
        }
    }

    /// Close everything: idle entries immediately, busy entries after a
    /// bounded wait for their leases to drop, then by force.
    pub fn shutdown(&self) {
        {
            let (lock, condvar) = &*self.janitor_stop;
            *lock.lock().unwrap_or_else(|e| e.into_inner()) = true;
            condvar.notify_all();
        }

        let drained: Vec<Arc<CacheEntry>> = {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            entries.drain().map(|(_, e)| e).collect()
        };

        let mut busy = Vec::new();
        for entry in drained {
            entry.marked_for_removal.store(true, Ordering::Release);
            if entry.is_idle() {
                entry.close_once();
            } else {
                busy.push(entry);
            }
        }

        let deadline = Instant::now() + self.options.drain_timeout;
        while !busy.is_empty() && Instant::now() < deadline {
            busy.retain(|e| !e.closed.load(Ordering::Acquire) && !e.is_idle());
            if busy.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        for entry in busy {
            log::warn!("force-closing a connection still in use at shutdown");
            entry.close_once();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

static GLOBAL: OnceLock<Arc<ConnectionCache>> = OnceLock::new();

/// The process-wide cache. First access initializes it with defaults and
/// starts the janitor; `init` may be called earlier to pick options.
pub fn global() -> &'static Arc<ConnectionCache> {
    GLOBAL.get_or_init(|| {
        let cache = ConnectionCache::new(CacheOptions::default());
        cache.start_janitor();
        cache
    })
}

/// Install the global cache with explicit options. Returns false when the
/// cache was already initialized.
pub fn init(options: CacheOptions) -> bool {
    let mut installed = false;
    GLOBAL.get_or_init(|| {
        installed = true;
        let cache = ConnectionCache::new(options);
        cache.start_janitor();
        cache
    });
    installed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DatabaseKind, Record};
    use std::sync::atomic::AtomicUsize;

    struct TestHandle {
        closes: Arc<AtomicUsize>,
    }

    impl ManagedConnection for TestHandle {
        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn credential(host: &str) -> Credential {
        let mut c = Credential::new(DatabaseKind::Postgres);
        c.hostname = host.into();
        c.username = "alice".into();
        c.password = "pw".into();
        c.database = "app".into();
        c
    }

    fn options(ttl_ms: u64, max: usize) -> CacheOptions {
        CacheOptions {
            ttl: Duration::from_millis(ttl_ms),
            sweep_interval: Duration::from_millis(ttl_ms),
            max_entries: max,
            drain_timeout: Duration::from_millis(200),
        }
    }

    fn handle_factory(
        calls: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    ) -> impl Fn(&Credential) -> Result<Arc<dyn ManagedConnection>, EngineError> {
        move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(TestHandle {
                closes: Arc::clone(&closes),
            }))
        }
    }

    #[test]
    fn hit_reuses_the_handle() {
        let cache = ConnectionCache::new(options(60_000, 8));
        let calls = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let factory = handle_factory(Arc::clone(&calls), Arc::clone(&closes));

        let first = cache.get_or_create(&credential("db.local"), &factory).unwrap();
        let second = cache.get_or_create(&credential("db.local"), &factory).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(first.handle(), second.handle()));
    }

    #[test]
    fn fingerprint_ignores_advanced_order_but_not_password() {
        let mut a = credential("db.local");
        a.advanced = vec![Record::new("Port", "5433"), Record::new("SSL Mode", "require")];
        let mut b = a.clone();
        b.advanced.reverse();
        assert_eq!(Fingerprint::of(&a), Fingerprint::of(&b));

        b.password = "changed".into();
        assert_ne!(Fingerprint::of(&a), Fingerprint::of(&b));

        let mut c = a.clone();
        c.hostname = "DB.LOCAL".into();
        assert_eq!(Fingerprint::of(&a), Fingerprint::of(&c));
    }

    #[test]
    fn singleflight_invokes_factory_once() {
        let cache = ConnectionCache::new(options(60_000, 128));
        let calls = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));

        let mut threads = Vec::new();
        for _ in 0..100 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            let closes = Arc::clone(&closes);
            threads.push(std::thread::spawn(move || {
                let lease = cache
                    .get_or_create(&credential("db.local"), |_| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(200));
                        Ok(Arc::new(TestHandle { closes }) as Arc<dyn ManagedConnection>)
                    })
                    .unwrap();
                Arc::as_ptr(lease.handle()) as *const () as usize
            }));
        }

        let pointers: Vec<usize> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(pointers.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn factory_error_inserts_nothing() {
        let cache = ConnectionCache::new(options(60_000, 8));
        let result = cache.get_or_create(&credential("db.local"), |_| {
            Err(EngineError::unavailable("connection refused"))
        });
        assert!(result.is_err());
        assert!(cache.is_empty());
        assert!(
            cache
                .building
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .is_empty(),
            "a failed build must not leave its lock behind"
        );

        // The key is not poisoned: a later attempt can succeed.
        let calls = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let factory = handle_factory(Arc::clone(&calls), closes);
        cache.get_or_create(&credential("db.local"), &factory).unwrap();
        assert_eq!(cache.len(), 1);
        assert!(
            cache
                .building
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .is_empty()
        );
    }

    #[test]
    fn sweep_closes_only_stale_idle_entries() {
        let cache = ConnectionCache::new(options(20, 8));
        let calls = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let factory = handle_factory(Arc::clone(&calls), Arc::clone(&closes));

        let busy = cache.get_or_create(&credential("busy.local"), &factory).unwrap();
        drop(cache.get_or_create(&credential("idle.local"), &factory).unwrap());

        std::thread::sleep(Duration::from_millis(40));
        cache.sweep();

        assert_eq!(cache.len(), 1, "busy entry must survive the sweep");
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        drop(busy);
        std::thread::sleep(Duration::from_millis(40));
        cache.sweep();
        assert!(cache.is_empty());
        assert_eq!(closes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn capacity_evicts_oldest_idle_entry() {
        let cache = ConnectionCache::new(options(60_000, 2));
        let calls = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let factory = handle_factory(Arc::clone(&calls), Arc::clone(&closes));

        drop(cache.get_or_create(&credential("first.local"), &factory).unwrap());
        std::thread::sleep(Duration::from_millis(5));
        drop(cache.get_or_create(&credential("second.local"), &factory).unwrap());
        std::thread::sleep(Duration::from_millis(5));
        cache.get_or_create(&credential("third.local"), &factory).unwrap();

        assert_eq!(cache.len(), 2);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn capacity_never_evicts_busy_entries() {
        let cache = ConnectionCache::new(options(60_000, 1));
        let calls = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let factory = handle_factory(Arc::clone(&calls), Arc::clone(&closes));

        let _held = cache.get_or_create(&credential("first.local"), &factory).unwrap();
        let _also_held = cache.get_or_create(&credential("second.local"), &factory).unwrap();

        // Both are busy: the cache accepts the insert over capacity.
        assert_eq!(cache.len(), 2);
        assert_eq!(closes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn remove_is_idempotent_and_defers_to_last_release() {
        let cache = ConnectionCache::new(options(60_000, 8));
        let calls = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let factory = handle_factory(Arc::clone(&calls), Arc::clone(&closes));

        let lease = cache.get_or_create(&credential("db.local"), &factory).unwrap();
        cache.remove(&credential("db.local"));
        cache.remove(&credential("db.local"));

        // Busy at removal time: nothing closed yet.
        assert_eq!(closes.load(Ordering::SeqCst), 0);
        drop(lease);
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        cache.remove(&credential("db.local"));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn shutdown_force_closes_after_bounded_wait() {
        let cache = ConnectionCache::new(options(60_000, 8));
        let calls = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let factory = handle_factory(Arc::clone(&calls), Arc::clone(&closes));

        let _held = cache.get_or_create(&credential("db.local"), &factory).unwrap();
        drop(cache.get_or_create(&credential("other.local"), &factory).unwrap());

        cache.shutdown();
        assert_eq!(closes.load(Ordering::SeqCst), 2);
    }
}
