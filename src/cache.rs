//! Keyed store of resource entries.
//!
//! Every entry carries a generation counter. Each dispatch bumps it, and a
//! loader response is committed only if the generation it was started with
//! is still current. Responses for superseded attempts are dropped and
//! reported to the tracer.
//!
//! Dispatching a key whose attempt is still in flight with equal parameters
//! joins that attempt instead of calling the loader again, unless the key was
//! invalidated in the meantime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use crate::spawn::{AlwaysSome, SharedOutcome};
use crate::{
    CacheAccess, Cell, CommitOutcome, Dispatch, EventEmitter, ListenerGuard, LoadError, Loader,
    ResourceState, ResourceStatus, Runtime, Signal,
};

/// Bounds shared by every parameter and value type stored in a cache.
pub trait Data: Clone + PartialEq + Send + Sync + 'static {}

impl<T: Clone + PartialEq + Send + Sync + 'static> Data for T {}

/// What happened to an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEventKind {
    /// A load was started.
    Dispatched,
    /// A load outcome was accepted.
    Committed,
    /// The value was overwritten in place.
    Patched,
    /// The entry was marked stale.
    Invalidated,
    /// The entry was removed.
    Evicted,
}

/// Notification delivered to [`ResourceCache::subscribe`] listeners.
#[derive(Debug, Clone)]
pub struct CacheEvent<P, V> {
    /// What happened.
    pub kind: CacheEventKind,
    /// Entry snapshot right after the change.
    pub state: ResourceState<P, V>,
}

/// Extension point invoked on entry creation and on every accepted commit.
pub trait EntryHook<P, V>: Send + Sync + 'static {
    /// Value to seed a newly created entry with. The entry starts in
    /// [`ResourceStatus::Local`] when this returns `Some`.
    fn restore(&self, _key: &str) -> Option<(V, Option<P>)> {
        None
    }

    /// Called after an outcome is committed.
    fn on_commit(&self, _state: &ResourceState<P, V>) {}
}

pub(crate) struct Entry<P, V> {
    pub(crate) key: String,
    pub(crate) state: Cell<ResourceState<P, V>>,
    control: Mutex<Control>,
    /// Outcome of the attempt in flight, for dispatches that join it.
    joinable: Mutex<Option<(u64, SharedOutcome<Option<V>>)>>,
    stale: AtomicBool,
    settled: Notify,
}

#[derive(Default)]
struct Control {
    generation: u64,
    inflight: Option<u64>,
}

impl<P: Data, V: Data> Entry<P, V> {
    fn new(runtime: &Runtime, key: &str, initial: ResourceState<P, V>) -> Self {
        Self {
            key: key.to_string(),
            state: runtime.named_cell(key, initial),
            control: Mutex::new(Control::default()),
            joinable: Mutex::new(None),
            stale: AtomicBool::new(false),
            settled: Notify::new(),
        }
    }

    pub(crate) fn is_in_flight(&self) -> bool {
        self.control.lock().inflight.is_some()
    }

    pub(crate) async fn until_settled(&self) -> ResourceState<P, V> {
        loop {
            let notified = self.settled.notified();
            if !self.is_in_flight() {
                return self.state.get();
            }
            notified.await;
        }
    }
}

/// A keyed store of [`ResourceState`] entries.
///
/// The cache lives exactly as long as its handles: create one per component
/// for scoped caching, or keep one in shared application state for
/// process-wide caching. Cloning is cheap.
pub struct ResourceCache<P, V> {
    inner: Arc<CacheInner<P, V>>,
}

struct CacheInner<P, V> {
    name: String,
    runtime: Runtime,
    entries: papaya::HashMap<String, Arc<Entry<P, V>>, ahash::RandomState>,
    hooks: RwLock<Vec<Arc<dyn EntryHook<P, V>>>>,
    events: Arc<EventEmitter<CacheEvent<P, V>>>,
}

impl<P, V> Clone for ResourceCache<P, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P, V> std::fmt::Debug for ResourceCache<P, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceCache")
            .field("name", &self.inner.name)
            .field("entries", &self.inner.entries.len())
            .finish()
    }
}

impl<P: Data, V: Data> ResourceCache<P, V> {
    /// Create an empty cache. `name` identifies it in logs and tracer events.
    pub fn new(runtime: &Runtime, name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                name: name.into(),
                runtime: runtime.clone(),
                entries: papaya::HashMap::with_hasher(ahash::RandomState::new()),
                hooks: RwLock::new(Vec::new()),
                events: Arc::new(EventEmitter::new()),
            }),
        }
    }

    /// Name used in logs and tracer events.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The runtime this cache schedules on.
    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    /// Install a hook. Hooks run in installation order.
    pub fn add_hook(&self, hook: impl EntryHook<P, V>) {
        self.inner.hooks.write().push(Arc::new(hook));
    }

    /// Listen to every entry change. The listener is removed when the guard
    /// is dropped.
    pub fn subscribe(
        &self,
        listener: impl Fn(&CacheEvent<P, V>) + Send + Sync + 'static,
    ) -> ListenerGuard {
        self.inner.events.subscribe(listener)
    }

    /// Snapshot of the entry for `key`, if it exists.
    pub fn get(&self, key: &str) -> Option<ResourceState<P, V>> {
        self.lookup(key).map(|entry| entry.state.get())
    }

    /// Check if an entry exists for `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.entries.pin().contains_key(key)
    }

    /// Keys of all entries, in no particular order.
    pub fn keys(&self) -> Vec<String> {
        self.inner.entries.pin().keys().cloned().collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    /// Check if the cache has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the entry for `key`, creating it if absent. New entries
    /// are idle unless a hook restores a value for them.
    pub fn get_or_create(&self, key: &str) -> ResourceState<P, V> {
        self.entry(key).state.get()
    }

    /// Reactive view of the entry for `key`, creating it if absent.
    pub fn signal(&self, key: &str) -> Signal<ResourceState<P, V>> {
        self.entry(key).state.signal()
    }

    /// A handle that observes the entry for `key` without keeping it alive.
    pub fn reference(&self, key: &str) -> Option<ResourceRef<P, V>> {
        self.lookup(key).map(|entry| ResourceRef {
            entry: Arc::downgrade(&entry),
        })
    }

    /// Load `key` unless it is already resolved and fresh, or a load for it
    /// is already in flight.
    pub fn ensure(&self, key: &str, params: P, loader: &Arc<dyn Loader<P, V>>) -> CacheAccess {
        let entry = self.entry(key);
        let access = match self.begin(&entry, params.clone(), true) {
            Err(access) => access,
            Ok(generation) => {
                let loader = Arc::new(AlwaysSome(loader.clone()));
                drop(self.launch(entry, generation, params, loader, None));
                CacheAccess::Dispatched
            }
        };
        self.inner
            .runtime
            .tracer()
            .on_access(&self.inner.name, key, access);
        tracing::trace!(cache = %self.inner.name, key, ?access, "ensure");
        access
    }

    /// Load `key` with `params`.
    ///
    /// Joins the attempt in flight when it was started with equal parameters
    /// and the key was not invalidated since; the returned handle then
    /// resolves to that attempt's outcome. Otherwise starts a new attempt,
    /// superseding the one in flight.
    pub fn dispatch(&self, key: &str, params: P, loader: Arc<dyn Loader<P, V>>) -> Dispatch<V> {
        let entry = self.entry(key);
        let dispatch = match Self::join(&entry, &params) {
            Some(joined) => {
                self.inner
                    .runtime
                    .tracer()
                    .on_access(&self.inner.name, key, CacheAccess::Joined);
                tracing::trace!(cache = %self.inner.name, key, generation = joined.generation(), "joined dispatch");
                joined
            }
            None => {
                let generation = self
                    .inner
                    .runtime
                    .batch(|| Self::reserve(&entry, &mut entry.control.lock(), params.clone()));
                self.announce(&entry, generation);
                self.launch(entry, generation, params, Arc::new(AlwaysSome(loader)), None)
            }
        };
        dispatch.and_then(|value| value.ok_or(crate::CacheError::Cancelled))
    }

    /// A handle on the attempt in flight for `entry`, if it can serve `params`.
    fn join(entry: &Entry<P, V>, params: &P) -> Option<Dispatch<Option<V>>> {
        let control = entry.control.lock();
        let generation = control.inflight?;
        if entry.stale.load(Ordering::Acquire)
            || !entry.state.with(|s| s.params.as_ref() == Some(params))
        {
            return None;
        }
        let joinable = entry.joinable.lock();
        let (_, outcome) = joinable.as_ref().filter(|(g, _)| *g == generation)?;
        Some(Dispatch::joining(entry.key.clone(), generation, outcome.clone()))
    }

    /// Reserve a new generation for `key`, superseding any attempt in flight,
    /// and mark the entry as loading. Follow with [`launch`](Self::launch).
    pub(crate) fn start(&self, key: &str, params: P) -> (Arc<Entry<P, V>>, u64) {
        let entry = self.entry(key);
        let generation = self
            .inner
            .runtime
            .batch(|| Self::reserve(&entry, &mut entry.control.lock(), params));
        self.announce(&entry, generation);
        (entry, generation)
    }

    /// Run `loader` for a generation reserved by [`start`](Self::start).
    ///
    /// A `None` outcome commits [`ResourceStatus::Cancelled`] and clears the
    /// value. `on_settled` runs once the commit was attempted, with the
    /// loader's outcome and the committed snapshot if it was accepted.
    pub(crate) fn launch(
        &self,
        entry: Arc<Entry<P, V>>,
        generation: u64,
        params: P,
        loader: Arc<dyn Loader<P, Option<V>>>,
        on_settled: Option<SettleFn<P, V>>,
    ) -> Dispatch<Option<V>> {
        let (dispatch, tx) = Dispatch::channel(entry.key.clone(), generation);
        let (dispatch, shared) = dispatch.shared();
        *entry.joinable.lock() = Some((generation, shared));
        let cache: Weak<CacheInner<P, V>> = Arc::downgrade(&self.inner);
        self.inner.runtime.spawn(async move {
            let outcome = loader.load(params).await.map_err(LoadError::from);
            let committed = cache.upgrade().and_then(|inner| {
                ResourceCache { inner }.commit(&entry, generation, outcome.clone())
            });
            {
                let mut joinable = entry.joinable.lock();
                if joinable.as_ref().is_some_and(|(g, _)| *g == generation) {
                    *joinable = None;
                }
            }
            if let Some(on_settled) = on_settled {
                on_settled(&outcome, committed.as_ref());
            }
            let _ = tx.send(outcome.map_err(crate::CacheError::Load));
        });
        dispatch
    }

    /// Reserve the next generation and mark the entry as loading.
    ///
    /// With `only_if_needed`, returns how the request was served instead when
    /// the entry is in flight or resolved and fresh.
    fn begin(&self, entry: &Entry<P, V>, params: P, only_if_needed: bool) -> Result<u64, CacheAccess> {
        let generation = self.inner.runtime.batch(|| {
            let mut control = entry.control.lock();
            if only_if_needed && !entry.stale.load(Ordering::Acquire) {
                if control.inflight.is_some() {
                    return Err(CacheAccess::Joined);
                }
                if entry.state.with(|s| s.status == ResourceStatus::Resolved) {
                    return Err(CacheAccess::Hit);
                }
            }
            Ok(Self::reserve(entry, &mut control, params))
        })?;
        self.announce(entry, generation);
        Ok(generation)
    }

    fn reserve(entry: &Entry<P, V>, control: &mut Control, params: P) -> u64 {
        control.generation += 1;
        let generation = control.generation;
        control.inflight = Some(generation);
        entry.stale.store(false, Ordering::Release);
        entry.state.update(|s| {
            s.generation = generation;
            // Restored values keep reporting `local` until a load confirms them.
            if s.status != ResourceStatus::Local {
                s.status = ResourceStatus::Loading;
            }
            s.error = None;
            s.params = Some(params);
        });
        generation
    }

    fn announce(&self, entry: &Entry<P, V>, generation: u64) {
        self.inner
            .runtime
            .tracer()
            .on_dispatch(&self.inner.name, &entry.key, generation);
        tracing::debug!(cache = %self.inner.name, key = %entry.key, generation, "dispatch");
        self.emit(CacheEventKind::Dispatched, entry);
    }

    /// Apply a loader outcome if `generation` is still current.
    ///
    /// Returns the committed snapshot, or `None` when the outcome was stale.
    fn commit(
        &self,
        entry: &Arc<Entry<P, V>>,
        generation: u64,
        outcome: Result<Option<V>, LoadError>,
    ) -> Option<ResourceState<P, V>> {
        let registered = self
            .inner
            .entries
            .pin()
            .get(&entry.key)
            .is_some_and(|current| Arc::ptr_eq(current, entry));
        let tracer = self.inner.runtime.tracer();

        let current = self.inner.runtime.batch(|| {
            let mut control = entry.control.lock();
            if !registered || control.generation != generation {
                return Err(control.generation);
            }
            control.inflight = None;
            entry.state.update(|s| match outcome {
                Ok(Some(value)) => {
                    s.status = ResourceStatus::Resolved;
                    s.value = Some(value);
                    s.error = None;
                }
                Ok(None) => {
                    s.status = ResourceStatus::Cancelled;
                    s.value = None;
                    s.error = None;
                }
                Err(error) => {
                    s.status = ResourceStatus::Error;
                    s.error = Some(error);
                }
            });
            Ok(())
        });

        if let Err(current) = current {
            tracer.on_stale_discarded(&self.inner.name, &entry.key, generation, current);
            tracing::debug!(
                cache = %self.inner.name,
                key = %entry.key,
                generation,
                current,
                registered,
                "discarding stale response"
            );
            return None;
        }

        entry.settled.notify_waiters();
        let state = entry.state.get();
        let outcome = match (&state.status, &state.error) {
            (ResourceStatus::Error, Some(error)) => CommitOutcome::Failed {
                message: error.to_string(),
            },
            (ResourceStatus::Cancelled, _) => CommitOutcome::Cancelled,
            _ => CommitOutcome::Resolved,
        };
        tracer.on_commit(&self.inner.name, &entry.key, generation, outcome);
        tracing::debug!(cache = %self.inner.name, key = %entry.key, generation, status = %state.status, "commit");

        let hooks = self.inner.hooks.read().clone();
        for hook in hooks {
            hook.on_commit(&state);
        }
        self.inner.events.emit(&CacheEvent {
            kind: CacheEventKind::Committed,
            state: state.clone(),
        });
        Some(state)
    }

    /// Overwrite the value of an existing entry without changing its status.
    ///
    /// Returns `false` if there is no entry for `key`.
    pub fn set_value(&self, key: &str, value: V) -> bool {
        let Some(entry) = self.lookup(key) else {
            return false;
        };
        entry.state.update(|s| s.value = Some(value));
        self.emit(CacheEventKind::Patched, &entry);
        true
    }

    /// Mutate the value of an existing entry in place.
    ///
    /// Returns `false` if there is no entry for `key` or it holds no value.
    pub fn patch_value(&self, key: &str, f: impl FnOnce(&mut V)) -> bool {
        let Some(entry) = self.lookup(key) else {
            return false;
        };
        let mut patched = false;
        entry.state.update(|s| {
            if let Some(value) = s.value.as_mut() {
                f(value);
                patched = true;
            }
        });
        if patched {
            self.emit(CacheEventKind::Patched, &entry);
        }
        patched
    }

    /// Mark `key` stale so that the next [`ensure`](Self::ensure) or
    /// [`dispatch`](Self::dispatch) starts a new attempt, even while one is
    /// in flight.
    pub fn invalidate(&self, key: &str) {
        let Some(entry) = self.lookup(key) else {
            return;
        };
        entry.stale.store(true, Ordering::Release);
        self.inner
            .runtime
            .tracer()
            .on_invalidated(&self.inner.name, key);
        self.emit(CacheEventKind::Invalidated, &entry);
    }

    /// Mark every entry stale.
    pub fn invalidate_all(&self) {
        for key in self.keys() {
            self.invalidate(&key);
        }
    }

    /// Remove the entry for `key`. Responses still in flight for it are
    /// discarded. Returns `false` if there was no entry.
    pub fn evict(&self, key: &str) -> bool {
        let removed = self.inner.entries.pin().remove(key).cloned();
        let Some(entry) = removed else {
            return false;
        };
        entry.control.lock().inflight = None;
        entry.settled.notify_waiters();
        self.inner.runtime.tracer().on_evicted(&self.inner.name, key);
        tracing::debug!(cache = %self.inner.name, key, "evict");
        self.emit(CacheEventKind::Evicted, &entry);
        true
    }

    /// Remove every entry.
    pub fn clear(&self) {
        for key in self.keys() {
            self.evict(&key);
        }
    }

    /// Wait until no load is in flight for `key`. Returns `None` if there is
    /// no entry.
    pub async fn until_settled(&self, key: &str) -> Option<ResourceState<P, V>> {
        let entry = self.lookup(key)?;
        Some(entry.until_settled().await)
    }

    pub(crate) fn lookup(&self, key: &str) -> Option<Arc<Entry<P, V>>> {
        self.inner.entries.pin().get(key).cloned()
    }

    pub(crate) fn entry(&self, key: &str) -> Arc<Entry<P, V>> {
        self.inner
            .entries
            .pin()
            .get_or_insert_with(key.to_string(), || Arc::new(self.create(key)))
            .clone()
    }

    fn create(&self, key: &str) -> Entry<P, V> {
        let hooks = self.inner.hooks.read().clone();
        let restored = hooks.iter().find_map(|hook| hook.restore(key));
        let initial = match restored {
            Some((value, params)) => {
                tracing::debug!(cache = %self.inner.name, key, "restored entry");
                ResourceState::local(key, value, params)
            }
            None => ResourceState::idle(key),
        };
        Entry::new(&self.inner.runtime, key, initial)
    }

    fn emit(&self, kind: CacheEventKind, entry: &Entry<P, V>) {
        if self.inner.events.size() == 0 {
            return;
        }
        self.inner.events.emit(&CacheEvent {
            kind,
            state: entry.state.get(),
        });
    }
}

/// Called with a loader outcome and, if the commit was accepted, the
/// committed snapshot.
pub(crate) type SettleFn<P, V> =
    Box<dyn FnOnce(&Result<Option<V>, LoadError>, Option<&ResourceState<P, V>>) + Send>;

/// Lookup-only handle to one cache entry.
///
/// Does not keep the entry alive; once it is evicted every accessor reports
/// an idle entry with no value.
pub struct ResourceRef<P, V> {
    entry: Weak<Entry<P, V>>,
}

impl<P, V> Clone for ResourceRef<P, V> {
    fn clone(&self) -> Self {
        Self {
            entry: self.entry.clone(),
        }
    }
}

impl<P: Data, V: Data> ResourceRef<P, V> {
    /// Snapshot of the entry, or `None` once it has been evicted.
    pub fn snapshot(&self) -> Option<ResourceState<P, V>> {
        self.entry.upgrade().map(|entry| entry.state.get())
    }

    /// Current status.
    pub fn status(&self) -> ResourceStatus {
        self.snapshot().map_or(ResourceStatus::Idle, |s| s.status)
    }

    /// Current value.
    pub fn value(&self) -> Option<V> {
        self.snapshot().and_then(|s| s.value)
    }

    /// Check if a value is present.
    pub fn has_value(&self) -> bool {
        self.entry
            .upgrade()
            .is_some_and(|entry| entry.state.with(|s| s.value.is_some()))
    }

    /// Check if a load is in flight.
    pub fn is_loading(&self) -> bool {
        self.status().is_loading()
    }

    /// Error of the latest failed attempt.
    pub fn error(&self) -> Option<LoadError> {
        self.snapshot().and_then(|s| s.error)
    }

    /// Reactive view of the entry, or `None` once it has been evicted.
    pub fn signal(&self) -> Option<Signal<ResourceState<P, V>>> {
        self.entry.upgrade().map(|entry| entry.state.signal())
    }

    /// Wait until no load is in flight for this entry.
    pub async fn until_settled(&self) -> Option<ResourceState<P, V>> {
        let entry = self.entry.upgrade()?;
        Some(entry.until_settled().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ThreadSpawner;
    use std::sync::atomic::AtomicUsize;

    fn cache() -> ResourceCache<u32, String> {
        let runtime = Runtime::builder().spawner(ThreadSpawner).build();
        ResourceCache::new(&runtime, "test")
    }

    #[test]
    fn test_new_entry_is_idle() {
        let cache = cache();
        let state = cache.get_or_create("a");
        assert_eq!(state.status, ResourceStatus::Idle);
        assert_eq!(state.generation, 0);
        assert!(cache.contains("a"));
        assert!(cache.get("b").is_none());
    }

    #[test]
    fn test_begin_bumps_generation_and_keeps_value() {
        let cache = cache();
        let entry = cache.entry("a");
        entry.state.update(|s| {
            s.status = ResourceStatus::Error;
            s.value = Some("old".into());
            s.error = Some(LoadError::new(anyhow::anyhow!("boom")));
        });

        let generation = cache.begin(&entry, 7, false).unwrap();
        let state = entry.state.get();
        assert_eq!(generation, 1);
        assert_eq!(state.status, ResourceStatus::Loading);
        assert_eq!(state.value.as_deref(), Some("old"));
        assert!(state.error.is_none());
        assert_eq!(state.params, Some(7));
    }

    #[test]
    fn test_stale_commit_is_discarded() {
        let cache = cache();
        let entry = cache.entry("a");
        let first = cache.begin(&entry, 1, false).unwrap();
        let second = cache.begin(&entry, 2, false).unwrap();

        assert!(cache.commit(&entry, first, Ok(Some("one".into()))).is_none());
        assert_eq!(entry.state.get().status, ResourceStatus::Loading);

        let state = cache.commit(&entry, second, Ok(Some("two".into()))).unwrap();
        assert_eq!(state.status, ResourceStatus::Resolved);
        assert_eq!(state.value.as_deref(), Some("two"));
        assert!(!entry.is_in_flight());
    }

    #[test]
    fn test_error_commit_retains_value() {
        let cache = cache();
        let entry = cache.entry("a");
        let g = cache.begin(&entry, 1, false).unwrap();
        cache.commit(&entry, g, Ok(Some("kept".into())));
        let g = cache.begin(&entry, 1, false).unwrap();
        let state = cache
            .commit(&entry, g, Err(LoadError::new(anyhow::anyhow!("offline"))))
            .unwrap();

        assert_eq!(state.status, ResourceStatus::Error);
        assert_eq!(state.value.as_deref(), Some("kept"));
        assert_eq!(state.error.unwrap().to_string(), "offline");
    }

    #[test]
    fn test_cancelled_commit_clears_value() {
        let cache = cache();
        let entry = cache.entry("a");
        let g = cache.begin(&entry, 1, false).unwrap();
        cache.commit(&entry, g, Ok(Some("v".into())));
        let g = cache.begin(&entry, 1, false).unwrap();
        let state = cache.commit(&entry, g, Ok(None)).unwrap();

        assert_eq!(state.status, ResourceStatus::Cancelled);
        assert!(state.value.is_none());
    }

    #[test]
    fn test_begin_if_needed() {
        let cache = cache();
        let entry = cache.entry("a");
        let g = cache.begin(&entry, 1, true).unwrap();
        assert_eq!(cache.begin(&entry, 1, true), Err(CacheAccess::Joined));
        cache.commit(&entry, g, Ok(Some("v".into())));
        assert_eq!(cache.begin(&entry, 1, true), Err(CacheAccess::Hit));

        cache.invalidate("a");
        let g = cache.begin(&entry, 1, true).unwrap();
        assert_eq!(cache.begin(&entry, 1, true), Err(CacheAccess::Joined));

        // Invalidating while in flight supersedes instead of joining.
        cache.invalidate("a");
        assert_eq!(cache.begin(&entry, 1, true), Ok(g + 1));
    }

    #[test]
    fn test_commit_after_evict_is_discarded() {
        let cache = cache();
        let entry = cache.entry("a");
        let g = cache.begin(&entry, 1, false).unwrap();
        assert!(cache.evict("a"));

        assert!(cache.commit(&entry, g, Ok(Some("late".into()))).is_none());
        // A fresh entry under the same key is unaffected.
        assert_eq!(cache.get_or_create("a").status, ResourceStatus::Idle);
    }

    #[test]
    fn test_set_and_patch_value() {
        let cache = cache();
        assert!(!cache.set_value("missing", "x".into()));
        cache.get_or_create("a");
        assert!(!cache.patch_value("a", |v| v.push('!')));
        assert!(cache.set_value("a", "hi".into()));
        assert!(cache.patch_value("a", |v| v.push('!')));
        let state = cache.get("a").unwrap();
        assert_eq!(state.value.as_deref(), Some("hi!"));
        assert_eq!(state.status, ResourceStatus::Idle);
    }

    #[test]
    fn test_restore_hook_seeds_local() {
        struct Seed;
        impl EntryHook<u32, String> for Seed {
            fn restore(&self, key: &str) -> Option<(String, Option<u32>)> {
                (key == "saved").then(|| ("from disk".to_string(), Some(3)))
            }
        }

        let cache = cache();
        cache.add_hook(Seed);
        let state = cache.get_or_create("saved");
        assert_eq!(state.status, ResourceStatus::Local);
        assert_eq!(state.value.as_deref(), Some("from disk"));
        assert_eq!(state.params, Some(3));
        assert_eq!(cache.get_or_create("other").status, ResourceStatus::Idle);

        // A load on a restored entry keeps reporting local until it commits.
        let entry = cache.entry("saved");
        let g = cache.begin(&entry, 3, false).unwrap();
        assert_eq!(entry.state.get().status, ResourceStatus::Local);
        cache.commit(&entry, g, Ok(Some("fresh".into())));
        assert_eq!(entry.state.get().status, ResourceStatus::Resolved);
    }

    #[test]
    fn test_events_emitted() {
        let cache = cache();
        let kinds = Arc::new(Mutex::new(Vec::new()));
        let log = kinds.clone();
        let _guard = cache.subscribe(move |event| log.lock().push(event.kind));

        let entry = cache.entry("a");
        let g = cache.begin(&entry, 1, false).unwrap();
        cache.commit(&entry, g, Ok(Some("v".into())));
        cache.set_value("a", "w".into());
        cache.invalidate("a");
        cache.evict("a");

        assert_eq!(
            *kinds.lock(),
            vec![
                CacheEventKind::Dispatched,
                CacheEventKind::Committed,
                CacheEventKind::Patched,
                CacheEventKind::Invalidated,
                CacheEventKind::Evicted,
            ]
        );
    }

    #[test]
    fn test_reference_does_not_keep_entry() {
        let cache = cache();
        cache.get_or_create("a");
        let handle = cache.reference("a").unwrap();
        assert_eq!(handle.status(), ResourceStatus::Idle);
        assert!(cache.reference("b").is_none());

        let commits = Arc::new(AtomicUsize::new(0));
        let c = commits.clone();
        let _guard = cache.subscribe(move |_| {
            c.fetch_add(1, Ordering::Relaxed);
        });
        cache.set_value("a", "v".into());
        assert_eq!(handle.value().as_deref(), Some("v"));
        assert!(handle.has_value());
        assert_eq!(commits.load(Ordering::Relaxed), 1);
    }
}
