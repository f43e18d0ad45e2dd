//! Shared machinery for write actions.
//!
//! [`Mutation`](crate::Mutation) and [`AsyncProcess`](crate::AsyncProcess)
//! both run a loader per call, keep one cache entry per identifier and
//! publish a [`MutationEvent`] for every lifecycle step. The entry for an id
//! follows the same generation rule as query entries: calling again with the
//! same id supersedes the attempt in flight for it.
//!
//! Mutation calls are independent of each other, so each one publishes its
//! own settled stage even when a later call took over its entry. A process
//! run that was superseded publishes nothing once it settles.

use std::any::Any;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::cache::{Data, Entry, SettleFn};
use crate::key::IdentifierFn;
use crate::{
    CacheEvent, Cell, Dispatch, EventEmitter, ListenerGuard, LoadError, Loader, ResourceCache,
    ResourceRef, ResourceState, Runtime, Signal, Subscription,
};

/// Entry key used by actions built without an identifier.
pub const DEFAULT_ACTION_KEY: &str = "default";

/// Lifecycle step of one action call.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationStage<V> {
    /// The call was made and its loader is running.
    Started,
    /// The loader produced a value.
    Resolved(V),
    /// The loader produced no value.
    Cancelled,
    /// The loader failed.
    Errored(LoadError),
}

impl<V> MutationStage<V> {
    /// Short lowercase name of the stage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Resolved(_) => "resolved",
            Self::Cancelled => "cancelled",
            Self::Errored(_) => "errored",
        }
    }
}

/// Published for every lifecycle step of an action call.
///
/// `Started` is published synchronously when the call is made. Every
/// mutation call publishes its settled stage; an async process run publishes
/// it only if it was not superseded.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationEvent<P, V> {
    /// Entry key of the call.
    pub key: String,
    /// Identifier of the call, if the action has an identifier function.
    pub identifier: Option<String>,
    /// Parameters the call was made with.
    pub params: P,
    /// Generation of the call within its entry.
    pub generation: u64,
    /// What happened.
    pub stage: MutationStage<V>,
}

impl<P, V> MutationEvent<P, V> {
    /// Value produced by the call, once resolved.
    pub fn value(&self) -> Option<&V> {
        match &self.stage {
            MutationStage::Resolved(value) => Some(value),
            _ => None,
        }
    }

    /// Error of the call, once failed.
    pub fn error(&self) -> Option<&LoadError> {
        match &self.stage {
            MutationStage::Errored(error) => Some(error),
            _ => None,
        }
    }
}

/// Anything publishing [`MutationEvent`]s, such as a
/// [`Mutation`](crate::Mutation) or an [`AsyncProcess`](crate::AsyncProcess).
pub trait MutationSource<P, V>: Send + Sync + 'static {
    /// Listen to lifecycle events. The listener is removed when the guard is
    /// dropped.
    fn subscribe_events(
        &self,
        listener: impl Fn(&MutationEvent<P, V>) + Send + Sync + 'static,
    ) -> ListenerGuard;
}

/// Read-only, id-addressed view of an action's entries.
pub struct ResourceById<P, V> {
    cache: ResourceCache<P, V>,
}

impl<P, V> Clone for ResourceById<P, V> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
        }
    }
}

impl<P: Data, V: Data> ResourceById<P, V> {
    pub(crate) fn new(cache: ResourceCache<P, V>) -> Self {
        Self { cache }
    }

    /// Snapshot of the entry for `id`.
    pub fn get(&self, id: &str) -> Option<ResourceState<P, V>> {
        self.cache.get(id)
    }

    /// Lookup-only handle to the entry for `id`.
    pub fn select(&self, id: &str) -> Option<ResourceRef<P, V>> {
        self.cache.reference(id)
    }

    /// Ids with an entry, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids = self.cache.keys();
        ids.sort();
        ids
    }

    /// Number of ids with an entry.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Check if no call was made yet.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Listen to every change of any id's entry.
    pub fn subscribe(
        &self,
        listener: impl Fn(&CacheEvent<P, V>) + Send + Sync + 'static,
    ) -> ListenerGuard {
        self.cache.subscribe(listener)
    }
}

/// Which settled outcomes an action publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SettledEvents {
    /// Every call, superseded or not.
    EveryCall,
    /// Only calls whose outcome was committed.
    Committed,
}

pub(crate) struct ActionCore<P, V> {
    name: String,
    settled_events: SettledEvents,
    runtime: Runtime,
    cache: ResourceCache<P, V>,
    identifier: Option<IdentifierFn<P>>,
    loader: Arc<dyn Loader<P, Option<V>>>,
    view: Cell<ResourceState<P, V>>,
    watch: Mutex<Option<Subscription>>,
    events: Arc<EventEmitter<MutationEvent<P, V>>>,
    retained: Mutex<Vec<Box<dyn Any + Send + Sync>>>,
}

impl<P: Data, V: Data> ActionCore<P, V> {
    pub(crate) fn new(
        runtime: &Runtime,
        name: String,
        cache: Option<ResourceCache<P, V>>,
        identifier: Option<IdentifierFn<P>>,
        loader: Arc<dyn Loader<P, Option<V>>>,
        settled_events: SettledEvents,
    ) -> Arc<Self> {
        let cache = cache.unwrap_or_else(|| ResourceCache::new(runtime, name.clone()));
        let view = runtime.named_cell(
            format!("{name}.latest"),
            ResourceState::idle(DEFAULT_ACTION_KEY),
        );
        Arc::new(Self {
            name,
            settled_events,
            runtime: runtime.clone(),
            cache,
            identifier,
            loader,
            view,
            watch: Mutex::new(None),
            events: Arc::new(EventEmitter::new()),
            retained: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub(crate) fn cache(&self) -> &ResourceCache<P, V> {
        &self.cache
    }

    pub(crate) fn retain(&self, value: impl Any + Send + Sync) {
        self.retained.lock().push(Box::new(value));
    }

    /// State of the most recent call.
    pub(crate) fn latest(&self) -> ResourceState<P, V> {
        self.view.get()
    }

    pub(crate) fn signal(&self) -> Signal<ResourceState<P, V>> {
        self.view.signal()
    }

    pub(crate) fn key_of(&self, params: &P) -> (String, Option<String>) {
        match &self.identifier {
            Some(identify) => {
                let id = identify(params);
                (id.clone(), Some(id))
            }
            None => (DEFAULT_ACTION_KEY.to_string(), None),
        }
    }

    pub(crate) fn subscribe_events(
        &self,
        listener: impl Fn(&MutationEvent<P, V>) + Send + Sync + 'static,
    ) -> ListenerGuard {
        self.events.subscribe(listener)
    }

    /// Start a call with `params`, superseding any call in flight for the
    /// same id.
    pub(crate) fn run(self: &Arc<Self>, params: P) -> Dispatch<Option<V>> {
        let (key, identifier) = self.key_of(&params);
        let (entry, generation) = self.cache.start(&key, params.clone());
        self.follow(&entry);
        tracing::debug!(action = %self.name, key = %key, generation, "call started");
        self.events.emit(&MutationEvent {
            key: key.clone(),
            identifier: identifier.clone(),
            params: params.clone(),
            generation,
            stage: MutationStage::Started,
        });

        let core: Weak<Self> = Arc::downgrade(self);
        let event_params = params.clone();
        let on_settled: SettleFn<P, V> = Box::new(
            move |outcome: &Result<Option<V>, LoadError>, committed: Option<&ResourceState<P, V>>| {
                if let Some(core) = core.upgrade() {
                    let committed = committed.is_some();
                    core.settled(key, identifier, event_params, generation, outcome, committed);
                }
            },
        );
        self.cache
            .launch(entry, generation, params, self.loader.clone(), Some(on_settled))
    }

    fn settled(
        &self,
        key: String,
        identifier: Option<String>,
        params: P,
        generation: u64,
        outcome: &Result<Option<V>, LoadError>,
        committed: bool,
    ) {
        if !committed && self.settled_events == SettledEvents::Committed {
            tracing::trace!(action = %self.name, key = %key, generation, "superseded run settled");
            return;
        }
        let stage = match outcome {
            Ok(Some(value)) => MutationStage::Resolved(value.clone()),
            Ok(None) => MutationStage::Cancelled,
            Err(error) => MutationStage::Errored(error.clone()),
        };
        tracing::debug!(action = %self.name, key = %key, generation, committed, stage = stage.as_str(), "call settled");
        self.events.emit(&MutationEvent {
            key,
            identifier,
            params,
            generation,
            stage,
        });
    }

    /// Mirror `entry` into the latest-call view until the next call.
    fn follow(&self, entry: &Arc<Entry<P, V>>) {
        let source: Weak<Entry<P, V>> = Arc::downgrade(entry);
        let view = self.view.clone();
        let watch = self.runtime.effect(&[entry.state.node_id()], move || {
            if let Some(entry) = source.upgrade() {
                view.set(entry.state.get());
            }
        });
        let previous = self.watch.lock().replace(watch);
        drop(previous);
        self.view.set(entry.state.get());
    }
}
