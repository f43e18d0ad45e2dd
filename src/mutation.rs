//! Mutations: write actions with per-id status.

use std::sync::Arc;

use crate::action::{ActionCore, MutationEvent, MutationSource, ResourceById, SettledEvents};
use crate::cache::Data;
use crate::spawn::AlwaysSome;
use crate::{
    CacheError, CacheEventKind, Dispatch, ListenerGuard, LoadError, Loader, ResourceCache,
    ResourceRef, ResourceState, ResourceStatus, Runtime, Signal,
};

/// A write action.
///
/// Every call to [`mutate`](Self::mutate) is independent; the mutation's own
/// status reflects the most recent call. With an identifier, calls are also
/// tracked per id and [`select`](Self::select) narrows to the most recent call
/// for one id, so concurrent mutations of different entities never observe
/// each other's status.
pub struct Mutation<P, V> {
    core: Arc<ActionCore<P, V>>,
}

impl<P, V> Clone for Mutation<P, V> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

/// Builder for [`Mutation`].
pub struct MutationBuilder<P, V> {
    runtime: Runtime,
    name: String,
    loader: Arc<dyn Loader<P, V>>,
    identifier: Option<crate::IdentifierFn<P>>,
    cache: Option<ResourceCache<P, V>>,
    triggers: Vec<Box<dyn FnOnce(&Mutation<P, V>) + Send>>,
}

impl<P: Data, V: Data> Mutation<P, V> {
    /// Start building a mutation named `name` that runs `loader`.
    pub fn builder(
        runtime: &Runtime,
        name: impl Into<String>,
        loader: impl Loader<P, V>,
    ) -> MutationBuilder<P, V> {
        MutationBuilder {
            runtime: runtime.clone(),
            name: name.into(),
            loader: Arc::new(loader),
            identifier: None,
            cache: None,
            triggers: Vec::new(),
        }
    }
}

impl<P: Data, V: Data> MutationBuilder<P, V> {
    /// Track calls per id.
    pub fn identifier(mut self, identifier: impl Fn(&P) -> String + Send + Sync + 'static) -> Self {
        self.identifier = Some(Arc::new(identifier));
        self
    }

    /// Use a shared cache for the per-id entries.
    pub fn cache(mut self, cache: ResourceCache<P, V>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Call the mutation whenever an entry of `source` resolves.
    ///
    /// `params` maps the resolved entry to the mutation's parameters; the
    /// mutation does not fire when it returns `None`.
    pub fn from_resource_by_id<SP, SV>(
        mut self,
        source: &ResourceById<SP, SV>,
        params: impl Fn(&ResourceState<SP, SV>) -> Option<P> + Send + Sync + 'static,
    ) -> Self
    where
        SP: Data,
        SV: Data,
    {
        let source = source.clone();
        self.triggers.push(Box::new(move |mutation: &Mutation<P, V>| {
            let target = Arc::downgrade(&mutation.core);
            let guard = source.subscribe(move |event| {
                if event.kind != CacheEventKind::Committed
                    || event.state.status != ResourceStatus::Resolved
                {
                    return;
                }
                let Some(params) = params(&event.state) else {
                    return;
                };
                if let Some(core) = target.upgrade() {
                    tracing::debug!(mutation = %core.name(), source = %event.state.key, "triggered by resource");
                    drop(core.run(params));
                }
            });
            mutation.core.retain(guard);
        }));
        self
    }

    /// Build the mutation.
    pub fn build(self) -> Mutation<P, V> {
        let loader: Arc<dyn Loader<P, Option<V>>> = Arc::new(AlwaysSome(self.loader));
        let mutation = Mutation {
            core: ActionCore::new(
                &self.runtime,
                self.name,
                self.cache,
                self.identifier,
                loader,
                SettledEvents::EveryCall,
            ),
        };
        for trigger in self.triggers {
            trigger(&mutation);
        }
        mutation
    }
}

impl<P: Data, V: Data> Mutation<P, V> {
    /// Name used in logs.
    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// The runtime this mutation schedules on.
    pub fn runtime(&self) -> &Runtime {
        self.core.runtime()
    }

    /// The cache holding the per-id entries.
    pub fn cache(&self) -> &ResourceCache<P, V> {
        self.core.cache()
    }

    /// Run the mutation with `params`.
    ///
    /// The returned future resolves to this call's own outcome, even if a
    /// later call for the same id superseded it.
    pub fn mutate(&self, params: P) -> Dispatch<V> {
        self.core
            .run(params)
            .and_then(|value| value.ok_or(CacheError::Cancelled))
    }

    /// State of the most recent call.
    pub fn state(&self) -> ResourceState<P, V> {
        self.core.latest()
    }

    /// Reactive view of [`state`](Self::state).
    pub fn signal(&self) -> Signal<ResourceState<P, V>> {
        self.core.signal()
    }

    /// Status of the most recent call.
    pub fn status(&self) -> ResourceStatus {
        self.state().status
    }

    /// Value of the most recent call.
    pub fn value(&self) -> Option<V> {
        self.state().value
    }

    /// Same as [`value`](Self::value).
    pub fn safe_value(&self) -> Option<V> {
        self.value()
    }

    /// Check if the most recent call produced a value.
    pub fn has_value(&self) -> bool {
        self.state().has_value()
    }

    /// Check if the most recent call is in flight.
    pub fn is_loading(&self) -> bool {
        self.status().is_loading()
    }

    /// Error of the most recent call.
    pub fn error(&self) -> Option<LoadError> {
        self.state().error
    }

    /// The most recent call for `id`, if any.
    pub fn select(&self, id: &str) -> Option<ResourceRef<P, V>> {
        self.core.cache().reference(id)
    }

    /// Read-only view of every id's most recent call.
    pub fn resource_by_id(&self) -> ResourceById<P, V> {
        ResourceById::new(self.core.cache().clone())
    }

    /// Wait until the call for `id` is no longer in flight.
    pub async fn until_settled(&self, id: &str) -> Option<ResourceState<P, V>> {
        self.core.cache().until_settled(id).await
    }
}

impl<P: Data, V: Data> MutationSource<P, V> for Mutation<P, V> {
    fn subscribe_events(
        &self,
        listener: impl Fn(&MutationEvent<P, V>) + Send + Sync + 'static,
    ) -> ListenerGuard {
        self.core.subscribe_events(listener)
    }
}

impl<P, V> std::fmt::Debug for Mutation<P, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutation").finish_non_exhaustive()
    }
}
