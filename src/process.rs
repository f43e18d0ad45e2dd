//! Long-running, per-id actions that may finish without a value.

use std::sync::Arc;

use crate::action::{ActionCore, MutationEvent, MutationSource, ResourceById, SettledEvents};
use crate::cache::Data;
use crate::{
    Dispatch, ListenerGuard, LoadError, Loader, ResourceCache, ResourceRef, ResourceState,
    ResourceStatus, Runtime, Signal,
};

/// A long-running action tracked per id.
///
/// Each id moves through `idle -> loading -> resolved | cancelled | error`.
/// Calling [`method`](Self::method) again for an id supersedes the run in
/// flight for it: the earlier run keeps going but its outcome is discarded.
///
/// A loader that returns `Ok(None)` marks the run cancelled and clears the
/// id's value. Applications use this for "cancel" payloads that short-circuit
/// the loader.
pub struct AsyncProcess<P, V> {
    core: Arc<ActionCore<P, V>>,
}

impl<P, V> Clone for AsyncProcess<P, V> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

/// Builder for [`AsyncProcess`].
pub struct AsyncProcessBuilder<P, V> {
    runtime: Runtime,
    name: String,
    loader: Arc<dyn Loader<P, Option<V>>>,
    identifier: Option<crate::IdentifierFn<P>>,
    cache: Option<ResourceCache<P, V>>,
}

impl<P: Data, V: Data> AsyncProcess<P, V> {
    /// Start building a process named `name` that runs `loader`.
    pub fn builder(
        runtime: &Runtime,
        name: impl Into<String>,
        loader: impl Loader<P, Option<V>>,
    ) -> AsyncProcessBuilder<P, V> {
        AsyncProcessBuilder {
            runtime: runtime.clone(),
            name: name.into(),
            loader: Arc::new(loader),
            identifier: None,
            cache: None,
        }
    }
}

impl<P: Data, V: Data> AsyncProcessBuilder<P, V> {
    /// Track runs per id. Without an identifier every run shares one entry.
    pub fn identifier(mut self, identifier: impl Fn(&P) -> String + Send + Sync + 'static) -> Self {
        self.identifier = Some(Arc::new(identifier));
        self
    }

    /// Use a shared cache for the per-id entries.
    pub fn cache(mut self, cache: ResourceCache<P, V>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Build the process.
    pub fn build(self) -> AsyncProcess<P, V> {
        AsyncProcess {
            core: ActionCore::new(
                &self.runtime,
                self.name,
                self.cache,
                self.identifier,
                self.loader,
                SettledEvents::Committed,
            ),
        }
    }
}

impl<P: Data, V: Data> AsyncProcess<P, V> {
    /// Name used in logs.
    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// The cache holding the per-id entries.
    pub fn cache(&self) -> &ResourceCache<P, V> {
        self.core.cache()
    }

    /// Start or supersede the run for `payload`'s id.
    ///
    /// Resolves to this run's own outcome; `Ok(None)` means it was cancelled.
    pub fn method(&self, payload: P) -> Dispatch<Option<V>> {
        self.core.run(payload)
    }

    /// State of the most recent run.
    pub fn state(&self) -> ResourceState<P, V> {
        self.core.latest()
    }

    /// Reactive view of [`state`](Self::state).
    pub fn signal(&self) -> Signal<ResourceState<P, V>> {
        self.core.signal()
    }

    /// Status of the most recent run.
    pub fn status(&self) -> ResourceStatus {
        self.state().status
    }

    /// Value of the most recent run.
    pub fn value(&self) -> Option<V> {
        self.state().value
    }

    /// Same as [`value`](Self::value).
    pub fn safe_value(&self) -> Option<V> {
        self.value()
    }

    /// Check if the most recent run produced a value.
    pub fn has_value(&self) -> bool {
        self.state().has_value()
    }

    /// Check if the most recent run is in flight.
    pub fn is_loading(&self) -> bool {
        self.status().is_loading()
    }

    /// Error of the most recent run.
    pub fn error(&self) -> Option<LoadError> {
        self.state().error
    }

    /// The most recent run for `id`, if any.
    pub fn select(&self, id: &str) -> Option<ResourceRef<P, V>> {
        self.core.cache().reference(id)
    }

    /// Read-only view of every id's most recent run.
    pub fn resource_by_id(&self) -> ResourceById<P, V> {
        ResourceById::new(self.core.cache().clone())
    }

    /// Wait until the run for `id` is no longer in flight.
    pub async fn until_settled(&self, id: &str) -> Option<ResourceState<P, V>> {
        self.core.cache().until_settled(id).await
    }
}

impl<P: Data, V: Data> MutationSource<P, V> for AsyncProcess<P, V> {
    fn subscribe_events(
        &self,
        listener: impl Fn(&MutationEvent<P, V>) + Send + Sync + 'static,
    ) -> ListenerGuard {
        self.core.subscribe_events(listener)
    }
}

impl<P, V> std::fmt::Debug for AsyncProcess<P, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncProcess").finish_non_exhaustive()
    }
}
