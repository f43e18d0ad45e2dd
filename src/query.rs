//! Queries: reactive reads keyed by their parameters.
//!
//! A query watches a parameter source. Whenever the parameters change it
//! derives a key, looks the key up in its [`ResourceCache`], loads it if the
//! entry is missing or stale, and exposes the entry as a [`QueryState`].
//!
//! # Example
//!
//! ```ignore
//! use resource_flow::{Query, Runtime};
//!
//! let runtime = Runtime::new();
//! let page = runtime.cell(1u32);
//! let users = Query::builder(&runtime, "users", |page: u32| async move {
//!         api::list_users(page).await
//!     })
//!     .params(&page)
//!     .preserve_previous_value(true)
//!     .build()?;
//!
//! page.set(2); // keeps showing page 1 while page 2 loads
//! ```

use std::any::Any;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::cache::{Data, Entry};
use crate::key::{structural, IdentifierFn};
use crate::{
    CacheAccess, CacheError, Dispatch, LoadError, Loader, Reactive, ResourceCache, ResourceStatus,
    Runtime, Signal, Subscription,
};

type ParamsFn<P> = Arc<dyn Fn() -> Option<P> + Send + Sync>;

/// What a query shows for its current key.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState<P, V> {
    /// Key derived from the current parameters, `None` while they are absent.
    pub key: Option<String>,
    /// Status of the current key's entry.
    pub status: ResourceStatus,
    /// Value of the current key's entry, or a provisional value while it
    /// loads (see [`is_placeholder`](Self::is_placeholder)).
    pub value: Option<V>,
    /// Error of the current key's latest failed attempt.
    pub error: Option<LoadError>,
    /// Parameters of the current key's latest dispatch.
    pub params: Option<P>,
    /// Whether `value` is carried over from a previous key.
    pub is_placeholder: bool,
}

impl<P, V> Default for QueryState<P, V> {
    fn default() -> Self {
        Self {
            key: None,
            status: ResourceStatus::Idle,
            value: None,
            error: None,
            params: None,
            is_placeholder: false,
        }
    }
}

impl<P, V> QueryState<P, V> {
    /// Check if a value, real or provisional, is shown.
    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }

    /// The shown value.
    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    /// Same as [`value`](Self::value).
    pub fn safe_value(&self) -> Option<&V> {
        self.value()
    }

    /// Check if a load is in flight.
    pub fn is_loading(&self) -> bool {
        self.status.is_loading()
    }

    /// Check if the current key is resolved.
    pub fn is_resolved(&self) -> bool {
        self.status == ResourceStatus::Resolved
    }
}

/// Chooses a provisional value to show while a new key loads.
pub trait PlaceholderData<P, V>: Send + Sync + 'static {
    /// `previous` is the value shown for the previous key, if any.
    fn placeholder(&self, previous: Option<&V>, previous_params: Option<&P>, next: &P)
        -> Option<V>;
}

impl<P, V, F> PlaceholderData<P, V> for F
where
    F: Fn(Option<&V>, Option<&P>, &P) -> Option<V> + Send + Sync + 'static,
{
    fn placeholder(
        &self,
        previous: Option<&V>,
        previous_params: Option<&P>,
        next: &P,
    ) -> Option<V> {
        self(previous, previous_params, next)
    }
}

/// Keeps showing the previous page's items while the next page loads.
///
/// Install it with [`QueryBuilder::extend`] or [`QueryBuilder::placeholder`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PaginationPlaceholder;

impl<P, V: Clone> PlaceholderData<P, V> for PaginationPlaceholder {
    fn placeholder(&self, previous: Option<&V>, _: Option<&P>, _: &P) -> Option<V> {
        previous.cloned()
    }
}

impl<P: Data, V: Data> QueryExtension<P, V> for PaginationPlaceholder {
    fn install(self: Box<Self>, query: &Query<P, V>) -> Result<(), CacheError> {
        query.set_placeholder(*self);
        Ok(())
    }
}

enum DisplayMode<P, V> {
    Empty,
    PreservePrevious,
    Placeholder(Arc<dyn PlaceholderData<P, V>>),
}

/// Behaviour composed onto a query at construction, in order.
///
/// Persisters, placeholder strategies and mutation reactions are all
/// extensions.
pub trait QueryExtension<P, V>: Send + 'static {
    /// Wire the extension into `query`.
    fn install(self: Box<Self>, query: &Query<P, V>) -> Result<(), CacheError>;
}

/// A reactive read of a keyed async resource.
///
/// Cloning is cheap; clones share the same view.
pub struct Query<P, V> {
    inner: Arc<QueryInner<P, V>>,
}

impl<P, V> Clone for Query<P, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Non-owning handle to a [`Query`], held by extensions that listen to
/// other resources.
pub struct WeakQuery<P, V> {
    inner: Weak<QueryInner<P, V>>,
}

impl<P, V> Clone for WeakQuery<P, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P, V> WeakQuery<P, V> {
    /// The query, if it is still alive.
    pub fn upgrade(&self) -> Option<Query<P, V>> {
        self.inner.upgrade().map(|inner| Query { inner })
    }
}

struct QueryInner<P, V> {
    name: String,
    runtime: Runtime,
    cache: ResourceCache<P, V>,
    loader: Arc<dyn Loader<P, V>>,
    read_params: ParamsFn<P>,
    params_node: Option<crate::NodeId>,
    identifier: IdentifierFn<P>,
    display: RwLock<DisplayMode<P, V>>,
    current: Mutex<Current<P, V>>,
    view: crate::Cell<QueryState<P, V>>,
    retained: Mutex<Vec<Box<dyn Any + Send + Sync>>>,
}

struct Current<P, V> {
    key: Option<String>,
    entry: Option<Arc<Entry<P, V>>>,
    fallback: Option<V>,
    _watch: Option<Subscription>,
}

impl<P, V> Default for Current<P, V> {
    fn default() -> Self {
        Self {
            key: None,
            entry: None,
            fallback: None,
            _watch: None,
        }
    }
}

/// Builder for [`Query`].
pub struct QueryBuilder<P, V> {
    runtime: Runtime,
    name: String,
    loader: Arc<dyn Loader<P, V>>,
    params: (ParamsFn<P>, Option<crate::NodeId>),
    identifier: IdentifierFn<P>,
    display: DisplayMode<P, V>,
    cache: Option<ResourceCache<P, V>>,
    extensions: Vec<Box<dyn QueryExtension<P, V>>>,
}

impl<P: Data + Serialize, V: Data> Query<P, V> {
    /// Start building a query named `name` that loads with `loader`.
    ///
    /// Until a parameter source is given the parameters are absent and the
    /// query stays idle. Keys default to [`structural_key`](crate::structural_key).
    pub fn builder(
        runtime: &Runtime,
        name: impl Into<String>,
        loader: impl Loader<P, V>,
    ) -> QueryBuilder<P, V> {
        QueryBuilder {
            runtime: runtime.clone(),
            name: name.into(),
            loader: Arc::new(loader),
            params: (Arc::new(|| None), None),
            identifier: structural(),
            display: DisplayMode::Empty,
            cache: None,
            extensions: Vec::new(),
        }
    }
}

impl<P: Data, V: Data> QueryBuilder<P, V> {
    /// Follow a reactive parameter source.
    pub fn params<R>(mut self, source: &R) -> Self
    where
        R: Reactive<Value = P> + Clone,
    {
        let node = source.node_id();
        let source = source.clone();
        self.params = (Arc::new(move || Some(source.get())), Some(node));
        self
    }

    /// Follow a reactive parameter source that may be absent. While it is
    /// `None` the query is idle and loads nothing.
    pub fn optional_params<R>(mut self, source: &R) -> Self
    where
        R: Reactive<Value = Option<P>> + Clone,
    {
        let node = source.node_id();
        let source = source.clone();
        self.params = (Arc::new(move || source.get()), Some(node));
        self
    }

    /// Load once with fixed parameters.
    pub fn fixed_params(mut self, params: P) -> Self {
        self.params = (Arc::new(move || Some(params.clone())), None);
        self
    }

    /// Derive cache keys with `identifier` instead of structural serialization.
    pub fn identifier(mut self, identifier: impl Fn(&P) -> String + Send + Sync + 'static) -> Self {
        self.identifier = Arc::new(identifier);
        self
    }

    /// While a new key loads, keep showing the previous key's value.
    pub fn preserve_previous_value(mut self, preserve: bool) -> Self {
        self.display = if preserve {
            DisplayMode::PreservePrevious
        } else {
            DisplayMode::Empty
        };
        self
    }

    /// While a new key loads, show the value chosen by `placeholder`.
    pub fn placeholder(mut self, placeholder: impl PlaceholderData<P, V>) -> Self {
        self.display = DisplayMode::Placeholder(Arc::new(placeholder));
        self
    }

    /// Use a shared cache instead of a private one.
    pub fn cache(mut self, cache: ResourceCache<P, V>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Append an extension. Extensions install in the order they are added.
    pub fn extend(mut self, extension: impl QueryExtension<P, V>) -> Self {
        self.extensions.push(Box::new(extension));
        self
    }

    /// Build the query, install its extensions and evaluate the parameters
    /// for the first time.
    pub fn build(self) -> Result<Query<P, V>, CacheError> {
        let cache = self
            .cache
            .unwrap_or_else(|| ResourceCache::new(&self.runtime, self.name.clone()));
        let view = self
            .runtime
            .named_cell(format!("{}.view", self.name), QueryState::default());
        let query = Query {
            inner: Arc::new(QueryInner {
                name: self.name,
                runtime: self.runtime,
                cache,
                loader: self.loader,
                read_params: self.params.0,
                params_node: self.params.1,
                identifier: self.identifier,
                display: RwLock::new(self.display),
                current: Mutex::new(Current::default()),
                view,
                retained: Mutex::new(Vec::new()),
            }),
        };

        for extension in self.extensions {
            extension.install(&query)?;
        }

        if let Some(node) = query.inner.params_node {
            let weak = Arc::downgrade(&query.inner);
            let subscription = query.inner.runtime.effect(&[node], move || {
                if let Some(inner) = weak.upgrade() {
                    Query { inner }.refresh();
                }
            });
            query.retain(subscription);
        }
        query.refresh();
        Ok(query)
    }
}

impl<P: Data, V: Data> Query<P, V> {
    /// Name used in logs and as the private cache's name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The runtime this query schedules on.
    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    /// The cache holding this query's entries.
    pub fn cache(&self) -> &ResourceCache<P, V> {
        &self.inner.cache
    }

    /// A handle that does not keep the query alive.
    pub fn downgrade(&self) -> WeakQuery<P, V> {
        WeakQuery {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Keep `value` alive as long as the query. Used by extensions to hold
    /// their listener guards.
    pub fn retain(&self, value: impl Any + Send + Sync) {
        self.inner.retained.lock().push(Box::new(value));
    }

    /// Replace the provisional-value strategy.
    pub fn set_placeholder(&self, placeholder: impl PlaceholderData<P, V>) {
        *self.inner.display.write() = DisplayMode::Placeholder(Arc::new(placeholder));
    }

    /// Current state, computed from the current key's entry.
    pub fn state(&self) -> QueryState<P, V> {
        let (entry, fallback) = {
            let current = self.inner.current.lock();
            (current.entry.clone(), current.fallback.clone())
        };
        let Some(entry) = entry else {
            return QueryState::default();
        };
        let s = entry.state.get();
        let (value, is_placeholder) = match s.value {
            Some(value) => (Some(value), false),
            None if s.status.is_loading() => {
                let shown = fallback.is_some();
                (fallback, shown)
            }
            None => (None, false),
        };
        QueryState {
            key: Some(s.key),
            status: s.status,
            value,
            error: s.error,
            params: s.params,
            is_placeholder,
        }
    }

    /// Reactive view of [`state`](Self::state).
    pub fn signal(&self) -> Signal<QueryState<P, V>> {
        self.inner.view.signal()
    }

    /// Status of the current key.
    pub fn status(&self) -> ResourceStatus {
        self.state().status
    }

    /// Shown value.
    pub fn value(&self) -> Option<V> {
        self.state().value
    }

    /// Same as [`value`](Self::value).
    pub fn safe_value(&self) -> Option<V> {
        self.value()
    }

    /// Check if a value is shown.
    pub fn has_value(&self) -> bool {
        self.state().has_value()
    }

    /// Check if a load is in flight for the current key.
    pub fn is_loading(&self) -> bool {
        self.status().is_loading()
    }

    /// Check if the shown value is carried over from a previous key.
    pub fn is_placeholder(&self) -> bool {
        self.state().is_placeholder
    }

    /// Error of the current key's latest failed attempt.
    pub fn error(&self) -> Option<LoadError> {
        self.state().error
    }

    /// Key derived from the current parameters.
    pub fn key(&self) -> Option<String> {
        self.inner.current.lock().key.clone()
    }

    /// Current parameters, if present.
    pub fn params(&self) -> Option<P> {
        (self.inner.read_params)()
    }

    /// Load the current key again.
    ///
    /// Joins the attempt in flight if it was started with the current
    /// parameters and the key was not invalidated since.
    ///
    /// Returns `None` while the parameters are absent.
    pub fn reload(&self) -> Option<Dispatch<V>> {
        let params = (self.inner.read_params)()?;
        let key = (self.inner.identifier)(&params);
        tracing::debug!(query = %self.inner.name, key = %key, "reload");
        let dispatch = self
            .inner
            .cache
            .dispatch(&key, params, self.inner.loader.clone());
        self.render();
        Some(dispatch)
    }

    /// Mark the current key stale and load it again, superseding any load in
    /// flight for it.
    pub fn invalidate(&self) {
        if let Some(key) = self.key() {
            self.inner.cache.invalidate(&key);
        }
        self.refresh();
    }

    /// Overwrite the value of the current key's entry in place, keeping its
    /// status. Returns `false` while there is no current entry.
    pub fn set_value(&self, value: V) -> bool {
        let Some(key) = self.key() else {
            return false;
        };
        let written = self.inner.cache.set_value(&key, value);
        self.render();
        written
    }

    /// Wait until no load is in flight for the current key.
    pub async fn until_settled(&self) -> QueryState<P, V> {
        let entry = self.inner.current.lock().entry.clone();
        if let Some(entry) = entry {
            entry.until_settled().await;
        }
        self.state()
    }

    /// Re-read the parameters, switch to their key and load it if needed.
    fn refresh(&self) {
        let Some(params) = (self.inner.read_params)() else {
            let previous = std::mem::take(&mut *self.inner.current.lock());
            drop(previous);
            self.render();
            return;
        };
        let key = (self.inner.identifier)(&params);

        let same_key = self.inner.current.lock().key.as_deref() == Some(key.as_str());
        if !same_key {
            let shown = self.inner.view.get();
            let fallback = match &*self.inner.display.read() {
                DisplayMode::Empty => None,
                DisplayMode::PreservePrevious => shown.value.clone(),
                DisplayMode::Placeholder(strategy) => {
                    strategy.placeholder(shown.value.as_ref(), shown.params.as_ref(), &params)
                }
            };
            let entry = self.inner.cache.entry(&key);
            let weak: Weak<QueryInner<P, V>> = Arc::downgrade(&self.inner);
            let watch = self
                .inner
                .runtime
                .effect(&[entry.state.node_id()], move || {
                    if let Some(inner) = weak.upgrade() {
                        Query { inner }.render();
                    }
                });
            let previous = std::mem::replace(
                &mut *self.inner.current.lock(),
                Current {
                    key: Some(key.clone()),
                    entry: Some(entry),
                    fallback,
                    _watch: Some(watch),
                },
            );
            drop(previous);
        }

        let access = self.inner.cache.ensure(&key, params, &self.inner.loader);
        if access == CacheAccess::Hit {
            tracing::trace!(query = %self.inner.name, key = %key, "cache hit");
        }
        self.render();
    }

    fn render(&self) {
        self.inner.view.set(self.state());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ThreadSpawner;

    #[test]
    fn test_absent_params_stay_idle() {
        let runtime = Runtime::builder().spawner(ThreadSpawner).build();
        let params = runtime.cell(None::<u32>);
        let query = Query::builder(&runtime, "q", |n: u32| async move { anyhow::Ok(n) })
            .optional_params(&params)
            .build()
            .unwrap();

        assert_eq!(query.status(), ResourceStatus::Idle);
        assert!(query.key().is_none());
        assert!(query.cache().is_empty());
    }

    #[test]
    fn test_placeholder_strategies() {
        let previous = vec![1, 2, 3];
        let kept: Option<Vec<i32>> =
            PaginationPlaceholder.placeholder(Some(&previous), Some(&1u32), &2u32);
        assert_eq!(kept, Some(previous));

        let custom = |prev: Option<&Vec<i32>>, _: Option<&u32>, _: &u32| -> Option<Vec<i32>> {
            prev.map(|p| p.iter().map(|x| x * 10).collect())
        };
        assert_eq!(custom.placeholder(Some(&vec![1]), None, &0), Some(vec![10]));
    }

    #[test]
    fn test_default_state() {
        let state: QueryState<u32, String> = QueryState::default();
        assert!(!state.has_value());
        assert!(!state.is_loading());
        assert!(!state.is_resolved());
        assert!(!state.is_placeholder);
    }
}
