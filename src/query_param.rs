//! Reactive parameters mirrored to an external key-value representation,
//! such as the query string of a URL.
//!
//! Each field of the state type is declared with a name, a fallback, a parser
//! and a serializer. The state is read from the store on construction and on
//! [`QueryParam::reload_from_store`]; every [`set`](QueryParam::set) or
//! [`patch`](QueryParam::patch) writes all fields back.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::cache::Data;
use crate::{Cell, NodeId, Reactive, Runtime, Signal};

/// External representation of the parameters.
pub trait ParamStore: Send + Sync + 'static {
    /// Raw value of the field `name`.
    fn read(&self, name: &str) -> Option<String>;

    /// Store raw values, leaving other names untouched.
    fn write(&self, values: &[(String, String)]);
}

/// In-memory [`ParamStore`]. Clones share the same values.
#[derive(Debug, Clone, Default)]
pub struct MemoryParamStore {
    values: Arc<RwLock<BTreeMap<String, String>>>,
}

impl MemoryParamStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding `pairs`.
    pub fn from_pairs<K: Into<String>, V: Into<String>>(pairs: impl IntoIterator<Item = (K, V)>) -> Self {
        let values = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            values: Arc::new(RwLock::new(values)),
        }
    }

    /// Set one raw value, as an external navigation would.
    pub fn insert(&self, name: impl Into<String>, value: impl Into<String>) {
        self.values.write().insert(name.into(), value.into());
    }

    /// All raw values.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.values.read().clone()
    }
}

impl ParamStore for MemoryParamStore {
    fn read(&self, name: &str) -> Option<String> {
        self.values.read().get(name).cloned()
    }

    fn write(&self, values: &[(String, String)]) {
        let mut current = self.values.write();
        for (name, value) in values {
            current.insert(name.clone(), value.clone());
        }
    }
}

/// One field of a [`QueryParam`] state.
pub struct ParamField<S> {
    name: String,
    load: Box<dyn Fn(&mut S, Option<&str>) + Send + Sync>,
    save: Box<dyn Fn(&S) -> String + Send + Sync>,
}

impl<S: 'static> ParamField<S> {
    /// A field read with `parse` and written with `serialize`.
    ///
    /// `get` and `set` select the field within the state. A raw value that is
    /// missing or fails to parse yields `fallback`.
    pub fn new<F>(
        name: impl Into<String>,
        fallback: F,
        get: impl Fn(&S) -> F + Send + Sync + 'static,
        set: impl Fn(&mut S, F) + Send + Sync + 'static,
        parse: impl Fn(&str) -> Option<F> + Send + Sync + 'static,
        serialize: impl Fn(&F) -> String + Send + Sync + 'static,
    ) -> Self
    where
        F: Clone + Send + Sync + 'static,
    {
        let name = name.into();
        let field = name.clone();
        Self {
            name,
            load: Box::new(move |state: &mut S, raw: Option<&str>| {
                let parsed = raw.and_then(|raw| {
                    let parsed = parse(raw);
                    if parsed.is_none() {
                        tracing::debug!(field = %field, raw, "unparsable parameter; using fallback");
                    }
                    parsed
                });
                set(state, parsed.unwrap_or_else(|| fallback.clone()));
            }),
            save: Box::new(move |state: &S| serialize(&get(state))),
        }
    }

    /// A field parsed with [`FromStr`] and written with [`ToString`].
    pub fn parsed<F>(
        name: impl Into<String>,
        fallback: F,
        get: impl Fn(&S) -> F + Send + Sync + 'static,
        set: impl Fn(&mut S, F) + Send + Sync + 'static,
    ) -> Self
    where
        F: FromStr + ToString + Clone + Send + Sync + 'static,
    {
        Self::new(
            name,
            fallback,
            get,
            set,
            |raw: &str| raw.parse().ok(),
            |value: &F| value.to_string(),
        )
    }

    /// Name of the field in the store.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Reactive parameters bound to a [`ParamStore`].
///
/// Implements [`Reactive`], so it can drive a query's parameters directly.
pub struct QueryParam<S> {
    inner: Arc<QueryParamInner<S>>,
}

struct QueryParamInner<S> {
    name: String,
    cell: Cell<S>,
    fields: Vec<ParamField<S>>,
    store: Arc<dyn ParamStore>,
}

impl<S> Clone for QueryParam<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Builder for [`QueryParam`].
pub struct QueryParamBuilder<S> {
    runtime: Runtime,
    name: String,
    store: Arc<dyn ParamStore>,
    fields: Vec<ParamField<S>>,
}

impl<S: Data + Default> QueryParam<S> {
    /// Start building parameters named `name` bound to `store`.
    pub fn builder(
        runtime: &Runtime,
        name: impl Into<String>,
        store: impl ParamStore,
    ) -> QueryParamBuilder<S> {
        QueryParamBuilder {
            runtime: runtime.clone(),
            name: name.into(),
            store: Arc::new(store),
            fields: Vec::new(),
        }
    }
}

impl<S: Data + Default> QueryParamBuilder<S> {
    /// Declare a field.
    pub fn field(mut self, field: ParamField<S>) -> Self {
        self.fields.push(field);
        self
    }

    /// Read the initial state from the store.
    pub fn build(self) -> QueryParam<S> {
        let initial = read_fields(&self.fields, &*self.store);
        let cell = self.runtime.named_cell(self.name.clone(), initial);
        QueryParam {
            inner: Arc::new(QueryParamInner {
                name: self.name,
                cell,
                fields: self.fields,
                store: self.store,
            }),
        }
    }
}

fn read_fields<S: Default>(fields: &[ParamField<S>], store: &dyn ParamStore) -> S {
    let mut state = S::default();
    for field in fields {
        let raw = store.read(&field.name);
        (field.load)(&mut state, raw.as_deref());
    }
    state
}

impl<S: Data + Default> QueryParam<S> {
    /// Current state.
    pub fn state(&self) -> S {
        self.inner.cell.get()
    }

    /// Reactive view of the state.
    pub fn signal(&self) -> Signal<S> {
        self.inner.cell.signal()
    }

    /// Replace the whole state and write it to the store.
    pub fn set(&self, state: S) {
        self.inner.cell.set(state);
        self.write_back();
    }

    /// Merge a partial update into the state and write it to the store.
    pub fn patch(&self, f: impl FnOnce(&mut S)) {
        self.inner.cell.update(f);
        self.write_back();
    }

    /// Re-read the state after the store changed externally.
    pub fn reload_from_store(&self) {
        let state = read_fields(&self.inner.fields, &*self.inner.store);
        self.inner.cell.set(state);
    }

    /// Graph node of the state.
    pub fn node_id(&self) -> NodeId {
        self.inner.cell.node_id()
    }

    fn write_back(&self) {
        let values: Vec<(String, String)> = self.inner.cell.with(|state| {
            self.inner
                .fields
                .iter()
                .map(|field| (field.name.clone(), (field.save)(state)))
                .collect()
        });
        tracing::trace!(params = %self.inner.name, fields = values.len(), "write back");
        self.inner.store.write(&values);
    }
}

impl<S: Data + Default> Reactive for QueryParam<S> {
    type Value = S;

    fn node_id(&self) -> NodeId {
        QueryParam::node_id(self)
    }

    fn get(&self) -> S {
        self.state()
    }
}
