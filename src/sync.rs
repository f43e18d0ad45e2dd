//! Writable state kept in step with other reactive values.
//!
//! A [`State`] is a cell plus an ordered list of `sync` rules, each pairing a
//! source with `(previous, source_value) -> next`. Whenever any source
//! changes, every rule runs in declaration order, each one seeing the value
//! produced by the rules before it.

use std::sync::Arc;

use crate::{CacheError, Cell, NodeId, Reactive, Runtime, Signal, Subscription};

type SyncFn<T> = Box<dyn Fn(&T) -> T + Send + Sync>;

/// A writable reactive value with declarative sync rules.
///
/// Cloning is cheap; clones share the same cell and rules.
pub struct State<T> {
    cell: Cell<T>,
    _rules: Option<Arc<Subscription>>,
}

impl<T> Clone for State<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            _rules: self._rules.clone(),
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for State<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("State").field(&self.cell).finish()
    }
}

/// Builder for [`State`].
pub struct StateBuilder<T> {
    label: String,
    cell: Cell<T>,
    sources: Vec<NodeId>,
    rules: Vec<SyncFn<T>>,
}

impl<T> State<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Start building a state labelled `label` holding `initial`.
    pub fn builder(runtime: &Runtime, label: impl Into<String>, initial: T) -> StateBuilder<T> {
        let label = label.into();
        let cell = runtime.named_cell(label.clone(), initial);
        StateBuilder::from_cell(label, &cell)
    }

    /// Current value.
    pub fn get(&self) -> T {
        self.cell.get()
    }

    /// Borrow the current value.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.cell.with(f)
    }

    /// Replace the value.
    pub fn set(&self, value: T) {
        self.cell.set(value);
    }

    /// Modify the value in place.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        self.cell.update(f);
    }

    /// Read-only view.
    pub fn signal(&self) -> Signal<T> {
        self.cell.signal()
    }

    /// Graph node of the underlying cell.
    pub fn node_id(&self) -> NodeId {
        self.cell.node_id()
    }
}

impl<T> Reactive for State<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    type Value = T;

    fn node_id(&self) -> NodeId {
        State::node_id(self)
    }

    fn get(&self) -> T {
        State::get(self)
    }
}

impl<T> StateBuilder<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Attach sync rules to an existing cell.
    pub fn from_cell(label: impl Into<String>, cell: &Cell<T>) -> Self {
        Self {
            label: label.into(),
            cell: cell.clone(),
            sources: Vec::new(),
            rules: Vec::new(),
        }
    }

    /// Add a rule run whenever any source changes. `f` receives the current
    /// value and `source`'s value and returns the next value.
    pub fn sync<R>(mut self, source: &R, f: impl Fn(&T, &R::Value) -> T + Send + Sync + 'static) -> Self
    where
        R: Reactive + Clone,
    {
        let node = source.node_id();
        if !self.sources.contains(&node) {
            self.sources.push(node);
        }
        let source = source.clone();
        self.rules.push(Box::new(move |previous: &T| f(previous, &source.get())));
        self
    }

    /// Register the rules.
    ///
    /// Fails with [`CacheError::Cycle`] if the state's cell already feeds
    /// one of the sources.
    pub fn build(self) -> Result<State<T>, CacheError> {
        if self.rules.is_empty() {
            return Ok(State {
                cell: self.cell,
                _rules: None,
            });
        }
        let runtime = self.cell.runtime().clone();
        let target = self.cell.clone();
        let rules = self.rules;
        let subscription = runtime.rule(
            format!("{}.sync", self.label),
            &self.sources,
            &[self.cell.node_id()],
            move || {
                let next = rules
                    .iter()
                    .fold(target.get(), |value, rule| rule(&value));
                target.set(next);
            },
        )?;
        tracing::trace!(state = %self.label, sources = self.sources.len(), "sync rules registered");
        Ok(State {
            cell: self.cell,
            _rules: Some(Arc::new(subscription)),
        })
    }
}
