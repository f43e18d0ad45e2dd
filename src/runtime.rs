//! Reactive runtime: cells, rules and the flush scheduler.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::graph::{Graph, NodeId};
use crate::{CacheConfig, CacheError, NoopTracer, Spawn, Tracer};

type RuleFn = Arc<dyn Fn() + Send + Sync>;

/// The reactive runtime shared by caches, queries and state.
///
/// Cloning is cheap; all clones drive the same dependency graph.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    graph: Mutex<Graph>,
    rules: Mutex<ahash::HashMap<NodeId, RuleFn>>,
    scheduler: Mutex<Scheduler>,
    last_flush_error: Mutex<Option<CacheError>>,
    config: CacheConfig,
    tracer: Arc<dyn Tracer>,
    spawner: Arc<dyn Spawn>,
}

#[derive(Default)]
struct Scheduler {
    heap: BinaryHeap<Reverse<(u32, NodeId)>>,
    queued: ahash::HashSet<NodeId>,
    flushing: bool,
    batch_depth: usize,
}

impl Scheduler {
    fn needs_flush(&self) -> bool {
        !self.flushing && self.batch_depth == 0 && !self.heap.is_empty()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("nodes", &self.node_count())
            .field("config", &self.inner.config)
            .finish()
    }
}

/// Builder for [`Runtime`].
#[derive(Default)]
pub struct RuntimeBuilder {
    config: CacheConfig,
    tracer: Option<Arc<dyn Tracer>>,
    spawner: Option<Arc<dyn Spawn>>,
}

impl RuntimeBuilder {
    /// Use the given configuration.
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Report events to `tracer`.
    pub fn tracer(mut self, tracer: impl Tracer) -> Self {
        self.tracer = Some(Arc::new(tracer));
        self
    }

    /// Report events to a shared tracer.
    pub fn shared_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    /// Run loaders with `spawner`.
    pub fn spawner(mut self, spawner: impl Spawn) -> Self {
        self.spawner = Some(Arc::new(spawner));
        self
    }

    /// Build the runtime.
    pub fn build(self) -> Runtime {
        Runtime {
            inner: Arc::new(RuntimeInner {
                graph: Mutex::new(Graph::default()),
                rules: Mutex::new(ahash::HashMap::default()),
                scheduler: Mutex::new(Scheduler::default()),
                last_flush_error: Mutex::new(None),
                config: self.config,
                tracer: self.tracer.unwrap_or_else(|| Arc::new(NoopTracer)),
                spawner: self.spawner.unwrap_or_else(default_spawner),
            }),
        }
    }
}

#[cfg(feature = "tokio-spawner")]
fn default_spawner() -> Arc<dyn Spawn> {
    Arc::new(crate::TokioSpawner)
}

#[cfg(not(feature = "tokio-spawner"))]
fn default_spawner() -> Arc<dyn Spawn> {
    Arc::new(crate::ThreadSpawner)
}

impl Runtime {
    /// Create a runtime with default configuration, no tracer and the default
    /// spawner.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Start building a runtime.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    /// The runtime configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// The tracer receiving cache events.
    pub fn tracer(&self) -> &dyn Tracer {
        self.inner.tracer.as_ref()
    }

    /// Run `task` in the background on the configured spawner.
    pub fn spawn(&self, task: impl Future<Output = ()> + Send + 'static) {
        self.inner.spawner.spawn(Box::pin(task));
    }

    /// Number of live nodes in the dependency graph.
    pub fn node_count(&self) -> usize {
        self.inner.graph.lock().len()
    }

    /// Takes the error of the most recent aborted flush, if any.
    pub fn last_flush_error(&self) -> Option<CacheError> {
        self.inner.last_flush_error.lock().take()
    }

    /// Create a cell holding `initial`. Setting an equal value is a no-op.
    pub fn cell<T>(&self, initial: T) -> Cell<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        self.named_cell("cell", initial)
    }

    /// Create a cell with a label used in cycle reports.
    pub fn named_cell<T>(&self, label: impl Into<String>, initial: T) -> Cell<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        Cell::create(self.clone(), label.into(), initial, false)
    }

    /// Create an event source: a cell that notifies dependents on every
    /// emission, even when the emitted value equals the previous one.
    pub fn event_source<T>(&self, initial: T) -> Cell<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        Cell::create(self.clone(), "source".to_string(), initial, true)
    }

    /// Run `f` whenever any of `sources` changes. `f` is not run on
    /// registration. Dropping the returned subscription unregisters it.
    pub fn effect(
        &self,
        sources: &[NodeId],
        f: impl Fn() + Send + Sync + 'static,
    ) -> Subscription {
        let node = self.inner.graph.lock().insert("effect");
        // Effects write nothing, so connecting them can never form a cycle.
        let _ = self.inner.graph.lock().connect(node, sources, &[]);
        self.inner.rules.lock().insert(node, Arc::new(f));
        Subscription {
            runtime: self.clone(),
            node,
        }
    }

    /// Register a rule that reads `reads` and writes `writes`.
    ///
    /// Fails with [`CacheError::Cycle`] if a written cell can already reach
    /// one of the read cells.
    pub(crate) fn rule(
        &self,
        label: impl Into<String>,
        reads: &[NodeId],
        writes: &[NodeId],
        f: impl Fn() + Send + Sync + 'static,
    ) -> Result<Subscription, CacheError> {
        let node = {
            let mut graph = self.inner.graph.lock();
            let node = graph.insert(label);
            if let Err(path) = graph.connect(node, reads, writes) {
                graph.remove(node);
                drop(graph);
                self.inner.tracer.on_cycle_detected(&path);
                tracing::warn!(path = %path.join(" -> "), "rejected cyclic derivation");
                return Err(CacheError::Cycle { path });
            }
            node
        };
        self.inner.rules.lock().insert(node, Arc::new(f));
        Ok(Subscription {
            runtime: self.clone(),
            node,
        })
    }

    /// A read-only cell recomputed from `f` whenever any of `sources` changes.
    pub fn derived<T>(
        &self,
        label: impl Into<String>,
        sources: &[NodeId],
        f: impl Fn() -> T + Send + Sync + 'static,
    ) -> Result<Signal<T>, CacheError>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        let label = label.into();
        let cell = self.named_cell(label.clone(), f());
        let target = cell.clone();
        let subscription = self.rule(label, sources, &[cell.node_id()], move || {
            target.set(f());
        })?;
        Ok(Signal {
            cell,
            _keep: Some(Arc::new(subscription)),
        })
    }

    /// Run `f` with flushing deferred until it returns, so dependents observe
    /// all of its writes in a single pass.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.scheduler.lock().batch_depth += 1;
        let result = {
            let _guard = BatchGuard(self);
            f()
        };
        if self.inner.scheduler.lock().needs_flush() {
            self.flush();
        }
        result
    }

    /// Schedule every dependent of `node` and flush unless a flush or batch
    /// is already running.
    pub(crate) fn notify(&self, node: NodeId) {
        let scheduled: Vec<(u32, NodeId)> = {
            let graph = self.inner.graph.lock();
            graph
                .dependents(node)
                .into_iter()
                .filter_map(|id| graph.rank(id).map(|rank| (rank, id)))
                .collect()
        };
        if scheduled.is_empty() {
            return;
        }
        let should_flush = {
            let mut scheduler = self.inner.scheduler.lock();
            for (rank, id) in scheduled {
                if scheduler.queued.insert(id) {
                    scheduler.heap.push(Reverse((rank, id)));
                }
            }
            scheduler.needs_flush()
        };
        if should_flush {
            self.flush();
        }
    }

    /// Evaluate queued rules in ascending (rank, registration) order.
    fn flush(&self) {
        {
            let mut scheduler = self.inner.scheduler.lock();
            if scheduler.flushing {
                return;
            }
            scheduler.flushing = true;
        }
        let _guard = FlushGuard(self);
        let limit = self.inner.config.flush_limit;
        let mut evaluations = 0usize;
        loop {
            let next = {
                let mut scheduler = self.inner.scheduler.lock();
                match scheduler.heap.pop() {
                    Some(Reverse((_, id))) => {
                        scheduler.queued.remove(&id);
                        id
                    }
                    None => {
                        scheduler.flushing = false;
                        break;
                    }
                }
            };
            evaluations += 1;
            if evaluations > limit {
                {
                    let mut scheduler = self.inner.scheduler.lock();
                    scheduler.heap.clear();
                    scheduler.queued.clear();
                    scheduler.flushing = false;
                }
                self.inner.tracer.on_flush_aborted(limit);
                tracing::error!(limit, "reactive flush exceeded its evaluation limit");
                *self.inner.last_flush_error.lock() = Some(CacheError::FlushLimitExceeded { limit });
                break;
            }
            let rule = self.inner.rules.lock().get(&next).cloned();
            if let Some(rule) = rule {
                rule();
            }
        }
    }

    fn remove_node(&self, node: NodeId) {
        let removed = self.inner.rules.lock().remove(&node);
        self.inner.graph.lock().remove(node);
        // Dropping a rule may drop cells it captured, which re-enters here.
        drop(removed);
    }
}

struct FlushGuard<'a>(&'a Runtime);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.inner.scheduler.lock().flushing = false;
    }
}

struct BatchGuard<'a>(&'a Runtime);

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        self.0.inner.scheduler.lock().batch_depth -= 1;
    }
}

/// Keeps a rule registered. Dropping it removes the rule from the graph.
#[must_use = "dropping a subscription unregisters it"]
pub struct Subscription {
    runtime: Runtime,
    node: NodeId,
}

impl Subscription {
    /// Graph node of the rule.
    pub fn node_id(&self) -> NodeId {
        self.node
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.runtime.remove_node(self.node);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Subscription").field(&self.node).finish()
    }
}

/// Anything with a current value that dependents can be wired to.
pub trait Reactive: Send + Sync + 'static {
    /// The value type.
    type Value;

    /// Graph node notified when the value changes.
    fn node_id(&self) -> NodeId;

    /// Current value.
    fn get(&self) -> Self::Value;
}

/// A mutable reactive value.
pub struct Cell<T> {
    inner: Arc<CellInner<T>>,
}

struct CellInner<T> {
    runtime: Runtime,
    node: NodeId,
    value: RwLock<T>,
    always_notify: bool,
}

impl<T> Drop for CellInner<T> {
    fn drop(&mut self) {
        self.runtime.remove_node(self.node);
    }
}

impl<T> Clone for Cell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Cell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Cell").field(&*self.inner.value.read()).finish()
    }
}

impl<T> Cell<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn create(runtime: Runtime, label: String, initial: T, always_notify: bool) -> Self {
        let node = runtime.inner.graph.lock().insert(label);
        Self {
            inner: Arc::new(CellInner {
                runtime,
                node,
                value: RwLock::new(initial),
                always_notify,
            }),
        }
    }

    /// Current value.
    pub fn get(&self) -> T {
        self.inner.value.read().clone()
    }

    /// Borrow the current value.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.value.read())
    }

    /// Replace the value and notify dependents if it changed.
    pub fn set(&self, value: T) {
        let changed = {
            let mut current = self.inner.value.write();
            if !self.inner.always_notify && *current == value {
                false
            } else {
                *current = value;
                true
            }
        };
        if changed {
            self.inner.runtime.notify(self.inner.node);
        }
    }

    /// Modify the value in place and notify dependents if it changed.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        let changed = {
            let mut current = self.inner.value.write();
            let before = current.clone();
            f(&mut current);
            self.inner.always_notify || *current != before
        };
        if changed {
            self.inner.runtime.notify(self.inner.node);
        }
    }

    /// Graph node of this cell.
    pub fn node_id(&self) -> NodeId {
        self.inner.node
    }

    /// The runtime owning this cell.
    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    /// Read-only view of this cell.
    pub fn signal(&self) -> Signal<T> {
        Signal {
            cell: self.clone(),
            _keep: None,
        }
    }
}

impl<T> Reactive for Cell<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    type Value = T;

    fn node_id(&self) -> NodeId {
        Cell::node_id(self)
    }

    fn get(&self) -> T {
        Cell::get(self)
    }
}

/// Read-only view of a reactive value.
pub struct Signal<T> {
    cell: Cell<T>,
    _keep: Option<Arc<Subscription>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            _keep: self._keep.clone(),
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Signal")
            .field(&*self.cell.inner.value.read())
            .finish()
    }
}

impl<T> Signal<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Current value.
    pub fn get(&self) -> T {
        self.cell.get()
    }

    /// Borrow the current value.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.cell.with(f)
    }

    /// Graph node notified when the value changes.
    pub fn node_id(&self) -> NodeId {
        self.cell.node_id()
    }
}

impl<T> Reactive for Signal<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    type Value = T;

    fn node_id(&self) -> NodeId {
        Signal::node_id(self)
    }

    fn get(&self) -> T {
        Signal::get(self)
    }
}
