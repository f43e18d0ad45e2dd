//! Reactions of queries to mutation lifecycles.
//!
//! A [`ReactOnMutation`] rule is installed on a query as an extension and
//! listens to one [`MutationSource`]. For each event of that source:
//!
//! 1. the filter decides whether the rule applies at all;
//! 2. on `Started`, the optimistic update or patch is written to the query's
//!    current entry right away;
//! 3. on `Resolved` or `Errored`, the matching reload predicate decides
//!    whether to invalidate and reload the query, superseding any load in
//!    flight for it.
//!
//! Optimistic values are never rolled back by an inverse patch. Recovery is a
//! reload, configured with [`ReactOnMutation::reload_on_error`].
//!
//! Rules installed on the same query run in installation order, and each one
//! reads the query state left by the rules before it.

use std::sync::Arc;

use crate::action::{MutationEvent, MutationSource, MutationStage};
use crate::cache::Data;
use crate::query::WeakQuery;
use crate::{CacheError, ListenerGuard, LoadError, Query, QueryExtension, QueryState, ReactionEffect};

/// What a reaction rule sees when handling one event.
pub struct ReactionContext<'a, P, V, MP, MV> {
    /// State of the target query before the rule runs.
    pub query: &'a QueryState<P, V>,
    /// The mutation event being handled.
    pub event: &'a MutationEvent<MP, MV>,
}

impl<P, V, MP, MV> ReactionContext<'_, P, V, MP, MV> {
    /// The query's shown value.
    pub fn query_value(&self) -> Option<&V> {
        self.query.value.as_ref()
    }

    /// Parameters of the mutation call.
    pub fn mutation_params(&self) -> &MP {
        &self.event.params
    }

    /// Identifier of the mutation call.
    pub fn mutation_identifier(&self) -> Option<&str> {
        self.event.identifier.as_deref()
    }

    /// Value of the mutation call, once resolved.
    pub fn mutation_value(&self) -> Option<&MV> {
        self.event.value()
    }

    /// Error of the mutation call, once failed.
    pub fn mutation_error(&self) -> Option<&LoadError> {
        self.event.error()
    }
}

type Predicate<P, V, MP, MV> = Arc<dyn Fn(&ReactionContext<'_, P, V, MP, MV>) -> bool + Send + Sync>;

enum Optimistic<P, V, MP, MV> {
    Update(Arc<dyn Fn(&ReactionContext<'_, P, V, MP, MV>) -> Option<V> + Send + Sync>),
    Patch(Arc<dyn Fn(&mut V, &ReactionContext<'_, P, V, MP, MV>) + Send + Sync>),
}

type Listener<MP, MV> = Box<dyn Fn(&MutationEvent<MP, MV>) + Send + Sync>;

/// A query extension binding a mutation's lifecycle to the query's entry.
pub struct ReactOnMutation<P, V, MP, MV> {
    subscribe: Box<dyn FnOnce(Listener<MP, MV>) -> ListenerGuard + Send>,
    rule: Rule<P, V, MP, MV>,
}

struct Rule<P, V, MP, MV> {
    filter: Option<Predicate<P, V, MP, MV>>,
    optimistic: Option<Optimistic<P, V, MP, MV>>,
    reload_on_resolved: Option<Predicate<P, V, MP, MV>>,
    reload_on_error: Option<Predicate<P, V, MP, MV>>,
}

impl<P: Data, V: Data, MP: Data, MV: Data> ReactOnMutation<P, V, MP, MV> {
    /// A rule reacting to `source`. Without further configuration it does
    /// nothing.
    pub fn new<S>(source: &S) -> Self
    where
        S: MutationSource<MP, MV> + Clone,
    {
        let source = source.clone();
        Self {
            subscribe: Box::new(move |listener: Listener<MP, MV>| {
                source.subscribe_events(move |event| listener(event))
            }),
            rule: Rule {
                filter: None,
                optimistic: None,
                reload_on_resolved: None,
                reload_on_error: None,
            },
        }
    }

    /// Only handle events for which `filter` holds.
    pub fn filter(
        mut self,
        filter: impl Fn(&ReactionContext<'_, P, V, MP, MV>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.rule.filter = Some(Arc::new(filter));
        self
    }

    /// When a call starts, replace the query's value with the returned one.
    /// Returning `None` leaves the value untouched.
    pub fn optimistic_update(
        mut self,
        update: impl Fn(&ReactionContext<'_, P, V, MP, MV>) -> Option<V> + Send + Sync + 'static,
    ) -> Self {
        self.rule.optimistic = Some(Optimistic::Update(Arc::new(update)));
        self
    }

    /// When a call starts, modify the query's value in place. Skipped while
    /// the query shows no value.
    pub fn optimistic_patch(
        mut self,
        patch: impl Fn(&mut V, &ReactionContext<'_, P, V, MP, MV>) + Send + Sync + 'static,
    ) -> Self {
        self.rule.optimistic = Some(Optimistic::Patch(Arc::new(patch)));
        self
    }

    /// When a call resolves, reload the query if `predicate` holds for the
    /// query state at that point.
    pub fn reload_on_resolved(
        mut self,
        predicate: impl Fn(&ReactionContext<'_, P, V, MP, MV>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.rule.reload_on_resolved = Some(Arc::new(predicate));
        self
    }

    /// When a call fails, reload the query if `predicate` holds.
    pub fn reload_on_error(
        mut self,
        predicate: impl Fn(&ReactionContext<'_, P, V, MP, MV>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.rule.reload_on_error = Some(Arc::new(predicate));
        self
    }
}

impl<P: Data, V: Data, MP: Data, MV: Data> QueryExtension<P, V> for ReactOnMutation<P, V, MP, MV> {
    fn install(self: Box<Self>, query: &Query<P, V>) -> Result<(), CacheError> {
        let Self { subscribe, rule } = *self;
        let target: WeakQuery<P, V> = query.downgrade();
        let guard = subscribe(Box::new(move |event: &MutationEvent<MP, MV>| {
            if let Some(query) = target.upgrade() {
                rule.react(&query, event);
            }
        }));
        query.retain(guard);
        Ok(())
    }
}

impl<P: Data, V: Data, MP: Data, MV: Data> Rule<P, V, MP, MV> {
    fn react(&self, query: &Query<P, V>, event: &MutationEvent<MP, MV>) {
        let state = query.state();
        let Some(key) = state.key.clone() else {
            return;
        };
        let ctx = ReactionContext {
            query: &state,
            event,
        };
        let tracer = query.runtime().tracer();

        if let Some(filter) = &self.filter {
            if !filter(&ctx) {
                tracer.on_reaction(&key, ReactionEffect::Filtered);
                return;
            }
        }

        let reload = match &event.stage {
            MutationStage::Started => {
                let next = match &self.optimistic {
                    None => None,
                    Some(Optimistic::Update(update)) => update(&ctx),
                    Some(Optimistic::Patch(patch)) => state.value.clone().map(|mut value| {
                        patch(&mut value, &ctx);
                        value
                    }),
                };
                if let Some(next) = next {
                    if query.set_value(next) {
                        tracer.on_reaction(&key, ReactionEffect::Optimistic);
                        tracing::debug!(query = %query.name(), key = %key, mutation = %event.key, "optimistic update");
                    }
                }
                false
            }
            MutationStage::Resolved(_) => self.reload_on_resolved.as_ref().is_some_and(|p| p(&ctx)),
            MutationStage::Errored(_) => self.reload_on_error.as_ref().is_some_and(|p| p(&ctx)),
            MutationStage::Cancelled => false,
        };

        if reload {
            tracer.on_reaction(&key, ReactionEffect::Reloaded);
            tracing::debug!(query = %query.name(), key = %key, mutation = %event.key, stage = event.stage.as_str(), "reload after mutation");
            query.invalidate();
        }
    }
}
