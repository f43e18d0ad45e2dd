//! Tracer trait for observing cache activity.
//!
//! This module defines the [`Tracer`] trait and the event types it receives.
//! The default [`NoopTracer`] discards everything; [`LogTracer`] forwards each
//! event to the `tracing` crate.
//!
//! # Example
//!
//! ```ignore
//! use resource_flow::{Runtime, Tracer};
//!
//! struct StaleCounter(std::sync::atomic::AtomicUsize);
//!
//! impl Tracer for StaleCounter {
//!     fn on_stale_discarded(&self, _cache: &str, _key: &str, _generation: u64, _current: u64) {
//!         self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
//!     }
//! }
//!
//! let runtime = Runtime::builder().tracer(StaleCounter(Default::default())).build();
//! ```

use crate::PersistenceError;

/// How a cache answered a request for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAccess {
    /// A resolved value was reused without calling the loader.
    Hit,
    /// A load for the key was already in flight and was joined.
    Joined,
    /// A new load was dispatched.
    Dispatched,
}

/// Outcome of an accepted commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The loader produced a value.
    Resolved,
    /// The loader produced no value.
    Cancelled,
    /// The loader failed.
    Failed {
        /// Display form of the error.
        message: String,
    },
}

/// What a mutation reaction did to a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionEffect {
    /// The rule's filter rejected the event.
    Filtered,
    /// An optimistic value was written to the query's entry.
    Optimistic,
    /// The query was reloaded.
    Reloaded,
}

/// Tracer trait for observing cache activity.
///
/// All methods have default empty implementations, so you only need to
/// override the events you're interested in.
///
/// Implementations must be `Send + Sync` as loaders commit from whichever
/// thread the spawner runs them on.
pub trait Tracer: Send + Sync + 'static {
    /// Called when a load is dispatched for a key.
    #[inline]
    fn on_dispatch(&self, _cache: &str, _key: &str, _generation: u64) {}

    /// Called when a query asks its cache for a key.
    #[inline]
    fn on_access(&self, _cache: &str, _key: &str, _access: CacheAccess) {}

    /// Called when a response is committed to an entry.
    #[inline]
    fn on_commit(&self, _cache: &str, _key: &str, _generation: u64, _outcome: CommitOutcome) {}

    /// Called when a response is dropped because a newer dispatch exists.
    #[inline]
    fn on_stale_discarded(&self, _cache: &str, _key: &str, _generation: u64, _current: u64) {}

    /// Called when an entry is marked stale.
    #[inline]
    fn on_invalidated(&self, _cache: &str, _key: &str) {}

    /// Called when an entry is removed from its cache.
    #[inline]
    fn on_evicted(&self, _cache: &str, _key: &str) {}

    /// Called when a mutation reaction rule handles an event.
    #[inline]
    fn on_reaction(&self, _query_key: &str, _effect: ReactionEffect) {}

    /// Called when a persistence store read or write fails.
    #[inline]
    fn on_persistence_error(&self, _storage_key: &str, _error: &PersistenceError) {}

    /// Called when a derivation is rejected because it would form a cycle.
    #[inline]
    fn on_cycle_detected(&self, _path: &[String]) {}

    /// Called when a flush is aborted after too many evaluations.
    #[inline]
    fn on_flush_aborted(&self, _limit: usize) {}
}

/// Zero-cost tracer that discards all events.
///
/// This is the default tracer for [`Runtime`](crate::Runtime).
pub struct NoopTracer;

impl Tracer for NoopTracer {}

/// Tracer that forwards every event to the `tracing` crate.
pub struct LogTracer;

impl Tracer for LogTracer {
    fn on_dispatch(&self, cache: &str, key: &str, generation: u64) {
        tracing::debug!(cache, key, generation, "dispatch");
    }

    fn on_access(&self, cache: &str, key: &str, access: CacheAccess) {
        tracing::trace!(cache, key, ?access, "access");
    }

    fn on_commit(&self, cache: &str, key: &str, generation: u64, outcome: CommitOutcome) {
        tracing::debug!(cache, key, generation, ?outcome, "commit");
    }

    fn on_stale_discarded(&self, cache: &str, key: &str, generation: u64, current: u64) {
        tracing::debug!(cache, key, generation, current, "stale response discarded");
    }

    fn on_invalidated(&self, cache: &str, key: &str) {
        tracing::debug!(cache, key, "invalidated");
    }

    fn on_evicted(&self, cache: &str, key: &str) {
        tracing::debug!(cache, key, "evicted");
    }

    fn on_reaction(&self, query_key: &str, effect: ReactionEffect) {
        tracing::debug!(query_key, ?effect, "reaction");
    }

    fn on_persistence_error(&self, storage_key: &str, error: &PersistenceError) {
        tracing::warn!(storage_key, %error, "persistence failure");
    }

    fn on_cycle_detected(&self, path: &[String]) {
        tracing::warn!(path = %path.join(" -> "), "dependency cycle rejected");
    }

    fn on_flush_aborted(&self, limit: usize) {
        tracing::error!(limit, "reactive flush aborted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingTracer {
        dispatch_count: AtomicUsize,
        stale_count: AtomicUsize,
    }

    impl CountingTracer {
        fn new() -> Self {
            Self {
                dispatch_count: AtomicUsize::new(0),
                stale_count: AtomicUsize::new(0),
            }
        }
    }

    impl Tracer for CountingTracer {
        fn on_dispatch(&self, _cache: &str, _key: &str, _generation: u64) {
            self.dispatch_count.fetch_add(1, Ordering::Relaxed);
        }

        fn on_stale_discarded(&self, _cache: &str, _key: &str, _generation: u64, _current: u64) {
            self.stale_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_counting_tracer() {
        let tracer = CountingTracer::new();

        tracer.on_dispatch("users", "1", 1);
        tracer.on_dispatch("users", "1", 2);
        tracer.on_stale_discarded("users", "1", 1, 2);
        tracer.on_commit("users", "1", 2, CommitOutcome::Resolved);

        assert_eq!(tracer.dispatch_count.load(Ordering::Relaxed), 2);
        assert_eq!(tracer.stale_count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_log_tracer_accepts_all_events() {
        let tracer = LogTracer;
        tracer.on_access("users", "1", CacheAccess::Hit);
        tracer.on_cycle_detected(&["a".to_string(), "a".to_string()]);
        tracer.on_persistence_error("app:users:1", &PersistenceError::Backend("full".into()));
        tracer.on_flush_aborted(10);
    }

    #[test]
    fn test_tracer_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopTracer>();
        assert_send_sync::<LogTracer>();
        assert_send_sync::<Arc<CountingTracer>>();
    }
}
