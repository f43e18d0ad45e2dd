#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

mod action;
mod cache;
mod config;
mod error;
mod events;
mod graph;
mod key;
mod mutation;
mod persist;
mod process;
mod query;
mod query_param;
mod reaction;
mod runtime;
mod spawn;
mod status;
mod sync;
pub mod tracer;

pub use action::{MutationEvent, MutationSource, MutationStage, ResourceById, DEFAULT_ACTION_KEY};
pub use cache::{CacheEvent, CacheEventKind, Data, EntryHook, ResourceCache, ResourceRef};
pub use config::CacheConfig;
pub use error::{CacheError, LoadError, PersistenceError};
pub use events::{EventEmitter, ListenerFn, ListenerGuard, ListenerId};
pub use graph::NodeId;
pub use key::{structural_key, IdentifierFn};
pub use mutation::{Mutation, MutationBuilder};
pub use persist::{FileStore, MemoryStore, PersistHook, PersistedEntry, PersistenceStore, Persister};
pub use process::{AsyncProcess, AsyncProcessBuilder};
pub use query::{
    PaginationPlaceholder, PlaceholderData, Query, QueryBuilder, QueryExtension, QueryState,
    WeakQuery,
};
pub use query_param::{MemoryParamStore, ParamField, ParamStore, QueryParam, QueryParamBuilder};
pub use reaction::{ReactOnMutation, ReactionContext};
pub use runtime::{Cell, Reactive, Runtime, RuntimeBuilder, Signal, Subscription};
#[cfg(feature = "tokio-spawner")]
pub use spawn::TokioSpawner;
pub use spawn::{Dispatch, Loader, Spawn, ThreadSpawner};
pub use status::{ResourceState, ResourceStatus};
pub use sync::{State, StateBuilder};
pub use tracer::{CacheAccess, CommitOutcome, LogTracer, NoopTracer, ReactionEffect, Tracer};

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_send_sync() {
        assert_send_sync::<Runtime>();
        assert_send_sync::<Cell<u32>>();
        assert_send_sync::<Signal<u32>>();
        assert_send_sync::<ResourceCache<u32, String>>();
        assert_send_sync::<Query<u32, String>>();
        assert_send_sync::<Mutation<u32, String>>();
        assert_send_sync::<AsyncProcess<u32, String>>();
        assert_send_sync::<State<Vec<u32>>>();
        assert_send_sync::<LoadError>();
        assert_send_sync::<CacheError>();
    }
}
