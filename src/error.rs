//! Error types for resource loading and cache coordination.

use std::fmt;
use std::sync::Arc;

/// A failure produced by a loader.
///
/// Any type implementing `Into<anyhow::Error>` converts into a `LoadError`,
/// so loaders can use the `?` operator freely. The error is shared behind an
/// `Arc`, which makes it cheap to clone into every snapshot that reports it.
#[derive(Clone)]
pub struct LoadError(Arc<anyhow::Error>);

impl LoadError {
    /// Wrap an error produced by a loader.
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }

    /// The underlying `anyhow` error.
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }

    /// Attempts to downcast the error to a specific type.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.0.downcast_ref::<E>()
    }

    /// Returns `true` if the error is of type `E`.
    pub fn is<E: std::error::Error + Send + Sync + 'static>(&self) -> bool {
        self.downcast_ref::<E>().is_some()
    }
}

impl<T: Into<anyhow::Error>> From<T> for LoadError {
    fn from(err: T) -> Self {
        LoadError::new(err)
    }
}

impl fmt::Debug for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LoadError({:?})", self.0)
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Two load errors are equal only when they are the same shared failure.
impl PartialEq for LoadError {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Errors reported by the cache and the reactive runtime.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CacheError {
    /// The loader failed.
    #[error("load failed: {0}")]
    Load(LoadError),

    /// Registering a derivation would make it read its own output.
    ///
    /// `path` holds the labels of the nodes forming the cycle, starting and
    /// ending at the same node.
    #[error("dependency cycle detected: {}", .path.join(" -> "))]
    Cycle {
        /// Labels of the nodes forming the cycle.
        path: Vec<String>,
    },

    /// A single flush evaluated more nodes than the configured limit.
    #[error("reactive flush exceeded {limit} evaluations")]
    FlushLimitExceeded {
        /// The configured limit.
        limit: usize,
    },

    /// The run finished without producing a value.
    #[error("run cancelled")]
    Cancelled,

    /// The background task was dropped before it reported an outcome.
    #[error("task dropped before completion")]
    Dropped,
}

impl From<LoadError> for CacheError {
    fn from(err: LoadError) -> Self {
        CacheError::Load(err)
    }
}

impl CacheError {
    /// Returns the loader error if this is a `Load` variant.
    pub fn load_error(&self) -> Option<&LoadError> {
        match self {
            CacheError::Load(e) => Some(e),
            _ => None,
        }
    }
}

/// Errors raised by persistence stores.
///
/// These never reach a query's status; a failed read is a cache miss and a
/// failed write is logged and dropped.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Reading or writing the backing file failed.
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored value could not be encoded or decoded.
    #[error("storage encoding error: {0}")]
    Serde(#[from] serde_json::Error),

    /// The store backend rejected the operation.
    #[error("storage backend error: {0}")]
    Backend(String),
}
