//! Lifecycle status and snapshots of cached resources.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::LoadError;

/// Lifecycle state of one cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    /// Nothing has been requested yet.
    #[default]
    Idle,
    /// A load is in flight.
    Loading,
    /// The latest load succeeded.
    Resolved,
    /// The latest load failed. The previous value, if any, is retained.
    Error,
    /// The value was restored from persistence and not yet confirmed by a load.
    Local,
    /// The latest run finished without producing a value.
    Cancelled,
}

impl ResourceStatus {
    /// Lowercase name, as used in persisted data and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceStatus::Idle => "idle",
            ResourceStatus::Loading => "loading",
            ResourceStatus::Resolved => "resolved",
            ResourceStatus::Error => "error",
            ResourceStatus::Local => "local",
            ResourceStatus::Cancelled => "cancelled",
        }
    }

    /// Check if a load is in flight.
    pub fn is_loading(&self) -> bool {
        matches!(self, ResourceStatus::Loading)
    }

    /// Check if the latest attempt has finished one way or another.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            ResourceStatus::Resolved | ResourceStatus::Error | ResourceStatus::Cancelled
        )
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a cache entry.
///
/// `generation` increases on every dispatch for the entry's key; only a
/// response carrying the current generation may be committed.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceState<P, V> {
    /// Identity of the entry.
    pub key: String,
    /// Current lifecycle status.
    pub status: ResourceStatus,
    /// Last committed or optimistically written value.
    pub value: Option<V>,
    /// Error of the latest failed attempt, cleared on the next dispatch.
    pub error: Option<LoadError>,
    /// Parameters of the latest dispatch.
    pub params: Option<P>,
    /// Attempt counter for this key.
    pub generation: u64,
}

impl<P, V> ResourceState<P, V> {
    /// An idle entry with no value.
    pub fn idle(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            status: ResourceStatus::Idle,
            value: None,
            error: None,
            params: None,
            generation: 0,
        }
    }

    /// An entry restored from persistence.
    pub fn local(key: impl Into<String>, value: V, params: Option<P>) -> Self {
        Self {
            key: key.into(),
            status: ResourceStatus::Local,
            value: Some(value),
            error: None,
            params,
            generation: 0,
        }
    }

    /// Check if a value is present.
    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }

    /// The value, if present.
    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    /// Same as [`value`](Self::value); provided for callers that prefer an
    /// accessor which never fails on error status.
    pub fn safe_value(&self) -> Option<&V> {
        self.value()
    }

    /// Check if a load is in flight.
    pub fn is_loading(&self) -> bool {
        self.status.is_loading()
    }

    /// The error of the latest failed attempt.
    pub fn error(&self) -> Option<&LoadError> {
        self.error.as_ref()
    }
}
