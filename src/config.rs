//! Runtime configuration.

use serde::Deserialize;

/// Settings shared by every cache, query and state bound to a [`Runtime`](crate::Runtime).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// When false, persister extensions install as no-ops.
    pub enable_persistence: bool,
    /// Maximum number of node evaluations in a single reactive flush.
    pub flush_limit: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enable_persistence: true,
            flush_limit: 10_000,
        }
    }
}

impl CacheConfig {
    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(source)
    }
}
