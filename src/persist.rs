//! Persistence of resolved query entries.
//!
//! A [`Persister`] writes each successfully loaded entry to a
//! [`PersistenceStore`] and seeds newly created entries from it, so a fresh
//! cache can show the last known value with status
//! [`Local`](crate::ResourceStatus::Local) before its first load completes.
//!
//! Store failures never reach the query: a failed read is a miss and a failed
//! write is logged and dropped.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::cache::Data;
use crate::{
    CacheError, EntryHook, PersistenceError, Query, QueryExtension, ResourceState, ResourceStatus,
    Runtime,
};

/// A string key-value store.
pub trait PersistenceStore: Send + Sync + 'static {
    /// Read the value stored under `key`.
    fn get(&self, key: &str) -> Result<Option<String>, PersistenceError>;

    /// Store `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &str) -> Result<(), PersistenceError>;

    /// Delete the value stored under `key`.
    fn remove(&self, key: &str) -> Result<(), PersistenceError>;
}

/// In-memory store. Clones share the same contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    data: Arc<Mutex<BTreeMap<String, String>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored keys in order.
    pub fn keys(&self) -> Vec<String> {
        self.data.lock().keys().cloned().collect()
    }
}

impl PersistenceStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        Ok(self.data.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        self.data.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PersistenceError> {
        self.data.lock().remove(key);
        Ok(())
    }
}

/// Store backed by a single JSON file holding every key.
///
/// The file is read once on open. Each write rewrites the whole file through
/// a temporary sibling and an atomic rename.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    data: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Open the store at `path`, starting empty if the file does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref().to_path_buf();
        let data = match std::fs::read_to_string(&path) {
            Ok(contents) if contents.trim().is_empty() => BTreeMap::new(),
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, data: &BTreeMap<String, String>) -> Result<(), PersistenceError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(data)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl PersistenceStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        Ok(self.data.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        let mut data = self.data.lock();
        data.insert(key.to_string(), value.to_string());
        self.write(&data)
    }

    fn remove(&self, key: &str) -> Result<(), PersistenceError> {
        let mut data = self.data.lock();
        if data.remove(key).is_some() {
            self.write(&data)?;
        }
        Ok(())
    }
}

/// Serialized form of one persisted entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedEntry<P, V> {
    /// Last resolved value.
    pub value: V,
    /// Parameters it was loaded with.
    pub params: Option<P>,
}

/// Writes resolved entries to a store under `"{store_name}:{key}:{entry key}"`
/// and restores them into new entries.
#[derive(Clone)]
pub struct Persister {
    store: Arc<dyn PersistenceStore>,
    store_name: String,
    key: String,
}

impl std::fmt::Debug for Persister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persister")
            .field("store_name", &self.store_name)
            .field("key", &self.key)
            .finish()
    }
}

impl Persister {
    /// Persist into `store` under the `store_name:key` namespace.
    pub fn new(
        store: impl PersistenceStore,
        store_name: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self::shared(Arc::new(store), store_name, key)
    }

    /// Like [`new`](Self::new), for a store shared with other persisters.
    pub fn shared(
        store: Arc<dyn PersistenceStore>,
        store_name: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            store,
            store_name: store_name.into(),
            key: key.into(),
        }
    }

    /// The `store_name:key` namespace.
    pub fn namespace(&self) -> String {
        format!("{}:{}", self.store_name, self.key)
    }

    /// Storage key of the entry with cache key `entry_key`.
    pub fn storage_key(&self, entry_key: &str) -> String {
        format!("{}:{}:{}", self.store_name, self.key, entry_key)
    }

    /// Read the persisted form of `entry_key`.
    pub fn load<P, V>(&self, entry_key: &str) -> Result<Option<PersistedEntry<P, V>>, PersistenceError>
    where
        P: DeserializeOwned,
        V: DeserializeOwned,
    {
        match self.store.get(&self.storage_key(entry_key))? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Write `value` and `params` for `entry_key`.
    pub fn save<P, V>(&self, entry_key: &str, value: &V, params: Option<&P>) -> Result<(), PersistenceError>
    where
        P: Serialize,
        V: Serialize,
    {
        #[derive(Serialize)]
        struct Borrowed<'a, P, V> {
            value: &'a V,
            params: Option<&'a P>,
        }

        let raw = serde_json::to_string(&Borrowed { value, params })?;
        self.store.set(&self.storage_key(entry_key), &raw)
    }

    /// Delete the persisted form of `entry_key`.
    pub fn forget(&self, entry_key: &str) -> Result<(), PersistenceError> {
        self.store.remove(&self.storage_key(entry_key))
    }

    /// Cache hook restoring and saving entries through this persister.
    pub fn hook<P, V>(&self, runtime: &Runtime) -> PersistHook<P, V> {
        PersistHook {
            persister: self.clone(),
            runtime: runtime.clone(),
            _marker: PhantomData,
        }
    }
}

impl<P, V> QueryExtension<P, V> for Persister
where
    P: Data + Serialize + DeserializeOwned,
    V: Data + Serialize + DeserializeOwned,
{
    fn install(self: Box<Self>, query: &Query<P, V>) -> Result<(), CacheError> {
        if !query.runtime().config().enable_persistence {
            tracing::debug!(namespace = %self.namespace(), "persistence disabled; skipping persister");
            return Ok(());
        }
        query.cache().add_hook(self.hook::<P, V>(query.runtime()));
        Ok(())
    }
}

/// [`EntryHook`] produced by [`Persister::hook`].
pub struct PersistHook<P, V> {
    persister: Persister,
    runtime: Runtime,
    _marker: PhantomData<fn() -> (P, V)>,
}

impl<P, V> PersistHook<P, V> {
    fn report(&self, entry_key: &str, error: &PersistenceError) {
        let storage_key = self.persister.storage_key(entry_key);
        self.runtime.tracer().on_persistence_error(&storage_key, error);
        tracing::warn!(storage_key = %storage_key, %error, "persistence failure ignored");
    }
}

impl<P, V> EntryHook<P, V> for PersistHook<P, V>
where
    P: Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn restore(&self, key: &str) -> Option<(V, Option<P>)> {
        match self.persister.load::<P, V>(key) {
            Ok(entry) => entry.map(|e| (e.value, e.params)),
            Err(error) => {
                self.report(key, &error);
                None
            }
        }
    }

    fn on_commit(&self, state: &ResourceState<P, V>) {
        if state.status != ResourceStatus::Resolved {
            return;
        }
        let Some(value) = state.value.as_ref() else {
            return;
        };
        if let Err(error) = self.persister.save(&state.key, value, state.params.as_ref()) {
            self.report(&state.key, &error);
        }
    }
}
