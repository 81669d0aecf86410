//! Durable keyed tables backing the connection registry, the game records
//! and the event log.
//!
//! Every table lives in memory behind an async lock and, when given a
//! snapshot path, rewrites a bincode snapshot after each mutation (temp file
//! plus rename, so a crash never leaves a torn file). Mutations are scoped to
//! a single key and the last writer wins.

use async_trait::async_trait;
use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::Serialize;
use shared::SyncError;
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::sync::RwLock;

/// A change applied to one row while the table holds it. Returns whether
/// the row changed and must be written back. An error leaves the row as it
/// was.
pub type Mutation<V> = Box<dyn FnOnce(&mut V) -> Result<bool, SyncError> + Send>;

/// Single-key storage operations. Each call is an independent suspension
/// point that may fail on its own.
#[async_trait]
pub trait Store<K, V>: Send + Sync
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    async fn get(&self, key: &K) -> Result<Option<V>, SyncError>;

    /// Inserts or overwrites.
    async fn put(&self, key: K, value: V) -> Result<(), SyncError>;

    /// Inserts only if the key is absent. Returns whether a row was written.
    async fn insert_new(&self, key: K, value: V) -> Result<bool, SyncError>;

    /// Atomic read-modify-write of one row. `None` if the key is absent,
    /// otherwise the row as it now stands and whether it was written.
    async fn modify(&self, key: &K, change: Mutation<V>) -> Result<Option<(V, bool)>, SyncError>;

    /// Removing a missing key is not an error.
    async fn remove(&self, key: &K) -> Result<Option<V>, SyncError>;

    async fn scan(&self) -> Result<Vec<V>, SyncError>;
}

pub struct Table<K, V> {
    name: &'static str,
    rows: RwLock<HashMap<K, V>>,
    snapshot: Option<PathBuf>,
}

impl<K, V> Table<K, V>
where
    K: Eq + Hash + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn in_memory(name: &'static str) -> Self {
        Self {
            name,
            rows: RwLock::new(HashMap::new()),
            snapshot: None,
        }
    }

    /// Opens a table backed by a snapshot file, loading existing rows.
    pub async fn open(name: &'static str, path: impl Into<PathBuf>) -> Result<Self, SyncError> {
        let path = path.into();
        let rows = match tokio::fs::read(&path).await {
            Ok(bytes) => bincode::deserialize::<HashMap<K, V>>(&bytes)
                .map_err(|e| store_error(name, e))?,
            Err(e) if e.kind() == ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(store_error(name, e)),
        };
        info!(
            "Opened table '{}' with {} rows from {}",
            name,
            rows.len(),
            path.display()
        );

        Ok(Self {
            name,
            rows: RwLock::new(rows),
            snapshot: Some(path),
        })
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }

    async fn persist(&self, rows: &HashMap<K, V>) -> Result<(), SyncError> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };

        let bytes = bincode::serialize(rows).map_err(|e| store_error(self.name, e))?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| store_error(self.name, e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| store_error(self.name, e))?;

        debug!("Persisted {} rows of '{}'", rows.len(), self.name);
        Ok(())
    }
}

#[async_trait]
impl<K, V> Store<K, V> for Table<K, V>
where
    K: Eq + Hash + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, key: &K) -> Result<Option<V>, SyncError> {
        Ok(self.rows.read().await.get(key).cloned())
    }

    async fn put(&self, key: K, value: V) -> Result<(), SyncError> {
        let mut rows = self.rows.write().await;
        rows.insert(key, value);
        self.persist(&rows).await
    }

    async fn insert_new(&self, key: K, value: V) -> Result<bool, SyncError> {
        let mut rows = self.rows.write().await;
        if rows.contains_key(&key) {
            return Ok(false);
        }
        rows.insert(key, value);
        self.persist(&rows).await?;
        Ok(true)
    }

    async fn modify(&self, key: &K, change: Mutation<V>) -> Result<Option<(V, bool)>, SyncError> {
        let mut rows = self.rows.write().await;
        let Some(current) = rows.get(key) else {
            return Ok(None);
        };

        let mut next = current.clone();
        if !change(&mut next)? {
            return Ok(Some((current.clone(), false)));
        }
        rows.insert(key.clone(), next.clone());
        self.persist(&rows).await?;
        Ok(Some((next, true)))
    }

    async fn remove(&self, key: &K) -> Result<Option<V>, SyncError> {
        let mut rows = self.rows.write().await;
        let removed = rows.remove(key);
        if removed.is_some() {
            self.persist(&rows).await?;
        }
        Ok(removed)
    }

    async fn scan(&self) -> Result<Vec<V>, SyncError> {
        Ok(self.rows.read().await.values().cloned().collect())
    }
}

fn store_error(table: &str, err: impl Display) -> SyncError {
    SyncError::Store(format!("{}: {}", table, err))
}
