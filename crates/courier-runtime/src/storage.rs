//! Key-value persistence
//!
//! Local peer histories and display names survive restarts through a small
//! JSON key-value store. The persistence task writes whatever the engine hands
//! it in `Effect::PersistPeerBook`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use courier_core::channel::{EffectReceiver, EventSender};
use courier_core::{CourierError, Effect, PersistedPeerBook, Result};
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::tasks::{next_effect, TaskChannels, TransportTask};

// ----------------------------------------------------------------------------
// Key-Value Store Trait
// ----------------------------------------------------------------------------

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn set(&self, key: &str, value: Value) -> Result<()>;

    /// Deleting a missing key is not an error
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Process-local store, used by tests and when nothing should touch disk
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: DashMap<String, Value>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

/// One JSON file per key inside a directory
#[derive(Debug, Clone)]
pub struct FileKeyValueStore {
    directory: PathBuf,
}

impl FileKeyValueStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file_name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.directory.join(format!("{}.json", file_name))
    }
}

fn io_error(action: &str, path: &Path, e: std::io::Error) -> CourierError {
    CourierError::storage_error(format!("{} {}: {}", action, path.display(), e))
}

#[async_trait]
impl KeyValueStore for FileKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("read", &path, e)),
        }
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|e| io_error("create", &self.directory, e))?;

        let path = self.path_for(key);
        let staging = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(&value)?;
        tokio::fs::write(&staging, bytes)
            .await
            .map_err(|e| io_error("write", &staging, e))?;
        tokio::fs::rename(&staging, &path)
            .await
            .map_err(|e| io_error("replace", &path, e))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("delete", &path, e)),
        }
    }
}

// ----------------------------------------------------------------------------
// Peer Book Persistence
// ----------------------------------------------------------------------------

/// Load the persisted peer book; unreadable data starts an empty book
pub async fn load_peer_book(store: &dyn KeyValueStore, key: &str) -> Result<PersistedPeerBook> {
    let Some(value) = store.get(key).await? else {
        return Ok(PersistedPeerBook::default());
    };
    match serde_json::from_value(value) {
        Ok(book) => Ok(book),
        Err(e) => {
            warn!(key, "Discarding unreadable peer book: {}", e);
            Ok(PersistedPeerBook::default())
        }
    }
}

/// Writes `Effect::PersistPeerBook` snapshots to a [`KeyValueStore`]
pub struct PersistenceTask {
    channels: TaskChannels,
    store: Arc<dyn KeyValueStore>,
}

impl PersistenceTask {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            channels: TaskChannels::default(),
            store,
        }
    }
}

#[async_trait]
impl TransportTask for PersistenceTask {
    fn attach_channels(
        &mut self,
        event_sender: EventSender,
        effect_receiver: EffectReceiver,
    ) -> Result<()> {
        self.channels.attach(self.name(), event_sender, effect_receiver)
    }

    async fn run(&mut self) -> Result<()> {
        // Persistence never reports back to the engine
        let (_events, mut effects) = self.channels.take(self.name())?;
        info!("Persistence task starting");

        while let Some(effect) = next_effect(&mut effects, "persistence").await {
            let Effect::PersistPeerBook { key, book } = effect else {
                continue;
            };
            let value = serde_json::to_value(&book)?;
            match self.store.set(&key, value).await {
                Ok(()) => debug!(%key, peers = book.histories.len(), "Peer book saved"),
                Err(e) => warn!(%key, "Failed to save peer book: {}", e),
            }
        }

        info!("Persistence task stopped");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "persistence"
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::DeviceAddress;
    use serde_json::json;

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("courier-kv-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryKeyValueStore::new();
        assert_eq!(store.get("k").await.unwrap(), None);

        store.set("k", json!({"a": 1})).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!({"a": 1})));
        assert_eq!(store.len(), 1);

        store.delete("k").await.unwrap();
        store.delete("k").await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_file_store_persists_across_instances() {
        let directory = scratch_dir();
        let store = FileKeyValueStore::new(&directory);
        store.set("courier.local-peers", json!([1, 2, 3])).await.unwrap();

        let reopened = FileKeyValueStore::new(&directory);
        assert_eq!(
            reopened.get("courier.local-peers").await.unwrap(),
            Some(json!([1, 2, 3]))
        );

        reopened.delete("courier.local-peers").await.unwrap();
        assert_eq!(reopened.get("courier.local-peers").await.unwrap(), None);
        let _ = std::fs::remove_dir_all(directory);
    }

    #[test]
    fn test_file_names_are_sanitized() {
        let store = FileKeyValueStore::new("/data");
        assert_eq!(
            store.path_for("../peers/book"),
            PathBuf::from("/data/.._peers_book.json")
        );
    }

    #[tokio::test]
    async fn test_load_peer_book_tolerates_garbage() {
        let store = MemoryKeyValueStore::new();
        assert_eq!(
            load_peer_book(&store, "book").await.unwrap(),
            PersistedPeerBook::default()
        );

        store.set("book", json!("not a book")).await.unwrap();
        assert_eq!(
            load_peer_book(&store, "book").await.unwrap(),
            PersistedPeerBook::default()
        );

        let mut book = PersistedPeerBook::default();
        book.display_names
            .insert(DeviceAddress::new("AA:BB"), "Kitchen tablet".to_string());
        store.set("book", serde_json::to_value(&book).unwrap()).await.unwrap();
        assert_eq!(load_peer_book(&store, "book").await.unwrap(), book);
    }
}
