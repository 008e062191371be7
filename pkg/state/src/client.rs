use slatedb::Db;
use slatedb::object_store::ObjectStore;
use slatedb::object_store::local::LocalFileSystem;
use slatedb::object_store::memory::InMemory;
use slatedb::object_store::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::error::StoreError;
use crate::watch::{EventLog, EventType};

/// Coordination store backed by SlateDB. Mutations are mirrored into the
/// [`EventLog`] so watch streams see them.
///
/// Keys are plain strings; values are whatever bytes the caller persisted
/// (JSON records everywhere in this project). All sharing between the
/// applicator, the stores, and the reconcilers goes through clones of this
/// handle.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Db>,
    pub event_log: EventLog,
}

impl StateStore {
    /// Open (or create) a store rooted at `path` on the local filesystem.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        info!("Opening coordination store at {}", path);

        std::fs::create_dir_all(path)
            .map_err(|e| StoreError::Backend(format!("create data directory {}: {}", path, e)))?;
        let object_store = Arc::new(
            LocalFileSystem::new_with_prefix(path)
                .map_err(|e| StoreError::Backend(format!("local object store: {}", e)))?,
        );
        Self::with_object_store(object_store).await
    }

    /// Open a store that lives entirely in memory. Used by tests and by
    /// single-process setups that do not need durability.
    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::with_object_store(Arc::new(InMemory::new())).await
    }

    async fn with_object_store(object_store: Arc<dyn ObjectStore>) -> Result<Self, StoreError> {
        let db = Db::open(Path::from("/"), object_store)
            .await
            .map_err(|e| StoreError::Backend(format!("open: {}", e)))?;
        Ok(Self {
            db: Arc::new(db),
            event_log: EventLog::new(1024),
        })
    }

    /// Store a value under the given key. Emits a `Put` watch event.
    pub async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.db
            .put(key.as_bytes(), value)
            .await
            .map_err(|e| StoreError::Backend(format!("put {}: {}", key, e)))?;
        self.event_log.emit(EventType::Put, key.to_string());
        Ok(())
    }

    /// Retrieve the value for a key, or `None` if it does not exist.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match self.db.get(key.as_bytes()).await {
            Ok(Some(bytes)) => Ok(Some(bytes.to_vec())),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Backend(format!("get {}: {}", key, e))),
        }
    }

    /// Delete a key. Deleting an absent key is a no-op, not an error.
    /// Emits a `Delete` watch event.
    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.db
            .delete(key.as_bytes())
            .await
            .map_err(|e| StoreError::Backend(format!("delete {}: {}", key, e)))?;
        self.event_log.emit(EventType::Delete, key.to_string());
        Ok(())
    }

    /// List all key-value pairs whose keys start with `prefix`, in key order.
    pub async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let mut results = Vec::new();
        let start = prefix.as_bytes().to_vec();
        let mut end = start.clone();
        while let Some(last) = end.last_mut() {
            if *last == 0xff {
                end.pop();
            } else {
                *last += 1;
                break;
            }
        }

        let mut iter = if end.is_empty() {
            self.db.scan(start..).await
        } else {
            self.db.scan(start..end).await
        }
        .map_err(|e| StoreError::Backend(format!("scan {}: {}", prefix, e)))?;

        while let Ok(Some(kv)) = iter.next().await {
            let key = String::from_utf8_lossy(&kv.key).to_string();
            results.push((key, kv.value.to_vec()));
        }
        Ok(results)
    }

    /// Gracefully close the store.
    pub async fn close(&self) -> Result<(), StoreError> {
        info!("Closing coordination store");
        self.db
            .close()
            .await
            .map_err(|e| StoreError::Backend(format!("close: {}", e)))
    }
}
