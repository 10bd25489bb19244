//! Content hashes of cached archives, keyed by file name.
//!
//! A record is trusted while the file's size and modification time still
//! match; otherwise the file is re-hashed and the record replaced. Readers
//! share a lock, while re-hashing and persisting are serialized behind a
//! single writer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::config::INTEGRITY_FILE;
use crate::error::StorageError;
use crate::storage::{self, DirEntry, StorageBackend};

use super::hash_bytes;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityRecord {
    pub file_path: String,
    pub hash: String,
    pub size_bytes: u64,
    pub modified_time: Option<DateTime<Utc>>,
}

impl IntegrityRecord {
    fn new(file_path: &str, hash: String, stat: &DirEntry) -> Self {
        Self {
            file_path: file_path.to_string(),
            hash,
            size_bytes: stat.size,
            modified_time: stat.modified.map(DateTime::<Utc>::from),
        }
    }

    fn matches(&self, stat: &DirEntry) -> bool {
        let modified = stat.modified.map(DateTime::<Utc>::from);
        modified.is_some() && self.size_bytes == stat.size && self.modified_time == modified
    }
}

pub struct IntegrityIndex {
    storage: Arc<dyn StorageBackend>,
    dir: String,
    records: RwLock<HashMap<String, IntegrityRecord>>,
    writer: Mutex<()>,
}

impl IntegrityIndex {
    /// Load the sidecar in `dir`. A missing or unreadable sidecar yields an
    /// empty index; hashes are then recomputed on demand.
    pub async fn load(storage: Arc<dyn StorageBackend>, dir: &str) -> Self {
        let path = storage::join(dir, INTEGRITY_FILE);
        let records = match storage.read(&path).await {
            Ok(data) => match serde_json::from_slice::<HashMap<String, IntegrityRecord>>(&data) {
                Ok(records) => records,
                Err(e) => {
                    log::warn!("Ignoring corrupt integrity index {}: {}", path, e);
                    HashMap::new()
                }
            },
            Err(e) if storage.is_not_exist(&e) => HashMap::new(),
            Err(e) => {
                log::warn!("Failed to read integrity index {}: {}", path, e);
                HashMap::new()
            }
        };
        log::debug!("Loaded {} integrity record(s) from {}", records.len(), path);
        Self {
            storage,
            dir: dir.to_string(),
            records: RwLock::new(records),
            writer: Mutex::new(()),
        }
    }

    pub async fn get(&self, file_name: &str) -> Option<IntegrityRecord> {
        self.records.read().await.get(file_name).cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Hash of the cached file `file_name`, recomputed when the file changed
    /// since it was last recorded.
    pub async fn hash_of(&self, file_name: &str) -> Result<String, StorageError> {
        let path = storage::join(&self.dir, file_name);
        let stat = self.storage.stat(&path).await?;
        if let Some(record) = self.records.read().await.get(file_name) {
            if record.matches(&stat) {
                return Ok(record.hash.clone());
            }
        }

        let _guard = self.writer.lock().await;
        // Another writer may have refreshed the record while we waited.
        let stat = self.storage.stat(&path).await?;
        if let Some(record) = self.records.read().await.get(file_name) {
            if record.matches(&stat) {
                return Ok(record.hash.clone());
            }
        }

        log::debug!("Hashing cached archive {}", path);
        let data = self.storage.read(&path).await?;
        let hash = hash_bytes(&data);
        let record = IntegrityRecord::new(&path, hash.clone(), &stat);
        self.records.write().await.insert(file_name.to_string(), record);
        self.persist().await;
        Ok(hash)
    }

    /// Store the hash of a file that was just written to the cache.
    pub async fn record(&self, file_name: &str, hash: &str) -> Result<(), StorageError> {
        let path = storage::join(&self.dir, file_name);
        let _guard = self.writer.lock().await;
        let stat = self.storage.stat(&path).await?;
        let record = IntegrityRecord::new(&path, hash.to_string(), &stat);
        self.records.write().await.insert(file_name.to_string(), record);
        self.persist().await;
        Ok(())
    }

    pub async fn forget(&self, file_name: &str) {
        let _guard = self.writer.lock().await;
        if self.records.write().await.remove(file_name).is_some() {
            self.persist().await;
        }
    }

    /// Write the sidecar. Callers hold the writer lock. Failures only cost a
    /// re-hash later, so they are logged and not returned.
    async fn persist(&self) {
        let data = {
            let records = self.records.read().await;
            match serde_json::to_vec_pretty(&*records) {
                Ok(data) => data,
                Err(e) => {
                    log::warn!("Failed to serialize integrity index: {}", e);
                    return;
                }
            }
        };
        let path = storage::join(&self.dir, INTEGRITY_FILE);
        if let Err(e) = self.storage.write(&path, &data).await {
            log::warn!("Failed to write integrity index {}: {}", path, e);
        }
    }
}
