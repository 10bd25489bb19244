use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use super::{DirEntry, StorageBackend, StorageError, StreamingSink};

/// One call made through a [`RecordingStorage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageOp {
    Exists(String),
    Read(String),
    Write(String),
    Remove(String),
    MkDirAll(String),
    ListDir(String),
    Stat(String),
    Rename(String, String),
    StreamWrite(String),
}

impl StorageOp {
    /// Whether the operation changes stored state.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            StorageOp::Write(_)
                | StorageOp::Remove(_)
                | StorageOp::MkDirAll(_)
                | StorageOp::Rename(_, _)
                | StorageOp::StreamWrite(_)
        )
    }
}

/// Decorator that logs every operation before delegating to the inner backend.
pub struct RecordingStorage {
    inner: Arc<dyn StorageBackend>,
    ops: Mutex<Vec<StorageOp>>,
}

impl RecordingStorage {
    pub fn new(inner: Arc<dyn StorageBackend>) -> Self {
        Self {
            inner,
            ops: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, op: StorageOp) {
        if let Ok(mut ops) = self.ops.lock() {
            ops.push(op);
        }
    }

    pub fn operations(&self) -> Vec<StorageOp> {
        self.ops.lock().map(|ops| ops.clone()).unwrap_or_default()
    }

    pub fn mutations(&self) -> Vec<StorageOp> {
        self.operations()
            .into_iter()
            .filter(StorageOp::is_mutation)
            .collect()
    }

    pub fn write_count(&self) -> usize {
        self.mutations().len()
    }

    pub fn clear(&self) {
        if let Ok(mut ops) = self.ops.lock() {
            ops.clear();
        }
    }
}

#[async_trait]
impl StorageBackend for RecordingStorage {
    fn kind(&self) -> &'static str {
        self.inner.kind()
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        self.record(StorageOp::Exists(path.to_string()));
        self.inner.exists(path).await
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        self.record(StorageOp::Read(path.to_string()));
        self.inner.read(path).await
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        self.record(StorageOp::Write(path.to_string()));
        self.inner.write(path, data).await
    }

    async fn remove(&self, path: &str) -> Result<(), StorageError> {
        self.record(StorageOp::Remove(path.to_string()));
        self.inner.remove(path).await
    }

    async fn mkdir_all(&self, path: &str) -> Result<(), StorageError> {
        self.record(StorageOp::MkDirAll(path.to_string()));
        self.inner.mkdir_all(path).await
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, StorageError> {
        self.record(StorageOp::ListDir(path.to_string()));
        self.inner.list_dir(path).await
    }

    async fn stat(&self, path: &str) -> Result<DirEntry, StorageError> {
        self.record(StorageOp::Stat(path.to_string()));
        self.inner.stat(path).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        self.record(StorageOp::Rename(from.to_string(), to.to_string()));
        self.inner.rename(from, to).await
    }

    async fn open_for_streaming_write(
        &self,
        path: &str,
    ) -> Result<Box<dyn StreamingSink>, StorageError> {
        self.record(StorageOp::StreamWrite(path.to_string()));
        self.inner.open_for_streaming_write(path).await
    }

    fn is_not_exist(&self, err: &StorageError) -> bool {
        self.inner.is_not_exist(err)
    }

    fn is_exist(&self, err: &StorageError) -> bool {
        self.inner.is_exist(err)
    }
}
