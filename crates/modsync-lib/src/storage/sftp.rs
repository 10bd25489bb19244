use async_trait::async_trait;

use super::{DirEntry, StorageBackend, StorageError, StreamingSink};

/// Placeholder for SFTP locations. Every operation fails with
/// [`StorageError::NotImplemented`].
#[derive(Debug, Clone)]
pub struct SftpStorage {
    location: String,
}

impl SftpStorage {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
        }
    }

    fn unsupported(&self, operation: &'static str, path: &str) -> StorageError {
        log::error!(
            "SFTP {} requested for {} ({}), which is not supported",
            operation,
            path,
            self.location
        );
        StorageError::NotImplemented {
            backend: "sftp",
            operation,
            path: path.to_string(),
        }
    }
}

#[async_trait]
impl StorageBackend for SftpStorage {
    fn kind(&self) -> &'static str {
        "sftp"
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        Err(self.unsupported("exists", path))
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        Err(self.unsupported("read", path))
    }

    async fn write(&self, path: &str, _data: &[u8]) -> Result<(), StorageError> {
        Err(self.unsupported("write", path))
    }

    async fn remove(&self, path: &str) -> Result<(), StorageError> {
        Err(self.unsupported("remove", path))
    }

    async fn mkdir_all(&self, path: &str) -> Result<(), StorageError> {
        Err(self.unsupported("mkdir_all", path))
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, StorageError> {
        Err(self.unsupported("list_dir", path))
    }

    async fn stat(&self, path: &str) -> Result<DirEntry, StorageError> {
        Err(self.unsupported("stat", path))
    }

    async fn rename(&self, from: &str, _to: &str) -> Result<(), StorageError> {
        Err(self.unsupported("rename", from))
    }

    async fn open_for_streaming_write(
        &self,
        path: &str,
    ) -> Result<Box<dyn StreamingSink>, StorageError> {
        Err(self.unsupported("open_for_streaming_write", path))
    }

    fn is_not_exist(&self, _err: &StorageError) -> bool {
        false
    }

    fn is_exist(&self, _err: &StorageError) -> bool {
        false
    }
}
