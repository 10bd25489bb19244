use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

use super::{DirEntry, StorageBackend, StorageError, StreamingSink};

/// Backend over a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            self.root.clone()
        } else {
            self.root.join(trimmed)
        }
    }
}

fn map_io(path: &str, err: std::io::Error) -> StorageError {
    match err.kind() {
        ErrorKind::NotFound => StorageError::NotFound {
            path: path.to_string(),
        },
        ErrorKind::AlreadyExists => StorageError::AlreadyExists {
            path: path.to_string(),
        },
        _ => StorageError::io(path, err),
    }
}

fn entry_from_metadata(name: String, metadata: &std::fs::Metadata) -> DirEntry {
    DirEntry {
        name,
        is_dir: metadata.is_dir(),
        size: if metadata.is_dir() { 0 } else { metadata.len() },
        modified: metadata.modified().ok(),
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        fs::try_exists(self.resolve(path))
            .await
            .map_err(|e| map_io(path, e))
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        fs::read(self.resolve(path))
            .await
            .map_err(|e| map_io(path, e))
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        fs::write(self.resolve(path), data)
            .await
            .map_err(|e| map_io(path, e))
    }

    async fn remove(&self, path: &str) -> Result<(), StorageError> {
        let full = self.resolve(path);
        let metadata = fs::symlink_metadata(&full)
            .await
            .map_err(|e| map_io(path, e))?;
        let result = if metadata.is_dir() {
            fs::remove_dir_all(&full).await
        } else {
            fs::remove_file(&full).await
        };
        result.map_err(|e| map_io(path, e))
    }

    async fn mkdir_all(&self, path: &str) -> Result<(), StorageError> {
        fs::create_dir_all(self.resolve(path))
            .await
            .map_err(|e| map_io(path, e))
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, StorageError> {
        let mut reader = fs::read_dir(self.resolve(path))
            .await
            .map_err(|e| map_io(path, e))?;
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await.map_err(|e| map_io(path, e))? {
            let metadata = entry.metadata().await.map_err(|e| map_io(path, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            entries.push(entry_from_metadata(name, &metadata));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn stat(&self, path: &str) -> Result<DirEntry, StorageError> {
        let metadata = fs::metadata(self.resolve(path))
            .await
            .map_err(|e| map_io(path, e))?;
        Ok(entry_from_metadata(
            super::file_name(path).to_string(),
            &metadata,
        ))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        fs::rename(self.resolve(from), self.resolve(to))
            .await
            .map_err(|e| map_io(from, e))
    }

    async fn open_for_streaming_write(
        &self,
        path: &str,
    ) -> Result<Box<dyn StreamingSink>, StorageError> {
        let file = File::create(self.resolve(path))
            .await
            .map_err(|e| map_io(path, e))?;
        Ok(Box::new(LocalSink {
            path: path.to_string(),
            file,
        }))
    }

    fn is_not_exist(&self, err: &StorageError) -> bool {
        match err {
            StorageError::NotFound { .. } => true,
            StorageError::Io { source, .. } => source.kind() == ErrorKind::NotFound,
            _ => false,
        }
    }

    fn is_exist(&self, err: &StorageError) -> bool {
        match err {
            StorageError::AlreadyExists { .. } => true,
            StorageError::Io { source, .. } => source.kind() == ErrorKind::AlreadyExists,
            _ => false,
        }
    }
}

struct LocalSink {
    path: String,
    file: File,
}

#[async_trait]
impl StreamingSink for LocalSink {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), StorageError> {
        self.file
            .write_all(chunk)
            .await
            .map_err(|e| map_io(&self.path, e))
    }

    async fn finish(&mut self) -> Result<(), StorageError> {
        self.file.flush().await.map_err(|e| map_io(&self.path, e))?;
        self.file
            .sync_all()
            .await
            .map_err(|e| map_io(&self.path, e))
    }
}
