//! Keyed store of downloaded archives.
//!
//! Archives live under `downloadCache/<cacheKey>` on the cache's own storage
//! backend. The cache owns the [`IntegrityIndex`] and the
//! [`OfflinePackageIndex`]; both are loaded by [`ContentCache::open`] and
//! shared with providers and the orchestrator through an `Arc<ContentCache>`.

pub mod download;
pub mod integrity;
pub mod offline;

use chrono::{DateTime, Utc};
use reqwest::Client;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{SyncConfig, ARCHIVE_EXTENSION, DOWNLOAD_CACHE_DIR, PARTIAL_EXTENSION};
use crate::error::{CacheError, StorageError};
use crate::progress::ProgressObserver;
use crate::storage::{self, LocalStorage, StorageBackend};

pub use download::{download_to_storage, Downloaded, RetryPolicy};
pub use integrity::{IntegrityIndex, IntegrityRecord};
pub use offline::{CachedArchive, OfflineIndexEntry, OfflinePackageIndex};

/// Scheme of links that point into the cache itself; they cannot be downloaded.
pub const CACHE_SCHEME: &str = "cache://";

/// Lowercase hex SHA-256 of `data`.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

pub fn hashes_match(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub cache_key: String,
    pub content_hash: String,
    pub size_bytes: u64,
    pub stored_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct FetchedArchive {
    pub entry: CacheEntry,
    pub bytes: Vec<u8>,
    /// False when an existing artifact was reused.
    pub downloaded: bool,
}

pub struct ContentCache {
    storage: Arc<dyn StorageBackend>,
    client: Client,
    retry: RetryPolicy,
    integrity: IntegrityIndex,
    offline: OfflinePackageIndex,
}

impl ContentCache {
    /// Open the cache at `config.cache_dir` on the local disk.
    pub async fn open(config: &SyncConfig) -> Result<Self, CacheError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|source| CacheError::Transport {
                url: String::new(),
                source,
            })?;
        let retry = RetryPolicy {
            retries: config.download_retries,
            delay: Duration::from_millis(config.retry_delay_ms),
        };
        let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(&config.cache_dir));
        Self::with_storage(storage, client, retry).await
    }

    /// Open a cache rooted at `storage`, loading the integrity sidecar and
    /// scanning every cached archive.
    pub async fn with_storage(
        storage: Arc<dyn StorageBackend>,
        client: Client,
        retry: RetryPolicy,
    ) -> Result<Self, CacheError> {
        storage
            .mkdir_all(DOWNLOAD_CACHE_DIR)
            .await
            .map_err(|source| CacheError::Storage {
                cache_key: DOWNLOAD_CACHE_DIR.to_string(),
                source,
            })?;
        let integrity = IntegrityIndex::load(storage.clone(), DOWNLOAD_CACHE_DIR).await;
        let offline = OfflinePackageIndex::new();
        offline.rebuild(storage.as_ref(), DOWNLOAD_CACHE_DIR).await;
        Ok(Self {
            storage,
            client,
            retry,
            integrity,
            offline,
        })
    }

    pub fn cache_key(reference: &str, version: &str) -> String {
        format!("{}_{}{}", reference, version, ARCHIVE_EXTENSION)
    }

    pub fn integrity(&self) -> &IntegrityIndex {
        &self.integrity
    }

    pub fn offline_index(&self) -> &OfflinePackageIndex {
        &self.offline
    }

    fn path_of(cache_key: &str) -> String {
        storage::join(DOWNLOAD_CACHE_DIR, cache_key)
    }

    /// Describe a cached artifact, if present.
    pub async fn entry(&self, cache_key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let path = Self::path_of(cache_key);
        let storage_err = |source| CacheError::Storage {
            cache_key: cache_key.to_string(),
            source,
        };
        let stat = match self.storage.stat(&path).await {
            Ok(stat) => stat,
            Err(e) if self.storage.is_not_exist(&e) => return Ok(None),
            Err(e) => return Err(storage_err(e)),
        };
        let content_hash = self.integrity.hash_of(cache_key).await.map_err(storage_err)?;
        Ok(Some(CacheEntry {
            cache_key: cache_key.to_string(),
            content_hash,
            size_bytes: stat.size,
            stored_at: stat.modified.map(DateTime::<Utc>::from),
        }))
    }

    /// Return the archive stored under `cache_key` if its hash matches
    /// `expected_hash` (or `expected_hash` is empty), otherwise download it
    /// from `url` and replace whatever was stored.
    pub async fn fetch_or_reuse(
        &self,
        cache_key: &str,
        expected_hash: &str,
        url: &str,
        observer: &dyn ProgressObserver,
    ) -> Result<FetchedArchive, CacheError> {
        let storage_err = |source: StorageError| CacheError::Storage {
            cache_key: cache_key.to_string(),
            source,
        };

        if let Some(entry) = self.entry(cache_key).await? {
            if expected_hash.is_empty() || hashes_match(&entry.content_hash, expected_hash) {
                log::debug!("Reusing cached archive {}", cache_key);
                let bytes = self
                    .storage
                    .read(&Self::path_of(cache_key))
                    .await
                    .map_err(storage_err)?;
                return Ok(FetchedArchive {
                    entry,
                    bytes,
                    downloaded: false,
                });
            }
            log::info!(
                "Cached archive {} is stale ({} != {}), replacing",
                cache_key,
                entry.content_hash,
                expected_hash
            );
            self.discard(cache_key).await?;
        }

        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(CacheError::UnsupportedSource {
                url: url.to_string(),
            });
        }

        let path = Self::path_of(cache_key);
        let partial = format!("{}{}", path, PARTIAL_EXTENSION);
        let downloaded = download_to_storage(
            &self.client,
            url,
            self.storage.as_ref(),
            &partial,
            observer,
            self.retry,
        )
        .await?;

        if !expected_hash.is_empty() && !hashes_match(&downloaded.hash, expected_hash) {
            if let Err(e) = self.storage.remove(&partial).await {
                log::warn!("Failed to remove rejected download {}: {}", partial, e);
            }
            return Err(CacheError::HashMismatch {
                cache_key: cache_key.to_string(),
                expected: expected_hash.to_string(),
                actual: downloaded.hash,
            });
        }

        self.storage
            .rename(&partial, &path)
            .await
            .map_err(storage_err)?;
        self.integrity
            .record(cache_key, &downloaded.hash)
            .await
            .map_err(storage_err)?;

        let bytes = self.storage.read(&path).await.map_err(storage_err)?;
        if let Err(e) = self.offline.add_archive(cache_key, &bytes).await {
            log::warn!("Downloaded archive {} has no usable descriptor: {:#}", cache_key, e);
        }
        let stored_at = self
            .storage
            .stat(&path)
            .await
            .ok()
            .and_then(|stat| stat.modified)
            .map(DateTime::<Utc>::from);

        Ok(FetchedArchive {
            entry: CacheEntry {
                cache_key: cache_key.to_string(),
                content_hash: downloaded.hash,
                size_bytes: downloaded.size,
                stored_at,
            },
            bytes,
            downloaded: true,
        })
    }

    /// Delete a cached artifact and everything derived from it.
    pub async fn discard(&self, cache_key: &str) -> Result<(), CacheError> {
        let path = Self::path_of(cache_key);
        match self.storage.remove(&path).await {
            Ok(()) => {}
            Err(e) if self.storage.is_not_exist(&e) => {}
            Err(source) => {
                return Err(CacheError::Storage {
                    cache_key: cache_key.to_string(),
                    source,
                })
            }
        }
        self.integrity.forget(cache_key).await;
        self.offline.remove_archive(cache_key).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::offline::tests::build_archive;
    use super::*;
    use crate::progress::SilentObserver;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn quick() -> RetryPolicy {
        RetryPolicy {
            retries: 3,
            delay: Duration::from_millis(1),
        }
    }

    async fn open(root: &std::path::Path) -> ContentCache {
        let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(root));
        ContentCache::with_storage(storage, Client::new(), quick())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn matching_artifact_is_reused_without_network() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"fresh".to_vec()))
            .expect(0)
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let archive = build_archive("Foo", "1.0.0", &[], &[]);
        std::fs::create_dir_all(tmp.path().join("downloadCache")).unwrap();
        std::fs::write(tmp.path().join("downloadCache/Foo_1.0.0.smod"), &archive).unwrap();

        let cache = open(tmp.path()).await;
        let url = format!("{}/Foo.smod", server.uri());
        let fetched = cache
            .fetch_or_reuse("Foo_1.0.0.smod", &hash_bytes(&archive), &url, &SilentObserver)
            .await
            .unwrap();

        assert!(!fetched.downloaded);
        assert_eq!(fetched.bytes, archive);
        assert_eq!(fetched.entry.size_bytes, archive.len() as u64);
    }

    #[tokio::test]
    async fn stale_artifact_is_replaced_with_one_download() {
        let fresh = build_archive("Foo", "1.0.0", &[("SML", "^3.0.0")], &[]);
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/Foo.smod"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(fresh.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("downloadCache")).unwrap();
        std::fs::write(tmp.path().join("downloadCache/Foo_1.0.0.smod"), b"old contents").unwrap();

        let cache = open(tmp.path()).await;
        let url = format!("{}/Foo.smod", server.uri());
        let fetched = cache
            .fetch_or_reuse("Foo_1.0.0.smod", &hash_bytes(&fresh), &url, &SilentObserver)
            .await
            .unwrap();

        assert!(fetched.downloaded);
        let on_disk = std::fs::read(tmp.path().join("downloadCache/Foo_1.0.0.smod")).unwrap();
        assert_eq!(on_disk, fresh);
        assert!(!tmp.path().join("downloadCache/Foo_1.0.0.smod.part").exists());

        let names: Vec<_> = std::fs::read_dir(tmp.path().join("downloadCache"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .filter(|n| n.ends_with(".smod") || n.ends_with(".part"))
            .collect();
        assert_eq!(names, vec!["Foo_1.0.0.smod".to_string()]);

        assert_eq!(
            cache.integrity().get("Foo_1.0.0.smod").await.unwrap().hash,
            hash_bytes(&fresh)
        );
        assert_eq!(cache.offline_index().archives("Foo").await[0].dependencies.len(), 1);
    }

    #[tokio::test]
    async fn failed_download_leaves_no_cache_entry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let cache = open(tmp.path()).await;
        let url = format!("{}/Missing.smod", server.uri());
        let err = cache
            .fetch_or_reuse("Missing_1.0.0.smod", "abc", &url, &SilentObserver)
            .await
            .unwrap_err();

        assert!(matches!(err, CacheError::HttpStatus { status: 404, .. }));
        assert!(cache.entry("Missing_1.0.0.smod").await.unwrap().is_none());
        assert!(!tmp.path().join("downloadCache/Missing_1.0.0.smod.part").exists());
    }

    #[tokio::test]
    async fn wrong_hash_is_rejected_and_discarded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"payload".to_vec()))
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let cache = open(tmp.path()).await;
        let url = format!("{}/Bad.smod", server.uri());
        let err = cache
            .fetch_or_reuse("Bad_1.0.0.smod", "deadbeef", &url, &SilentObserver)
            .await
            .unwrap_err();

        assert!(matches!(err, CacheError::HashMismatch { .. }));
        assert!(cache.entry("Bad_1.0.0.smod").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cache_links_cannot_be_downloaded() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open(tmp.path()).await;
        let err = cache
            .fetch_or_reuse("Gone_1.0.0.smod", "", "cache://Gone_1.0.0.smod", &SilentObserver)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::UnsupportedSource { .. }));
    }
}
