use futures::StreamExt;
use reqwest::Client;
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};

use crate::error::CacheError;
use crate::progress::ProgressObserver;
use crate::storage::StorageBackend;

/// Result of a completed transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Downloaded {
    pub hash: String,
    pub size: u64,
}

/// Retry policy: `retries` attempts in total, attempt `n` waiting `n * delay`
/// before the next one. Client errors (4xx) are not retried.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            delay: Duration::from_millis(1000),
        }
    }
}

fn is_retryable(err: &CacheError) -> bool {
    match err {
        CacheError::HttpStatus { status, .. } => !(400..500).contains(status),
        CacheError::Transport { .. } => true,
        _ => false,
    }
}

/// Stream `url` into `path` on `storage`, hashing the bytes as they pass.
///
/// The file at `path` is removed again if the transfer fails, so callers
/// should point this at a temporary name and rename on success.
pub async fn download_to_storage(
    client: &Client,
    url: &str,
    storage: &dyn StorageBackend,
    path: &str,
    observer: &dyn ProgressObserver,
    policy: RetryPolicy,
) -> Result<Downloaded, CacheError> {
    let attempts = policy.retries.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match download_once(client, url, storage, path, observer).await {
            Ok(downloaded) => return Ok(downloaded),
            Err(e) => {
                if let Err(remove_err) = storage.remove(path).await {
                    if !storage.is_not_exist(&remove_err) {
                        log::warn!("Failed to remove partial download {}: {}", path, remove_err);
                    }
                }
                if attempt >= attempts || !is_retryable(&e) {
                    log::error!("Download of {} failed after {} attempt(s): {}", url, attempt, e);
                    return Err(e);
                }
                log::warn!(
                    "Download failed (attempt {}/{}) : {}. Retrying...",
                    attempt,
                    attempts,
                    e
                );
                tokio::time::sleep(policy.delay * attempt).await;
            }
        }
    }
}

async fn download_once(
    client: &Client,
    url: &str,
    storage: &dyn StorageBackend,
    path: &str,
    observer: &dyn ProgressObserver,
) -> Result<Downloaded, CacheError> {
    let start = Instant::now();
    let transport = |source| CacheError::Transport {
        url: url.to_string(),
        source,
    };
    let storage_err = |source| CacheError::Storage {
        cache_key: path.to_string(),
        source,
    };

    let response = client.get(url).send().await.map_err(transport)?;
    if !response.status().is_success() {
        return Err(CacheError::HttpStatus {
            url: url.to_string(),
            status: response.status().as_u16(),
        });
    }

    let total_size = response.content_length();
    log::debug!("Download size: {:?} bytes", total_size);

    let mut sink = storage
        .open_for_streaming_write(path)
        .await
        .map_err(storage_err)?;
    let mut hasher = Sha256::new();
    let mut downloaded: u64 = 0;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(transport)?;
        sink.write_chunk(&chunk).await.map_err(storage_err)?;
        hasher.update(&chunk);
        downloaded += chunk.len() as u64;
        observer.update_bytes(downloaded, total_size);
    }
    sink.finish().await.map_err(storage_err)?;

    let secs = start.elapsed().as_secs_f64();
    log::info!(
        "Download stats: url={}, size={} bytes, time={:.2}s, throughput={:.2} MB/s",
        url,
        downloaded,
        secs,
        (downloaded as f64 / 1024.0 / 1024.0) / secs.max(0.001)
    );

    Ok(Downloaded {
        hash: format!("{:x}", hasher.finalize()),
        size: downloaded,
    })
}
