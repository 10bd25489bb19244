use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::{Cursor, Read};
use std::path::Component;
use zip::ZipArchive;

use crate::cache::hashes_match;
use crate::config::EXTRACT_MARKER_FILE;
use crate::error::{ExtractionError, StorageError};
use crate::progress::ProgressObserver;
use crate::storage::{self, StorageBackend};

/// Upper bound on the buffer reserved from a member's declared size.
const MAX_PREALLOCATION: u64 = 1 << 20;

/// Written into a package directory after every archive member, recording
/// which archive it was extracted from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractMarker {
    pub hash: String,
    pub version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractOutcome {
    /// The directory already held this archive; nothing was written.
    Skipped,
    Extracted { files: usize, bytes: u64 },
}

/// Marker of the archive currently extracted into `mod_dir`, if any.
pub async fn read_marker(storage: &dyn StorageBackend, mod_dir: &str) -> Option<ExtractMarker> {
    let path = storage::join(mod_dir, EXTRACT_MARKER_FILE);
    match storage.read(&path).await {
        Ok(data) => match serde_json::from_slice(&data) {
            Ok(marker) => Some(marker),
            Err(e) => {
                log::warn!("Ignoring unreadable extraction marker {}: {}", path, e);
                None
            }
        },
        Err(e) => {
            if !storage.is_not_exist(&e) {
                log::warn!("Failed to read extraction marker {}: {}", path, e);
            }
            None
        }
    }
}

struct Member {
    index: usize,
    path: String,
    is_dir: bool,
    size: u64,
}

fn relative_path(path: &std::path::Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Unpack `archive` into `mod_dir`, replacing whatever was there.
///
/// When the marker in `mod_dir` already records `hash` the call returns
/// [`ExtractOutcome::Skipped`] without writing anything. The archive is
/// validated before the existing directory is touched.
pub async fn extract_archive(
    storage: &dyn StorageBackend,
    reference: &str,
    version: &str,
    archive: &[u8],
    hash: &str,
    mod_dir: &str,
    observer: &dyn ProgressObserver,
) -> Result<ExtractOutcome, ExtractionError> {
    if let Some(marker) = read_marker(storage, mod_dir).await {
        if hashes_match(&marker.hash, hash) {
            log::debug!("{} already extracted at {}", reference, mod_dir);
            return Ok(ExtractOutcome::Skipped);
        }
    }

    let corrupt = |reason: String| ExtractionError::CorruptArchive {
        reference: reference.to_string(),
        reason,
    };
    let write_err = |path: &str, source: StorageError| ExtractionError::Storage {
        path: path.to_string(),
        source,
    };

    let mut zip = ZipArchive::new(Cursor::new(archive)).map_err(|e| corrupt(e.to_string()))?;
    let mut members = Vec::with_capacity(zip.len());
    for index in 0..zip.len() {
        let file = zip.by_index(index).map_err(|e| corrupt(e.to_string()))?;
        let path = file
            .enclosed_name()
            .map(|p| relative_path(&p))
            .filter(|p| !p.is_empty());
        let Some(path) = path else {
            if file.is_dir() && file.name().trim_matches('/').is_empty() {
                continue;
            }
            return Err(ExtractionError::UnsafePath {
                reference: reference.to_string(),
                entry: file.name().to_string(),
            });
        };
        members.push(Member {
            index,
            path,
            is_dir: file.is_dir(),
            size: file.size(),
        });
    }
    let total: u64 = members.iter().filter(|m| !m.is_dir).map(|m| m.size).sum();

    match storage.remove(mod_dir).await {
        Ok(()) => {}
        Err(e) if storage.is_not_exist(&e) => {}
        Err(e) => return Err(write_err(mod_dir, e)),
    }
    storage
        .mkdir_all(mod_dir)
        .await
        .map_err(|e| write_err(mod_dir, e))?;

    let mut created: HashSet<String> = HashSet::new();
    created.insert(mod_dir.to_string());
    let mut written: u64 = 0;
    let mut files = 0;

    for member in &members {
        let target = storage::join(mod_dir, &member.path);
        if member.is_dir {
            if created.insert(target.clone()) {
                storage
                    .mkdir_all(&target)
                    .await
                    .map_err(|e| write_err(&target, e))?;
            }
            continue;
        }

        let parent = storage::parent(&target).to_string();
        if !created.contains(&parent) {
            storage
                .mkdir_all(&parent)
                .await
                .map_err(|e| write_err(&parent, e))?;
            created.insert(parent);
        }

        let data = {
            let mut file = zip
                .by_index(member.index)
                .map_err(|e| corrupt(e.to_string()))?;
            let mut buf = Vec::with_capacity(member.size.min(MAX_PREALLOCATION) as usize);
            file.read_to_end(&mut buf)
                .map_err(|e| corrupt(format!("{}: {}", member.path, e)))?;
            buf
        };
        storage
            .write(&target, &data)
            .await
            .map_err(|e| write_err(&target, e))?;

        written += data.len() as u64;
        files += 1;
        observer.update_bytes(written, Some(total));
    }

    let marker = ExtractMarker {
        hash: hash.to_string(),
        version: version.to_string(),
    };
    let marker_path = storage::join(mod_dir, EXTRACT_MARKER_FILE);
    let marker_data = serde_json::to_vec(&marker).map_err(|e| corrupt(e.to_string()))?;
    storage
        .write(&marker_path, &marker_data)
        .await
        .map_err(|e| write_err(&marker_path, e))?;

    log::debug!(
        "Extracted {} ({} files, {} bytes) into {}",
        reference,
        files,
        written,
        mod_dir
    );
    Ok(ExtractOutcome::Extracted {
        files,
        bytes: written,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::offline::tests::build_archive;
    use crate::progress::SilentObserver;
    use crate::storage::{LocalStorage, RecordingStorage};
    use std::io::Write;
    use std::sync::Arc;
    use zip::write::SimpleFileOptions;

    fn recording(root: &std::path::Path) -> RecordingStorage {
        RecordingStorage::new(Arc::new(LocalStorage::new(root)))
    }

    #[tokio::test]
    async fn second_extraction_of_same_hash_writes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = recording(tmp.path());
        let archive = build_archive("Foo", "1.0.0", &[], &[("Binaries/Win64/Foo.dll", b"dll")]);
        let dir = "FactoryGame/Mods/Foo";

        let first = extract_archive(&storage, "Foo", "1.0.0", &archive, "h1", dir, &SilentObserver)
            .await
            .unwrap();
        assert!(matches!(first, ExtractOutcome::Extracted { files: 2, .. }));
        assert!(storage.write_count() > 0);
        assert_eq!(
            std::fs::read(tmp.path().join("FactoryGame/Mods/Foo/Binaries/Win64/Foo.dll")).unwrap(),
            b"dll"
        );

        storage.clear();
        let second = extract_archive(&storage, "Foo", "1.0.0", &archive, "H1", dir, &SilentObserver)
            .await
            .unwrap();
        assert_eq!(second, ExtractOutcome::Skipped);
        assert_eq!(storage.write_count(), 0);
    }

    #[tokio::test]
    async fn new_hash_replaces_previous_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = recording(tmp.path());
        let dir = "Mods/Foo";
        let old = build_archive("Foo", "1.0.0", &[], &[("old.txt", b"old")]);
        let new = build_archive("Foo", "1.1.0", &[], &[("new.txt", b"new")]);

        extract_archive(&storage, "Foo", "1.0.0", &old, "h1", dir, &SilentObserver)
            .await
            .unwrap();
        extract_archive(&storage, "Foo", "1.1.0", &new, "h2", dir, &SilentObserver)
            .await
            .unwrap();

        assert!(!tmp.path().join("Mods/Foo/old.txt").exists());
        assert!(tmp.path().join("Mods/Foo/new.txt").exists());
        let marker = read_marker(&storage, dir).await.unwrap();
        assert_eq!(marker.hash, "h2");
        assert_eq!(marker.version, "1.1.0");
    }

    #[tokio::test]
    async fn corrupt_archive_keeps_existing_install() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = recording(tmp.path());
        let dir = "Mods/Foo";
        let good = build_archive("Foo", "1.0.0", &[], &[]);
        extract_archive(&storage, "Foo", "1.0.0", &good, "h1", dir, &SilentObserver)
            .await
            .unwrap();

        let err = extract_archive(&storage, "Foo", "1.1.0", b"garbage", "h2", dir, &SilentObserver)
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::CorruptArchive { .. }));
        assert_eq!(read_marker(&storage, dir).await.unwrap().hash, "h1");
    }

    #[tokio::test]
    async fn declared_size_is_not_trusted() {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut buf);
            let options =
                SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
            zip.start_file("big.bin", options).unwrap();
            zip.write_all(b"abc").unwrap();
            zip.finish().unwrap();
        }
        let mut data = buf.into_inner();
        let declared = 0xFFFF_FFF0_u32.to_le_bytes();
        let local = find(&data, b"PK\x03\x04");
        data[local + 22..local + 26].copy_from_slice(&declared);
        let central = find(&data, b"PK\x01\x02");
        data[central + 24..central + 28].copy_from_slice(&declared);

        let tmp = tempfile::tempdir().unwrap();
        let storage = recording(tmp.path());
        let result =
            extract_archive(&storage, "Big", "1.0.0", &data, "h", "Mods/Big", &SilentObserver)
                .await;
        match result {
            Ok(_) => {
                let written = std::fs::read(tmp.path().join("Mods/Big/big.bin")).unwrap();
                assert_eq!(written, b"abc");
            }
            Err(err) => assert!(matches!(err, ExtractionError::CorruptArchive { .. }), "{}", err),
        }
    }

    fn find(data: &[u8], signature: &[u8]) -> usize {
        data.windows(signature.len())
            .position(|w| w == signature)
            .unwrap()
    }

    #[tokio::test]
    async fn entries_escaping_the_directory_are_refused() {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut buf);
            zip.start_file("../evil.txt", SimpleFileOptions::default()).unwrap();
            zip.write_all(b"x").unwrap();
            zip.finish().unwrap();
        }
        let tmp = tempfile::tempdir().unwrap();
        let storage = recording(tmp.path());

        let err = extract_archive(
            &storage,
            "Evil",
            "1.0.0",
            &buf.into_inner(),
            "h",
            "Mods/Evil",
            &SilentObserver,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ExtractionError::UnsafePath { .. }));
        assert_eq!(storage.write_count(), 0);
    }
}
