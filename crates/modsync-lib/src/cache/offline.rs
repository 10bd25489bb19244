//! Package metadata recovered from cached archives.
//!
//! Each archive carries a `<Reference>.uplugin` descriptor at its root. The
//! index keeps every archive it has seen and reports, per package, the entry
//! of the highest version (the first archive seen wins ties).

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use tokio::sync::RwLock;
use zip::ZipArchive;

use crate::config::{ARCHIVE_EXTENSION, ICON_PATH};
use crate::storage::{self, StorageBackend};
use crate::types::{validate_reference, Dependency, PackageReference};

const MANIFEST_EXTENSION: &str = ".uplugin";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineIndexEntry {
    pub package_reference: PackageReference,
    pub display_name: String,
    pub author: String,
    /// `data:image/png;base64,...` URL, when the archive ships an icon.
    pub icon: Option<String>,
    pub latest_version: Version,
}

/// One cached archive and the descriptor read from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedArchive {
    pub cache_key: String,
    pub reference: PackageReference,
    pub display_name: String,
    pub author: String,
    pub icon: Option<String>,
    pub version: Version,
    pub dependencies: Vec<Dependency>,
    pub size: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PluginDescriptor {
    friendly_name: Option<String>,
    created_by: Option<String>,
    sem_version: Option<String>,
    version_name: Option<String>,
    #[serde(default)]
    plugins: Vec<PluginReference>,
}

#[derive(Deserialize)]
struct PluginReference {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "SemVersion")]
    sem_version: Option<String>,
    #[serde(rename = "bOptional", default)]
    optional: bool,
}

/// Read the descriptor of an archive held in memory.
pub fn read_archive(cache_key: &str, data: &[u8]) -> Result<CachedArchive> {
    let mut archive = ZipArchive::new(Cursor::new(data))
        .with_context(|| format!("Open archive {}", cache_key))?;

    let manifest_name = archive
        .file_names()
        .find(|name| !name.contains('/') && name.ends_with(MANIFEST_EXTENSION))
        .map(str::to_string)
        .ok_or_else(|| {
            anyhow!("No {} descriptor at the root of {}", MANIFEST_EXTENSION, cache_key)
        })?;
    let reference = manifest_name
        .strip_suffix(MANIFEST_EXTENSION)
        .unwrap_or(&manifest_name)
        .to_string();
    validate_reference(&reference)
        .with_context(|| format!("Descriptor {} in {}", manifest_name, cache_key))?;

    let mut content = String::new();
    archive
        .by_name(&manifest_name)
        .with_context(|| format!("Read {} in {}", manifest_name, cache_key))?
        .read_to_string(&mut content)
        .with_context(|| format!("Decode {} in {}", manifest_name, cache_key))?;
    let descriptor: PluginDescriptor = serde_json::from_str(content.trim_start_matches('\u{feff}'))
        .with_context(|| format!("Parse {} in {}", manifest_name, cache_key))?;

    let raw_version = descriptor
        .sem_version
        .or(descriptor.version_name)
        .ok_or_else(|| anyhow!("{} declares no version", manifest_name))?;
    let version = Version::parse(raw_version.trim())
        .with_context(|| format!("Invalid version {:?} in {}", raw_version, manifest_name))?;

    let dependencies = descriptor
        .plugins
        .into_iter()
        .filter_map(|plugin| {
            // Engine plugins carry no version and are not packages.
            let constraint = plugin.sem_version?;
            Some(Dependency {
                reference: plugin.name,
                constraint,
                optional: plugin.optional,
            })
        })
        .collect();

    let icon = match archive.by_name(ICON_PATH) {
        Ok(mut file) => {
            let mut bytes = Vec::new();
            file.read_to_end(&mut bytes)
                .with_context(|| format!("Read icon in {}", cache_key))?;
            Some(format!(
                "data:image/png;base64,{}",
                base64::engine::general_purpose::STANDARD.encode(bytes)
            ))
        }
        Err(_) => None,
    };

    Ok(CachedArchive {
        cache_key: cache_key.to_string(),
        display_name: descriptor.friendly_name.unwrap_or_else(|| reference.clone()),
        author: descriptor.created_by.unwrap_or_default(),
        reference,
        icon,
        version,
        dependencies,
        size: data.len() as u64,
    })
}

#[derive(Default)]
pub struct OfflinePackageIndex {
    archives: RwLock<BTreeMap<PackageReference, Vec<CachedArchive>>>,
}

impl OfflinePackageIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the index with the archives found in `dir`. Archives that
    /// cannot be read are skipped.
    pub async fn rebuild(&self, storage: &dyn StorageBackend, dir: &str) {
        let mut entries = match storage.list_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if storage.is_not_exist(&e) => Vec::new(),
            Err(e) => {
                log::warn!("Failed to list cache directory {}: {}", dir, e);
                Vec::new()
            }
        };
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        let mut scanned = BTreeMap::<PackageReference, Vec<CachedArchive>>::new();
        for entry in entries {
            if entry.is_dir || !entry.name.ends_with(ARCHIVE_EXTENSION) {
                continue;
            }
            let path = storage::join(dir, &entry.name);
            let data = match storage.read(&path).await {
                Ok(data) => data,
                Err(e) => {
                    log::warn!("Skipping unreadable cached archive {}: {}", path, e);
                    continue;
                }
            };
            match read_archive(&entry.name, &data) {
                Ok(archive) => scanned
                    .entry(archive.reference.clone())
                    .or_default()
                    .push(archive),
                Err(e) => log::warn!("Skipping cached archive {}: {:#}", path, e),
            }
        }

        let count: usize = scanned.values().map(Vec::len).sum();
        log::info!(
            "Offline index built: {} package(s) from {} archive(s)",
            scanned.len(),
            count
        );
        *self.archives.write().await = scanned;
    }

    /// Add one archive that was just stored under `cache_key`.
    pub async fn add_archive(&self, cache_key: &str, data: &[u8]) -> Result<()> {
        let archive = read_archive(cache_key, data)?;
        log::debug!(
            "Offline index: {} {} from {}",
            archive.reference,
            archive.version,
            cache_key
        );
        let mut archives = self.archives.write().await;
        let list = archives.entry(archive.reference.clone()).or_default();
        match list.iter_mut().find(|a| a.cache_key == cache_key) {
            Some(existing) => *existing = archive,
            None => list.push(archive),
        }
        Ok(())
    }

    pub async fn remove_archive(&self, cache_key: &str) {
        let mut archives = self.archives.write().await;
        for list in archives.values_mut() {
            list.retain(|a| a.cache_key != cache_key);
        }
        archives.retain(|_, list| !list.is_empty());
    }

    pub async fn entry(&self, reference: &str) -> Option<OfflineIndexEntry> {
        self.archives
            .read()
            .await
            .get(reference)
            .and_then(|list| latest_entry(list))
    }

    pub async fn entries(&self) -> Vec<OfflineIndexEntry> {
        self.archives
            .read()
            .await
            .values()
            .filter_map(|list| latest_entry(list))
            .collect()
    }

    /// Every cached archive of `reference`, in the order they were seen.
    pub async fn archives(&self, reference: &str) -> Vec<CachedArchive> {
        self.archives
            .read()
            .await
            .get(reference)
            .cloned()
            .unwrap_or_default()
    }
}

fn latest_entry(list: &[CachedArchive]) -> Option<OfflineIndexEntry> {
    let mut latest: Option<&CachedArchive> = None;
    for archive in list {
        match latest {
            Some(current) if archive.version <= current.version => {}
            _ => latest = Some(archive),
        }
    }
    latest.map(|archive| OfflineIndexEntry {
        package_reference: archive.reference.clone(),
        display_name: archive.display_name.clone(),
        author: archive.author.clone(),
        icon: archive.icon.clone(),
        latest_version: archive.version.clone(),
    })
}
