use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{MetadataProvider, PackageVersions};
use crate::cache::{ContentCache, CACHE_SCHEME};
use crate::error::ProviderError;
use crate::types::{
    PackageReference, ResolvedVersion, TargetPlatform, VersionConstraint, VersionTarget,
};

/// Serves metadata from archives already in the content cache.
///
/// Every cached archive becomes one version available on all platforms. Its
/// links point back into the cache, so installing from this provider never
/// touches the network.
pub struct OfflineProvider {
    cache: Arc<ContentCache>,
}

impl OfflineProvider {
    pub fn new(cache: Arc<ContentCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl MetadataProvider for OfflineProvider {
    async fn resolve_dependencies(
        &self,
        constraints: &BTreeMap<PackageReference, VersionConstraint>,
    ) -> Result<Vec<PackageVersions>, ProviderError> {
        let mut packages = Vec::new();
        for reference in constraints.keys() {
            let archives = self.cache.offline_index().archives(reference).await;
            if archives.is_empty() {
                continue;
            }
            let mut versions = Vec::with_capacity(archives.len());
            for archive in archives {
                let hash = match self.cache.integrity().hash_of(&archive.cache_key).await {
                    Ok(hash) => hash,
                    Err(e) => {
                        log::warn!("Skipping cached archive {}: {}", archive.cache_key, e);
                        continue;
                    }
                };
                let target = VersionTarget {
                    link: format!("{}{}", CACHE_SCHEME, archive.cache_key),
                    hash,
                    size: archive.size,
                };
                versions.push(ResolvedVersion {
                    id: archive.cache_key.clone(),
                    version: archive.version,
                    dependencies: archive.dependencies,
                    targets: TargetPlatform::ALL
                        .iter()
                        .map(|p| (p.target_name().to_string(), target.clone()))
                        .collect(),
                });
            }
            packages.push(PackageVersions {
                reference: reference.clone(),
                versions,
            });
        }
        Ok(packages)
    }

    async fn display_name(&self, reference: &str) -> Result<String, ProviderError> {
        self.cache
            .offline_index()
            .entry(reference)
            .await
            .map(|entry| entry.display_name)
            .ok_or_else(|| ProviderError::UnknownPackage(reference.to_string()))
    }
}
