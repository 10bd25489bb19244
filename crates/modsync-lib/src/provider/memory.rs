use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use super::{MetadataProvider, PackageVersions, RegistryStore};
use crate::error::ProviderError;
use crate::types::{PackageReference, ResolvedVersion, VersionConstraint};

/// Provider over a fixed, in-process package table.
#[derive(Default)]
pub struct MemoryProvider {
    packages: RwLock<BTreeMap<PackageReference, (String, Vec<ResolvedVersion>)>>,
    calls: AtomicUsize,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_package(
        self,
        reference: impl Into<PackageReference>,
        display_name: impl Into<String>,
        versions: Vec<ResolvedVersion>,
    ) -> Self {
        self.insert(reference, display_name, versions);
        self
    }

    pub fn insert(
        &self,
        reference: impl Into<PackageReference>,
        display_name: impl Into<String>,
        versions: Vec<ResolvedVersion>,
    ) {
        if let Ok(mut packages) = self.packages.write() {
            packages.insert(reference.into(), (display_name.into(), versions));
        }
    }

    /// Number of `resolve_dependencies` calls served.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MetadataProvider for MemoryProvider {
    async fn resolve_dependencies(
        &self,
        constraints: &BTreeMap<PackageReference, VersionConstraint>,
    ) -> Result<Vec<PackageVersions>, ProviderError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let packages = self
            .packages
            .read()
            .map_err(|_| ProviderError::Unavailable("package table is poisoned".to_string()))?;
        Ok(constraints
            .keys()
            .filter_map(|reference| {
                packages.get(reference).map(|(_, versions)| PackageVersions {
                    reference: reference.clone(),
                    versions: versions.clone(),
                })
            })
            .collect())
    }

    async fn display_name(&self, reference: &str) -> Result<String, ProviderError> {
        let packages = self
            .packages
            .read()
            .map_err(|_| ProviderError::Unavailable("package table is poisoned".to_string()))?;
        packages
            .get(reference)
            .map(|(name, _)| name.clone())
            .ok_or_else(|| ProviderError::UnknownPackage(reference.to_string()))
    }
}

#[derive(Default)]
pub struct MemoryRegistryStore {
    entries: RwLock<HashMap<PackageReference, Vec<ResolvedVersion>>>,
}

impl MemoryRegistryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RegistryStore for MemoryRegistryStore {
    async fn put(
        &self,
        reference: &str,
        versions: Vec<ResolvedVersion>,
    ) -> Result<(), ProviderError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| ProviderError::Unavailable("registry store is poisoned".to_string()))?;
        entries.insert(reference.to_string(), versions);
        Ok(())
    }

    async fn get(&self, reference: &str) -> Result<Option<Vec<ResolvedVersion>>, ProviderError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| ProviderError::Unavailable("registry store is poisoned".to_string()))?;
        Ok(entries.get(reference).cloned())
    }
}
