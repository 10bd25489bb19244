use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{MetadataProvider, PackageVersions, RegistryStore};
use crate::error::ProviderError;
use crate::types::{PackageReference, VersionConstraint};

/// Records every successful response in a [`RegistryStore`] and answers from
/// the store when the wrapped provider fails.
pub struct RegistryBackedProvider {
    inner: Arc<dyn MetadataProvider>,
    store: Arc<dyn RegistryStore>,
}

impl RegistryBackedProvider {
    pub fn new(inner: Arc<dyn MetadataProvider>, store: Arc<dyn RegistryStore>) -> Self {
        Self { inner, store }
    }

    async fn from_store(
        &self,
        constraints: &BTreeMap<PackageReference, VersionConstraint>,
    ) -> Result<Option<Vec<PackageVersions>>, ProviderError> {
        let mut packages = Vec::with_capacity(constraints.len());
        for reference in constraints.keys() {
            match self.store.get(reference).await? {
                Some(versions) => packages.push(PackageVersions {
                    reference: reference.clone(),
                    versions,
                }),
                None => return Ok(None),
            }
        }
        Ok(Some(packages))
    }
}

#[async_trait]
impl MetadataProvider for RegistryBackedProvider {
    async fn resolve_dependencies(
        &self,
        constraints: &BTreeMap<PackageReference, VersionConstraint>,
    ) -> Result<Vec<PackageVersions>, ProviderError> {
        match self.inner.resolve_dependencies(constraints).await {
            Ok(packages) => {
                for package in &packages {
                    let stored = self
                        .store
                        .put(&package.reference, package.versions.clone())
                        .await;
                    if let Err(e) = stored {
                        log::warn!("Failed to store metadata for {}: {}", package.reference, e);
                    }
                }
                Ok(packages)
            }
            Err(e) => match self.from_store(constraints).await {
                Ok(Some(packages)) => {
                    log::warn!("Metadata source failed ({}), answering from registry store", e);
                    Ok(packages)
                }
                Ok(None) => Err(e),
                Err(store_err) => {
                    log::warn!("Registry store lookup failed: {}", store_err);
                    Err(e)
                }
            },
        }
    }

    async fn display_name(&self, reference: &str) -> Result<String, ProviderError> {
        self.inner.display_name(reference).await
    }
}
