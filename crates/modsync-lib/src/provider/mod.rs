//! Sources of package metadata.
//!
//! The resolver only talks to [`MetadataProvider`]. Implementations here
//! cover the in-process and offline cases and compose remote sources with a
//! [`RegistryStore`] fallback; the remote index client itself lives outside
//! this crate.

pub mod memory;
pub mod mixed;
pub mod offline;
pub mod registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ProviderError;
use crate::types::{PackageReference, ResolvedVersion, VersionConstraint};

pub use memory::{MemoryProvider, MemoryRegistryStore};
pub use mixed::MixedProvider;
pub use offline::OfflineProvider;
pub use registry::RegistryBackedProvider;

/// All known versions of one package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageVersions {
    pub reference: PackageReference,
    pub versions: Vec<ResolvedVersion>,
}

#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// Candidate versions for the requested packages. Unknown references are
    /// left out of the response rather than reported as errors.
    async fn resolve_dependencies(
        &self,
        constraints: &BTreeMap<PackageReference, VersionConstraint>,
    ) -> Result<Vec<PackageVersions>, ProviderError>;

    async fn display_name(&self, reference: &str) -> Result<String, ProviderError>;
}

/// Persisted version metadata, keyed by package reference.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    async fn put(
        &self,
        reference: &str,
        versions: Vec<ResolvedVersion>,
    ) -> Result<(), ProviderError>;

    async fn get(&self, reference: &str) -> Result<Option<Vec<ResolvedVersion>>, ProviderError>;
}
