use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{MetadataProvider, PackageVersions};
use crate::config::SyncConfig;
use crate::error::ProviderError;
use crate::types::{PackageReference, VersionConstraint};

/// Delegates to the online or the offline provider depending on a flag that
/// can be flipped at runtime.
pub struct MixedProvider {
    online: Arc<dyn MetadataProvider>,
    offline: Arc<dyn MetadataProvider>,
    offline_mode: AtomicBool,
}

impl MixedProvider {
    pub fn new(
        online: Arc<dyn MetadataProvider>,
        offline: Arc<dyn MetadataProvider>,
        offline_mode: bool,
    ) -> Self {
        Self {
            online,
            offline,
            offline_mode: AtomicBool::new(offline_mode),
        }
    }

    /// Start in the mode `config.offline` asks for.
    pub fn from_config(
        online: Arc<dyn MetadataProvider>,
        offline: Arc<dyn MetadataProvider>,
        config: &SyncConfig,
    ) -> Self {
        Self::new(online, offline, config.offline)
    }

    pub fn set_offline(&self, offline: bool) {
        let mode = if offline { "offline" } else { "online" };
        log::info!("Metadata source switched to {}", mode);
        self.offline_mode.store(offline, Ordering::Relaxed);
    }

    pub fn is_offline(&self) -> bool {
        self.offline_mode.load(Ordering::Relaxed)
    }

    fn active(&self) -> &dyn MetadataProvider {
        if self.is_offline() {
            self.offline.as_ref()
        } else {
            self.online.as_ref()
        }
    }
}

#[async_trait]
impl MetadataProvider for MixedProvider {
    async fn resolve_dependencies(
        &self,
        constraints: &BTreeMap<PackageReference, VersionConstraint>,
    ) -> Result<Vec<PackageVersions>, ProviderError> {
        self.active().resolve_dependencies(constraints).await
    }

    async fn display_name(&self, reference: &str) -> Result<String, ProviderError> {
        self.active().display_name(reference).await
    }
}
