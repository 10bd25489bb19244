use crate::cache::hashes_match;
use crate::config::SyncConfig;
use crate::lockfile::Lockfile;
use crate::storage::StorageBackend;
use crate::types::{PackageReference, TargetPlatform};

use super::extract::read_marker;

/// A package whose archive has to be (re)materialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageFetch {
    pub reference: PackageReference,
    pub version: String,
    pub link: String,
    pub hash: String,
}

/// Work needed to move an installation from one lockfile to another.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    pub remove: Vec<PackageReference>,
    pub fetch: Vec<PackageFetch>,
    pub unchanged: Vec<PackageReference>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.fetch.is_empty()
    }
}

/// Compare `old` and `new` for `platform`.
///
/// Entries without a target for the platform are managed by someone else:
/// they are never removed nor fetched. A package is left alone only when the
/// marker in its directory records the hash `new` asks for, so a directory
/// deleted or modified behind our back is repaired.
pub async fn plan(
    storage: &dyn StorageBackend,
    config: &SyncConfig,
    old: &Lockfile,
    new: &Lockfile,
    platform: TargetPlatform,
) -> SyncPlan {
    let mut result = SyncPlan::default();

    for (reference, locked) in &old.mods {
        if new.get(reference).is_some() || locked.target(platform).is_none() {
            continue;
        }
        result.remove.push(reference.clone());
    }

    for (reference, locked) in &new.mods {
        let Some(target) = locked.target(platform) else {
            result.unchanged.push(reference.clone());
            continue;
        };
        let materialized = read_marker(storage, &config.mod_dir(reference)).await;
        match materialized {
            Some(marker) if hashes_match(&marker.hash, &target.hash) => {
                result.unchanged.push(reference.clone());
            }
            _ => result.fetch.push(PackageFetch {
                reference: reference.clone(),
                version: locked.version.clone(),
                link: target.link.clone(),
                hash: target.hash.clone(),
            }),
        }
    }

    log::debug!(
        "Plan for {}: remove {:?}, fetch {:?}, unchanged {:?}",
        platform.target_name(),
        result.remove,
        result.fetch.iter().map(|f| &f.reference).collect::<Vec<_>>(),
        result.unchanged
    );
    result
}
