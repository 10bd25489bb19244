//! Record of the packages currently materialized in an installation.
//!
//! Entries absent from the lockfile are not managed by this tool. The file is
//! replaced atomically (write to a temporary name, then rename) and a schema
//! version other than [`LOCKFILE_VERSION`] is refused.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::LockfileError;
use crate::storage::StorageBackend;
use crate::types::{
    validate_reference, PackageReference, ResolvedVersion, TargetName, TargetPlatform,
    VersionConstraint,
};

pub const LOCKFILE_VERSION: i64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedTarget {
    pub hash: String,
    pub link: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedMod {
    pub version: String,
    #[serde(default)]
    pub dependencies: BTreeMap<PackageReference, VersionConstraint>,
    #[serde(default)]
    pub targets: BTreeMap<TargetName, LockedTarget>,
}

impl LockedMod {
    pub fn target(&self, platform: TargetPlatform) -> Option<&LockedTarget> {
        self.targets.get(platform.target_name())
    }
}

impl From<&ResolvedVersion> for LockedMod {
    fn from(resolved: &ResolvedVersion) -> Self {
        Self {
            version: resolved.version.to_string(),
            dependencies: resolved
                .dependencies
                .iter()
                .map(|d| (d.reference.clone(), d.constraint.clone()))
                .collect(),
            targets: resolved
                .targets
                .iter()
                .map(|(name, target)| {
                    (
                        name.clone(),
                        LockedTarget {
                            hash: target.hash.clone(),
                            link: target.link.clone(),
                        },
                    )
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lockfile {
    pub version: i64,
    #[serde(default)]
    pub mods: BTreeMap<PackageReference, LockedMod>,
}

impl Default for Lockfile {
    fn default() -> Self {
        Self::new()
    }
}

/// Only the schema version, read before the full document.
#[derive(Deserialize)]
struct SchemaHeader {
    version: Option<i64>,
}

impl Lockfile {
    pub fn new() -> Self {
        Self {
            version: LOCKFILE_VERSION,
            mods: BTreeMap::new(),
        }
    }

    pub fn from_resolved(resolved: &BTreeMap<PackageReference, ResolvedVersion>) -> Self {
        Self {
            version: LOCKFILE_VERSION,
            mods: resolved
                .iter()
                .map(|(reference, version)| (reference.clone(), LockedMod::from(version)))
                .collect(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Parse a lockfile document; `path` is only used in errors.
    pub fn from_json(path: &str, data: &[u8]) -> Result<Self, LockfileError> {
        let malformed = |source| LockfileError::Malformed {
            path: path.to_string(),
            source,
        };
        let header: SchemaHeader = serde_json::from_slice(data).map_err(malformed)?;
        let version = header.version.unwrap_or(0);
        if version != LOCKFILE_VERSION {
            return Err(LockfileError::UnsupportedVersion {
                path: path.to_string(),
                version,
            });
        }
        let lockfile: Self = serde_json::from_slice(data).map_err(malformed)?;
        if let Some(reference) = lockfile
            .mods
            .keys()
            .find(|reference| validate_reference(reference).is_err())
        {
            return Err(LockfileError::InvalidReference {
                path: path.to_string(),
                reference: reference.clone(),
            });
        }
        Ok(lockfile)
    }

    /// Load from storage. A missing file means nothing is installed yet.
    pub async fn load(
        storage: &dyn StorageBackend,
        path: &str,
    ) -> Result<Option<Self>, LockfileError> {
        match storage.read(path).await {
            Ok(data) => Self::from_json(path, &data).map(Some),
            Err(e) if storage.is_not_exist(&e) => {
                log::debug!("No lockfile at {}", path);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write through a temporary file so a crash never leaves a truncated lockfile.
    pub async fn save(
        &self,
        storage: &dyn StorageBackend,
        path: &str,
    ) -> Result<(), LockfileError> {
        let data = self.to_json().map_err(|source| LockfileError::Malformed {
            path: path.to_string(),
            source,
        })?;
        let parent = crate::storage::parent(path);
        if !parent.is_empty() {
            storage.mkdir_all(parent).await?;
        }
        let tmp_path = format!("{}.tmp", path);
        storage.write(&tmp_path, data.as_bytes()).await?;
        storage.rename(&tmp_path, path).await?;
        log::debug!("Lockfile written: {} ({} mods)", path, self.mods.len());
        Ok(())
    }

    pub fn get(&self, reference: &str) -> Option<&LockedMod> {
        self.mods.get(reference)
    }

    pub fn insert(&mut self, reference: impl Into<PackageReference>, locked: LockedMod) {
        self.mods.insert(reference.into(), locked);
    }

    pub fn remove(&mut self, reference: &str) -> Option<LockedMod> {
        self.mods.remove(reference)
    }

    /// Dependency constraints among entries for `platform` that are not met.
    /// Returns `(dependent, dependency, constraint, installed_version)` tuples.
    pub fn unsatisfied_dependencies(
        &self,
        platform: TargetPlatform,
    ) -> Vec<(PackageReference, PackageReference, VersionConstraint, String)> {
        let mut problems = Vec::new();
        for (reference, locked) in &self.mods {
            if locked.target(platform).is_none() {
                continue;
            }
            for (dependency, constraint) in &locked.dependencies {
                let Some(installed) = self.mods.get(dependency) else {
                    continue;
                };
                if installed.target(platform).is_none() {
                    continue;
                }
                let satisfied = match (
                    semver::VersionReq::parse(constraint),
                    semver::Version::parse(&installed.version),
                ) {
                    (Ok(req), Ok(version)) => req.matches(&version),
                    _ => false,
                };
                if !satisfied {
                    problems.push((
                        reference.clone(),
                        dependency.clone(),
                        constraint.clone(),
                        installed.version.clone(),
                    ));
                }
            }
        }
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStorage;

    fn locked(version: &str, deps: &[(&str, &str)], hash: &str) -> LockedMod {
        let mut targets = BTreeMap::new();
        targets.insert(
            "Windows".to_string(),
            LockedTarget {
                hash: hash.to_string(),
                link: format!("https://example.com/{}.smod", hash),
            },
        );
        LockedMod {
            version: version.to_string(),
            dependencies: deps
                .iter()
                .map(|(r, c)| (r.to_string(), c.to_string()))
                .collect(),
            targets,
        }
    }

    fn sample() -> Lockfile {
        let mut lockfile = Lockfile::new();
        lockfile.insert("SML", locked("3.6.1", &[], "aaa"));
        lockfile.insert("AreaActions", locked("1.2.0", &[("SML", "^3.6.0")], "bbb"));
        lockfile
    }

    #[test]
    fn round_trip_preserves_every_field() {
        let lockfile = sample();
        let json = lockfile.to_json().unwrap();
        let parsed = Lockfile::from_json("mods-lock.json", json.as_bytes()).unwrap();
        assert_eq!(parsed, lockfile);
        assert_eq!(parsed.version, LOCKFILE_VERSION);
    }

    #[test]
    fn unknown_schema_version_is_refused() {
        let data = br#"{"version": 7, "mods": {}}"#;
        let err = Lockfile::from_json("mods-lock.json", data).unwrap_err();
        assert!(matches!(err, LockfileError::UnsupportedVersion { version: 7, .. }));

        let data = br#"{"mods": {}}"#;
        let err = Lockfile::from_json("mods-lock.json", data).unwrap_err();
        assert!(matches!(err, LockfileError::UnsupportedVersion { version: 0, .. }));
    }

    #[test]
    fn malformed_document_is_reported() {
        let err = Lockfile::from_json("mods-lock.json", b"{not json").unwrap_err();
        assert!(matches!(err, LockfileError::Malformed { .. }));
    }

    #[test]
    fn entries_outside_the_mods_directory_are_refused() {
        for reference in ["", ".."] {
            let data = serde_json::json!({
                "version": 1,
                "mods": { reference: { "version": "1.0.0" } },
            });
            let err = Lockfile::from_json("mods-lock.json", data.to_string().as_bytes())
                .unwrap_err();
            assert!(matches!(
                err,
                LockfileError::InvalidReference { reference: ref r, .. } if r == reference
            ));
        }
    }

    #[test]
    fn unsatisfied_dependencies_are_listed() {
        let mut lockfile = sample();
        assert!(lockfile
            .unsatisfied_dependencies(TargetPlatform::Windows)
            .is_empty());

        lockfile.insert("SML", locked("2.0.0", &[], "ccc"));
        let problems = lockfile.unsatisfied_dependencies(TargetPlatform::Windows);
        assert_eq!(problems.len(), 1);
        assert_eq!(problems[0].0, "AreaActions");
        assert_eq!(problems[0].1, "SML");

        // Entries without a target for the platform are not checked.
        assert!(lockfile
            .unsatisfied_dependencies(TargetPlatform::LinuxServer)
            .is_empty());
    }

    #[tokio::test]
    async fn save_then_load_through_storage() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(tmp.path());
        let path = "FactoryGame/Mods/mods-lock.json";

        assert!(Lockfile::load(&storage, path).await.unwrap().is_none());

        let lockfile = sample();
        lockfile.save(&storage, path).await.unwrap();
        assert!(!storage.exists("FactoryGame/Mods/mods-lock.json.tmp").await.unwrap());

        let loaded = Lockfile::load(&storage, path).await.unwrap();
        assert_eq!(loaded, Some(lockfile));
    }
}
