use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ResolutionError;

/// Identifier of a package, unique within a metadata source.
pub type PackageReference = String;

/// Semantic-versioning range such as `>=1.2.3` or `^2.0.0`.
pub type VersionConstraint = String;

/// Name of a download target as used in metadata and the lockfile.
pub type TargetName = String;

/// Parse a constraint for `package`, mapping failures to a resolution error.
pub fn parse_constraint(package: &str, constraint: &str) -> Result<VersionReq, ResolutionError> {
    VersionReq::parse(constraint.trim()).map_err(|_| ResolutionError::InvalidConstraint {
        package: package.to_string(),
        constraint: constraint.to_string(),
    })
}

/// Check that `reference` can be used as a single directory name under the
/// mods directory.
pub fn validate_reference(reference: &str) -> Result<(), ResolutionError> {
    let unsafe_name = reference.is_empty()
        || reference == "."
        || reference == ".."
        || reference.contains(['/', '\\', '\0']);
    if unsafe_name {
        return Err(ResolutionError::InvalidReference {
            package: reference.to_string(),
        });
    }
    Ok(())
}

/// Game platforms an installation can run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetPlatform {
    Windows,
    WindowsServer,
    LinuxServer,
}

impl TargetPlatform {
    /// Order checked when validating an installation.
    pub const ALL: [TargetPlatform; 3] = [
        TargetPlatform::Windows,
        TargetPlatform::WindowsServer,
        TargetPlatform::LinuxServer,
    ];

    /// Executable whose presence identifies this platform.
    pub fn executable(&self) -> &'static str {
        match self {
            TargetPlatform::Windows => "FactoryGame.exe",
            TargetPlatform::WindowsServer => "FactoryServer.exe",
            TargetPlatform::LinuxServer => "FactoryServer.sh",
        }
    }

    pub fn target_name(&self) -> &'static str {
        match self {
            TargetPlatform::Windows => "Windows",
            TargetPlatform::WindowsServer => "WindowsServer",
            TargetPlatform::LinuxServer => "LinuxServer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    pub reference: PackageReference,
    pub constraint: VersionConstraint,
    #[serde(default)]
    pub optional: bool,
}

/// Downloadable artifact of one version for one platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionTarget {
    pub link: String,
    pub hash: String,
    #[serde(default)]
    pub size: u64,
}

/// A concrete package version, as listed by a metadata source and as
/// selected by the resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedVersion {
    pub id: String,
    pub version: Version,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    pub targets: BTreeMap<TargetName, VersionTarget>,
}

impl ResolvedVersion {
    pub fn target(&self, platform: TargetPlatform) -> Option<&VersionTarget> {
        self.targets.get(platform.target_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileMod {
    pub display_name: String,
    pub version: VersionConstraint,
    pub enabled: bool,
}

/// Named set of desired packages for an installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub mods: BTreeMap<PackageReference, ProfileMod>,
}

impl Profile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mods: BTreeMap::new(),
        }
    }

    /// Add or replace a package. The reference must be a plain directory name
    /// and the constraint must parse.
    pub fn add_mod(
        &mut self,
        reference: impl Into<PackageReference>,
        display_name: impl Into<String>,
        constraint: impl Into<VersionConstraint>,
    ) -> Result<(), ResolutionError> {
        let reference = reference.into();
        let constraint = constraint.into();
        validate_reference(&reference)?;
        parse_constraint(&reference, &constraint)?;
        self.mods.insert(
            reference,
            ProfileMod {
                display_name: display_name.into(),
                version: constraint,
                enabled: true,
            },
        );
        Ok(())
    }

    pub fn remove_mod(&mut self, reference: &str) -> Option<ProfileMod> {
        self.mods.remove(reference)
    }

    /// Returns false when the package is not part of the profile.
    pub fn set_enabled(&mut self, reference: &str, enabled: bool) -> bool {
        match self.mods.get_mut(reference) {
            Some(entry) => {
                entry.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Constraints of the enabled packages.
    pub fn constraints(&self) -> BTreeMap<PackageReference, VersionConstraint> {
        self.mods
            .iter()
            .filter(|(_, m)| m.enabled)
            .map(|(reference, m)| (reference.clone(), m.version.clone()))
            .collect()
    }
}

/// A game installation managed by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Installation {
    /// Local directory or `ftp://` / `sftp://` location.
    pub path: String,
    pub selected_profile: String,
}

impl Installation {
    pub fn new(path: impl Into<String>, selected_profile: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            selected_profile: selected_profile.into(),
        }
    }
}
