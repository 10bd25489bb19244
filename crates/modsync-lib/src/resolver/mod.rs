//! Turns a set of constraints into one concrete version per package.
//!
//! Resolution is an iterative fixed point over batched provider queries. Each
//! package is settled once, greedily, at the highest version satisfying every
//! requirement known when it is selected; a later requirement that the
//! selection does not meet fails resolution instead of triggering a search
//! for alternatives.

mod names;

use semver::VersionReq;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::error::ResolutionError;
use crate::lockfile::Lockfile;
use crate::provider::{MetadataProvider, PackageVersions};
use crate::types::{
    parse_constraint, validate_reference, PackageReference, ResolvedVersion, VersionConstraint,
};

pub use names::DisplayNames;

/// Requirer recorded for constraints that come from the profile itself.
pub const ROOT_REQUIRER: &str = "<root>";

#[derive(Debug, Clone)]
struct Requirement {
    constraint: VersionConstraint,
    req: VersionReq,
    required_by: PackageReference,
}

impl Requirement {
    fn new(
        package: &str,
        constraint: &str,
        required_by: &str,
    ) -> Result<Self, ResolutionError> {
        validate_reference(package)?;
        Ok(Self {
            req: parse_constraint(package, constraint)?,
            constraint: constraint.to_string(),
            required_by: required_by.to_string(),
        })
    }
}

/// An optional dependency, checked once the selection is complete.
struct OptionalCheck {
    dependency: PackageReference,
    requirement: Requirement,
}

#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub versions: BTreeMap<PackageReference, ResolvedVersion>,
}

impl Resolution {
    pub fn to_lockfile(&self) -> Lockfile {
        Lockfile::from_resolved(&self.versions)
    }
}

pub struct DependencyResolver {
    provider: Arc<dyn MetadataProvider>,
    core_runtime: PackageReference,
    names: DisplayNames,
}

impl DependencyResolver {
    pub fn new(
        provider: Arc<dyn MetadataProvider>,
        core_runtime: impl Into<PackageReference>,
    ) -> Self {
        Self {
            names: DisplayNames::new(provider.clone()),
            provider,
            core_runtime: core_runtime.into(),
        }
    }

    pub fn display_names(&self) -> &DisplayNames {
        &self.names
    }

    /// Explain `err` with display names substituted for references.
    pub async fn explain(&self, err: &ResolutionError) -> String {
        self.names.explain(err).await
    }

    pub async fn resolve(
        &self,
        constraints: &BTreeMap<PackageReference, VersionConstraint>,
    ) -> Result<Resolution, ResolutionError> {
        let mut requirements: HashMap<PackageReference, Vec<Requirement>> = HashMap::new();
        let mut queue: BTreeSet<PackageReference> = BTreeSet::new();
        let mut resolved: BTreeMap<PackageReference, ResolvedVersion> = BTreeMap::new();
        let mut optional: Vec<OptionalCheck> = Vec::new();

        for (reference, constraint) in constraints {
            if *reference == self.core_runtime {
                continue;
            }
            let requirement = Requirement::new(reference, constraint, ROOT_REQUIRER)?;
            requirements
                .entry(reference.clone())
                .or_default()
                .push(requirement);
            queue.insert(reference.clone());
        }

        let mut round = 0;
        while !queue.is_empty() {
            round += 1;
            let batch: BTreeMap<PackageReference, VersionConstraint> = queue
                .iter()
                .map(|reference| {
                    let combined = requirements
                        .get(reference)
                        .map(|reqs| {
                            reqs.iter()
                                .map(|r| r.constraint.as_str())
                                .collect::<Vec<_>>()
                                .join(", ")
                        })
                        .unwrap_or_else(|| "*".to_string());
                    (reference.clone(), combined)
                })
                .collect();
            queue.clear();
            log::debug!("[resolve] round {}: querying {} package(s)", round, batch.len());

            let packages = self.provider.resolve_dependencies(&batch).await?;
            let returned: BTreeSet<&str> = packages.iter().map(|p| p.reference.as_str()).collect();
            if let Some(missing) = batch.keys().find(|r| !returned.contains(r.as_str())) {
                return Err(ResolutionError::UnresolvedReference {
                    package: missing.clone(),
                });
            }

            for package in &packages {
                let reqs = known_requirements(&requirements, &package.reference);

                if let Some(existing) = resolved.get(&package.reference) {
                    let reselected = select(package, reqs)?;
                    if reselected.version != existing.version {
                        return Err(ResolutionError::Conflict {
                            package: package.reference.clone(),
                            resolved: existing.version.clone(),
                            selected: reselected.version,
                        });
                    }
                    continue;
                }
                if !batch.contains_key(&package.reference) {
                    log::debug!("[resolve] ignoring unrequested package {}", package.reference);
                    continue;
                }

                let selected = select(package, reqs)?;
                log::debug!("[resolve] {} -> {}", package.reference, selected.version);

                for dependency in &selected.dependencies {
                    if dependency.reference == self.core_runtime {
                        continue;
                    }
                    let requirement = Requirement::new(
                        &dependency.reference,
                        &dependency.constraint,
                        &package.reference,
                    )?;
                    if dependency.optional {
                        optional.push(OptionalCheck {
                            dependency: dependency.reference.clone(),
                            requirement,
                        });
                        continue;
                    }
                    if let Some(installed) = resolved.get(&dependency.reference) {
                        if !requirement.req.matches(&installed.version) {
                            return Err(violation(
                                &dependency.reference,
                                installed,
                                &requirement,
                                known_requirements(&requirements, &dependency.reference),
                            ));
                        }
                        continue;
                    }
                    requirements
                        .entry(dependency.reference.clone())
                        .or_default()
                        .push(requirement);
                    queue.insert(dependency.reference.clone());
                }

                resolved.insert(package.reference.clone(), selected);
            }

            queue.retain(|reference| !resolved.contains_key(reference));
        }

        for check in &optional {
            if let Some(installed) = resolved.get(&check.dependency) {
                if !check.requirement.req.matches(&installed.version) {
                    return Err(violation(
                        &check.dependency,
                        installed,
                        &check.requirement,
                        known_requirements(&requirements, &check.dependency),
                    ));
                }
            }
        }

        for reference in constraints.keys() {
            if *reference != self.core_runtime && !resolved.contains_key(reference) {
                return Err(ResolutionError::UnresolvedReference {
                    package: reference.clone(),
                });
            }
        }

        log::info!("[resolve] {} package(s) resolved in {} round(s)", resolved.len(), round);
        Ok(Resolution { versions: resolved })
    }
}

/// Highest version satisfying every requirement.
fn select(
    package: &PackageVersions,
    reqs: &[Requirement],
) -> Result<ResolvedVersion, ResolutionError> {
    let mut candidates: Vec<&ResolvedVersion> = package.versions.iter().collect();
    candidates.sort_by(|a, b| b.version.cmp(&a.version));

    if let Some(version) = candidates
        .iter()
        .find(|v| reqs.iter().all(|r| r.req.matches(&v.version)))
    {
        return Ok((*version).clone());
    }

    let Some(first) = reqs.first() else {
        return Err(ResolutionError::NoMatchingVersion {
            package: package.reference.clone(),
            constraint: "*".to_string(),
        });
    };
    let greedy = candidates.iter().find(|v| first.req.matches(&v.version));
    match greedy {
        Some(version) => match reqs.iter().find(|r| !r.req.matches(&version.version)) {
            Some(failing) => Err(violation(&package.reference, version, failing, reqs)),
            None => Ok((*version).clone()),
        },
        None => Err(ResolutionError::NoMatchingVersion {
            package: package.reference.clone(),
            constraint: first.constraint.clone(),
        }),
    }
}

fn known_requirements<'a>(
    requirements: &'a HashMap<PackageReference, Vec<Requirement>>,
    package: &str,
) -> &'a [Requirement] {
    requirements.get(package).map(Vec::as_slice).unwrap_or_default()
}

fn violation(
    package: &str,
    installed: &ResolvedVersion,
    failing: &Requirement,
    known: &[Requirement],
) -> ResolutionError {
    let selected = known
        .iter()
        .find(|r| r.req.matches(&installed.version))
        .or_else(|| known.first());
    ResolutionError::ConstraintViolation {
        package: package.to_string(),
        version: installed.version.clone(),
        constraint: failing.constraint.clone(),
        required_by: failing.required_by.clone(),
        selected_constraint: selected
            .map(|r| r.constraint.clone())
            .unwrap_or_else(|| "*".to_string()),
        selected_by: selected
            .map(|r| r.required_by.clone())
            .unwrap_or_else(|| ROOT_REQUIRER.to_string()),
    }
}
