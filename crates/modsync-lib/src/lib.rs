//! Mod synchronization engine.
//!
//! Resolves a profile's version constraints into concrete package versions,
//! fetches their archives through a verified download cache, extracts them
//! into a game installation on any [`storage::StorageBackend`], and records
//! the result in a lockfile so later runs only apply the difference.

pub mod cache;
pub mod config;
pub mod error;
pub mod install;
pub mod lockfile;
pub mod progress;
pub mod provider;
pub mod resolver;
pub mod storage;
pub mod types;

pub use cache::ContentCache;
pub use config::SyncConfig;
pub use error::{
    CacheError, ExtractionError, LockfileError, PackageFailure, PackageStage, ProviderError,
    ResolutionError, StorageError, SyncError, ValidationError,
};
pub use install::{InstallReport, InstallRequest, SyncEngine};
pub use lockfile::{LockedMod, LockedTarget, Lockfile};
pub use progress::{cancel_pair, progress_channel, CancelHandle, CancelToken, ProgressEvent};
pub use provider::{MetadataProvider, PackageVersions, RegistryStore};
pub use resolver::DependencyResolver;
pub use types::{
    Dependency, Installation, PackageReference, Profile, ProfileMod, ResolvedVersion,
    TargetPlatform, VersionConstraint, VersionTarget,
};
