//! Error taxonomy for the synchronization engine.
//!
//! Installation-level errors (validation, resolution) abort one installation,
//! package-level errors (cache, extraction, storage) abort one package, and a
//! lockfile commit failure aborts the whole run.

use std::fmt;

use semver::Version;
use thiserror::Error;

use crate::types::PackageReference;

/// Failure reported by a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Path not found: {path}")]
    NotFound { path: String },

    #[error("Path already exists: {path}")]
    AlreadyExists { path: String },

    #[error("{backend} backend does not implement {operation} ({path})")]
    NotImplemented {
        backend: &'static str,
        operation: &'static str,
        path: String,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A remote endpoint answered with an error response.
    #[error("Remote error on {path}: {message}")]
    Protocol {
        path: String,
        code: Option<u32>,
        message: String,
    },

    #[error("Invalid storage location {location}: {reason}")]
    InvalidLocation { location: String, reason: String },
}

impl StorageError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }
}

/// The target installation is not usable.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("No game executable found in installation {path}")]
    MissingExecutable { path: String },

    #[error("Could not open installation {path}: {source}")]
    Unreachable {
        path: String,
        #[source]
        source: StorageError,
    },
}

/// Failure of an external metadata source.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Metadata source unavailable: {0}")]
    Unavailable(String),

    #[error("Package {0} is unknown to the metadata source")]
    UnknownPackage(PackageReference),
}

/// Dependency resolution failed.
///
/// `Display` shows raw package references; use
/// [`crate::resolver::DependencyResolver::explain`] for a message with display names.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("{package} was already resolved to {resolved} but {selected} was selected later")]
    Conflict {
        package: PackageReference,
        resolved: Version,
        selected: Version,
    },

    #[error(
        "{package}@{version} (selected for \"{selected_constraint}\" required by {selected_by}) \
         does not satisfy \"{constraint}\" required by {required_by}"
    )]
    ConstraintViolation {
        package: PackageReference,
        version: Version,
        constraint: String,
        required_by: String,
        selected_constraint: String,
        selected_by: String,
    },

    #[error("{package} could not be resolved")]
    UnresolvedReference { package: PackageReference },

    #[error("{package} has no version matching \"{constraint}\"")]
    NoMatchingVersion {
        package: PackageReference,
        constraint: String,
    },

    #[error("Invalid version constraint \"{constraint}\" for {package}")]
    InvalidConstraint {
        package: PackageReference,
        constraint: String,
    },

    #[error("\"{package}\" is not a valid package reference")]
    InvalidReference { package: PackageReference },

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Download or hashing failure in the content cache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("HTTP error {status} while downloading {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Failed to download {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Hash mismatch for {cache_key}: expected {expected}, got {actual}")]
    HashMismatch {
        cache_key: String,
        expected: String,
        actual: String,
    },

    #[error("Unsupported download source {url}")]
    UnsupportedSource { url: String },

    #[error("Cache storage error for {cache_key}: {source}")]
    Storage {
        cache_key: String,
        #[source]
        source: StorageError,
    },
}

/// Failure while unpacking an archive onto a storage backend.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("Corrupt archive for {reference}: {reason}")]
    CorruptArchive {
        reference: PackageReference,
        reason: String,
    },

    #[error("Archive for {reference} contains unsafe path {entry}")]
    UnsafePath {
        reference: PackageReference,
        entry: String,
    },

    #[error("Failed to write {path}: {source}")]
    Storage {
        path: String,
        #[source]
        source: StorageError,
    },
}

/// Lockfile could not be loaded or saved.
#[derive(Debug, Error)]
pub enum LockfileError {
    #[error("Lockfile {path} has unsupported schema version {version}")]
    UnsupportedVersion { path: String, version: i64 },

    #[error("Lockfile {path} is malformed: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Lockfile {path} lists invalid package reference \"{reference}\"")]
    InvalidReference { path: String, reference: String },

    #[error("Lockfile storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Stage of a per-package operation, used to report failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageStage {
    Remove,
    Download,
    Extract,
}

impl fmt::Display for PackageStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PackageStage::Remove => "remove",
            PackageStage::Download => "download",
            PackageStage::Extract => "extract",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct PackageFailure {
    pub reference: PackageReference,
    pub stage: PackageStage,
    pub message: String,
}

impl fmt::Display for PackageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.reference, self.stage, self.message)
    }
}

/// Error returned by a synchronization run for one installation.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// `explanation` substitutes display names for package references.
    #[error("Dependency resolution failed: {explanation}")]
    Resolution {
        #[source]
        source: ResolutionError,
        explanation: String,
    },

    #[error(transparent)]
    Lockfile(#[from] LockfileError),

    #[error("Failed to commit lockfile {path}: {source}")]
    LockfileCommit {
        path: String,
        #[source]
        source: LockfileError,
    },

    #[error("{} package(s) failed: {}", failures.len(), join_failures(failures))]
    PackagesFailed { failures: Vec<PackageFailure> },
}

impl SyncError {
    /// Whether a batch must stop after this error instead of moving on to the
    /// next installation.
    pub fn is_fatal_to_batch(&self) -> bool {
        matches!(self, SyncError::LockfileCommit { .. })
    }
}

fn join_failures(failures: &[PackageFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
