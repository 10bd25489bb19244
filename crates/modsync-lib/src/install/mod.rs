//! Synchronization of one installation with its selected profile.
//!
//! A run walks `validate -> resolve -> diff -> (download -> extract)* -> commit`.
//! Packages are processed one at a time. A package failure is recorded and the
//! next package still runs, but the lockfile is then left as it was; only a
//! fully successful (or cancelled) run commits one.

pub mod diff;
pub mod extract;

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cache::ContentCache;
use crate::config::SyncConfig;
use crate::error::{PackageFailure, PackageStage, SyncError, ValidationError};
use crate::lockfile::Lockfile;
use crate::progress::{
    progress_channel, CancelToken, ProgressEvent, ProgressObserver, ProgressReceiver,
    ProgressSender, SilentObserver,
};
use crate::provider::MetadataProvider;
use crate::resolver::DependencyResolver;
use crate::storage::{self, StorageBackend};
use crate::types::{Installation, PackageReference, Profile, TargetPlatform};

pub use diff::{PackageFetch, SyncPlan};
pub use extract::{extract_archive, read_marker, ExtractMarker, ExtractOutcome};

const PACKAGE_PROGRESS_BUFFER: usize = 32;
/// Smallest fraction change forwarded to the public channel.
const PROGRESS_STEP: f64 = 0.01;

/// What a run did. This, not the progress stream, is the record of which
/// packages were applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    pub platform: Option<TargetPlatform>,
    pub removed: Vec<PackageReference>,
    pub installed: Vec<PackageReference>,
    pub unchanged: Vec<PackageReference>,
    pub cancelled: bool,
}

#[derive(Debug, Clone)]
pub struct InstallRequest {
    pub installation: Installation,
    pub profile: Profile,
}

/// Find the platform of the installation behind `storage` from its
/// executable. Platforms are checked in [`TargetPlatform::ALL`] order.
pub async fn validate(
    storage: &dyn StorageBackend,
    location: &str,
) -> Result<TargetPlatform, ValidationError> {
    for platform in TargetPlatform::ALL {
        match storage.exists(platform.executable()).await {
            Ok(true) => return Ok(platform),
            Ok(false) => {}
            Err(e) if storage.is_not_exist(&e) => {}
            Err(source) => {
                return Err(ValidationError::Unreachable {
                    path: location.to_string(),
                    source,
                })
            }
        }
    }
    Err(ValidationError::MissingExecutable {
        path: location.to_string(),
    })
}

pub struct SyncEngine {
    config: SyncConfig,
    provider: Arc<dyn MetadataProvider>,
    cache: Arc<ContentCache>,
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        provider: Arc<dyn MetadataProvider>,
        cache: Arc<ContentCache>,
    ) -> Self {
        Self {
            config,
            provider,
            cache,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<ContentCache> {
        &self.cache
    }

    /// A progress channel sized from the configuration.
    pub fn progress_channel(&self) -> (ProgressSender, ProgressReceiver) {
        progress_channel(self.config.progress_buffer)
    }

    /// Synchronize `installation`, opening its storage from the location.
    pub async fn install(
        &self,
        installation: &Installation,
        profile: &Profile,
        progress: Option<ProgressSender>,
        cancel: &CancelToken,
    ) -> Result<InstallReport, SyncError> {
        let storage = storage::connect(&installation.path)
            .await
            .map_err(|source| ValidationError::Unreachable {
                path: installation.path.clone(),
                source,
            })?;
        self.install_with_storage(installation, profile, storage, progress, cancel)
            .await
    }

    /// Synchronize each request in turn. An installation that fails does not
    /// stop the batch, except when its lockfile could not be committed.
    pub async fn install_batch(
        &self,
        requests: &[InstallRequest],
        progress: Option<ProgressSender>,
        cancel: &CancelToken,
    ) -> Vec<(String, Result<InstallReport, SyncError>)> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            if cancel.is_cancelled() {
                log::info!("Batch cancelled before {}", request.installation.path);
                break;
            }
            let result = self
                .install(&request.installation, &request.profile, progress.clone(), cancel)
                .await;
            let fatal = match &result {
                Err(e) if e.is_fatal_to_batch() => {
                    log::error!("Stopping batch at {}: {}", request.installation.path, e);
                    true
                }
                Err(e) => {
                    log::warn!("Installation {} failed: {}", request.installation.path, e);
                    false
                }
                Ok(_) => false,
            };
            results.push((request.installation.path.clone(), result));
            if fatal {
                break;
            }
        }
        results
    }

    pub async fn install_with_storage(
        &self,
        installation: &Installation,
        profile: &Profile,
        storage: Arc<dyn StorageBackend>,
        progress: Option<ProgressSender>,
        cancel: &CancelToken,
    ) -> Result<InstallReport, SyncError> {
        let tag = installation.path.as_str();
        let storage = storage.as_ref();

        log::info!("[sync:{}] validate", tag);
        let platform = validate(storage, &installation.path).await?;
        log::info!("[sync:{}] platform {}", tag, platform.target_name());

        log::info!("[sync:{}] resolve profile {}", tag, profile.name);
        let resolver = DependencyResolver::new(
            self.provider.clone(),
            self.config.core_runtime_reference.clone(),
        );
        let resolution = match resolver.resolve(&profile.constraints()).await {
            Ok(resolution) => resolution,
            Err(source) => {
                let explanation = resolver.explain(&source).await;
                log::error!("[sync:{}] resolution failed: {}", tag, explanation);
                return Err(SyncError::Resolution {
                    source,
                    explanation,
                });
            }
        };
        let new_lockfile = resolution.to_lockfile();

        log::info!("[sync:{}] diff", tag);
        let lockfile_path = self.config.lockfile_path();
        let previous = Lockfile::load(storage, &lockfile_path).await?;
        let old_lockfile = previous.clone().unwrap_or_default();
        let plan = diff::plan(storage, &self.config, &old_lockfile, &new_lockfile, platform).await;

        let mut report = InstallReport {
            platform: Some(platform),
            unchanged: plan.unchanged.clone(),
            ..InstallReport::default()
        };
        let mut failures: Vec<PackageFailure> = Vec::new();
        let mut applied = old_lockfile.clone();
        for reference in &plan.unchanged {
            if let Some(locked) = new_lockfile.get(reference) {
                applied.insert(reference.clone(), locked.clone());
            }
        }

        for reference in &plan.remove {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let dir = self.config.mod_dir(reference);
            log::info!("[sync:{}] remove {}", tag, reference);
            match storage.remove(&dir).await {
                Ok(()) => {}
                Err(e) if storage.is_not_exist(&e) => {}
                Err(e) => {
                    log::error!("[sync:{}] failed to remove {}: {}", tag, dir, e);
                    let failure = PackageFailure {
                        reference: reference.clone(),
                        stage: PackageStage::Remove,
                        message: e.to_string(),
                    };
                    if let Some(sender) = &progress {
                        sender.send(ProgressEvent::ModFailed(
                            reference.clone(),
                            failure.message.clone(),
                        ));
                    }
                    failures.push(failure);
                    continue;
                }
            }
            applied.remove(reference);
            report.removed.push(reference.clone());
        }

        let total = plan.fetch.len();
        for (index, fetch) in plan.fetch.iter().enumerate() {
            if report.cancelled || cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if let Some(sender) = &progress {
                sender.send(ProgressEvent::Overall(index as f64 / total as f64));
            }
            log::info!("[sync:{}] install {} {}", tag, fetch.reference, fetch.version);
            match self.sync_package(storage, fetch, progress.as_ref()).await {
                Ok(()) => {
                    if let Some(locked) = new_lockfile.get(&fetch.reference) {
                        applied.insert(fetch.reference.clone(), locked.clone());
                    }
                    report.installed.push(fetch.reference.clone());
                }
                Err(failure) => {
                    log::error!("[sync:{}] {}", tag, failure);
                    failures.push(failure);
                }
            }
        }
        if !report.cancelled {
            if let Some(sender) = &progress {
                sender.send(ProgressEvent::Overall(1.0));
            }
        }

        if !failures.is_empty() {
            log::warn!(
                "[sync:{}] {} package(s) failed, keeping previous lockfile",
                tag,
                failures.len()
            );
            return Err(SyncError::PackagesFailed { failures });
        }

        let committed = if report.cancelled {
            log::info!("[sync:{}] cancelled, committing completed packages only", tag);
            applied
        } else {
            new_lockfile
        };
        if previous.as_ref() == Some(&committed) {
            log::debug!("[sync:{}] lockfile unchanged", tag);
        } else {
            log::info!("[sync:{}] commit {}", tag, lockfile_path);
            committed
                .save(storage, &lockfile_path)
                .await
                .map_err(|source| SyncError::LockfileCommit {
                    path: lockfile_path.clone(),
                    source,
                })?;
        }

        for (dependent, dependency, constraint, version) in
            committed.unsatisfied_dependencies(platform)
        {
            log::warn!(
                "[sync:{}] {} requires {} {} but {} is installed",
                tag,
                dependent,
                dependency,
                constraint,
                version
            );
        }

        log::info!(
            "[sync:{}] done: {} installed, {} removed, {} unchanged",
            tag,
            report.installed.len(),
            report.removed.len(),
            report.unchanged.len()
        );
        Ok(report)
    }

    /// Download (or reuse) and extract one package, reporting its progress.
    async fn sync_package(
        &self,
        storage: &dyn StorageBackend,
        fetch: &PackageFetch,
        progress: Option<&ProgressSender>,
    ) -> Result<(), PackageFailure> {
        let forwarder =
            progress.map(|sender| PackageProgress::spawn(fetch.reference.clone(), sender.clone()));
        let result = self.fetch_and_extract(storage, fetch, forwarder.as_ref()).await;
        if let Some(forwarder) = forwarder {
            forwarder.finish().await;
        }
        if let Some(sender) = progress {
            match &result {
                Ok(()) => sender.send(ProgressEvent::ModComplete(fetch.reference.clone())),
                Err(failure) => sender.send(ProgressEvent::ModFailed(
                    fetch.reference.clone(),
                    failure.message.clone(),
                )),
            };
        }
        result
    }

    async fn fetch_and_extract(
        &self,
        storage: &dyn StorageBackend,
        fetch: &PackageFetch,
        progress: Option<&PackageProgress>,
    ) -> Result<(), PackageFailure> {
        let failure = |stage: PackageStage, message: String| PackageFailure {
            reference: fetch.reference.clone(),
            stage,
            message,
        };

        let cache_key = ContentCache::cache_key(&fetch.reference, &fetch.version);
        let download_observer = progress.map(|p| p.observer(Phase::Download));
        let archive = self
            .cache
            .fetch_or_reuse(
                &cache_key,
                &fetch.hash,
                &fetch.link,
                observer_or_silent(download_observer.as_ref()),
            )
            .await
            .map_err(|e| failure(PackageStage::Download, e.to_string()))?;
        drop(download_observer);
        if let Some(progress) = progress {
            progress.mark_done(Phase::Download).await;
        }

        let marker_hash = if fetch.hash.is_empty() {
            archive.entry.content_hash.as_str()
        } else {
            fetch.hash.as_str()
        };
        let extract_observer = progress.map(|p| p.observer(Phase::Extract));
        let outcome = extract_archive(
            storage,
            &fetch.reference,
            &fetch.version,
            &archive.bytes,
            marker_hash,
            &self.config.mod_dir(&fetch.reference),
            observer_or_silent(extract_observer.as_ref()),
        )
        .await
        .map_err(|e| failure(PackageStage::Extract, e.to_string()))?;
        drop(extract_observer);
        if let Some(progress) = progress {
            progress.mark_done(Phase::Extract).await;
        }

        log::debug!("{} {}: {:?}", fetch.reference, fetch.version, outcome);
        Ok(())
    }
}

fn observer_or_silent(observer: Option<&PhaseObserver>) -> &dyn ProgressObserver {
    match observer {
        Some(observer) => observer,
        None => &SilentObserver,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Download,
    Extract,
}

/// Feeds byte counts of one phase into the package's forwarding task.
struct PhaseObserver {
    phase: Phase,
    tx: mpsc::Sender<(Phase, f64)>,
}

impl ProgressObserver for PhaseObserver {
    fn update_bytes(&self, transferred: u64, total: Option<u64>) {
        let Some(total) = total.filter(|t| *t > 0) else {
            return;
        };
        let fraction = (transferred as f64 / total as f64).min(1.0);
        let _ = self.tx.try_send((self.phase, fraction));
    }
}

/// Forwarding task for the package being processed. It converts phase
/// fractions into public events, dropping steps smaller than
/// [`PROGRESS_STEP`].
struct PackageProgress {
    tx: mpsc::Sender<(Phase, f64)>,
    handle: JoinHandle<()>,
}

impl PackageProgress {
    fn spawn(reference: PackageReference, sender: ProgressSender) -> Self {
        let (tx, mut rx) = mpsc::channel::<(Phase, f64)>(PACKAGE_PROGRESS_BUFFER);
        let handle = tokio::spawn(async move {
            let mut last_download = -1.0_f64;
            let mut last_extract = -1.0_f64;
            while let Some((phase, fraction)) = rx.recv().await {
                let last = match phase {
                    Phase::Download => &mut last_download,
                    Phase::Extract => &mut last_extract,
                };
                let finished = fraction >= 1.0 && *last < 1.0;
                if !finished && fraction - *last < PROGRESS_STEP {
                    continue;
                }
                *last = fraction;
                let event = match phase {
                    Phase::Download => ProgressEvent::ModDownload(reference.clone(), fraction),
                    Phase::Extract => ProgressEvent::ModExtract(reference.clone(), fraction),
                };
                sender.send(event);
            }
        });
        Self { tx, handle }
    }

    fn observer(&self, phase: Phase) -> PhaseObserver {
        PhaseObserver {
            phase,
            tx: self.tx.clone(),
        }
    }

    /// Queue the completion of `phase`. Unlike byte updates this waits for
    /// room so the marker is never lost before the public channel.
    async fn mark_done(&self, phase: Phase) {
        let _ = self.tx.send((phase, 1.0)).await;
    }

    async fn finish(self) {
        drop(self.tx);
        if let Err(e) = self.handle.await {
            log::warn!("Progress forwarder failed: {}", e);
        }
    }
}
