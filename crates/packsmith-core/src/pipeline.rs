//! End-to-end build orchestration.
//!
//! Entries are resolved, fetched and verified independently on a bounded
//! rayon pool. Results are collected before anything else happens, so
//! reconciliation always sees the complete verified set. The extras archive,
//! when declared, goes through the same stages and is then unpacked for the
//! selected side. Assembly runs on the calling thread.

use crate::assemble::{AssemblyError, AssemblyResult, Assembler};
use crate::cache::ArtifactCache;
use crate::concurrency::{ShutdownFlag, TargetLock};
use crate::extras::{unpack, UnpackedExtras};
use crate::fetcher::{FetchSource, FetchedArtifact, Fetcher};
use crate::reconcile::{reconcile_extras, reconcile_retaining, ExtrasPlan, ReconciliationPlan};
use crate::resolver::{ArtifactReference, ResolutionError, Resolver};
use crate::retry::{Retrier, RetryPolicy, Sleeper, ThreadSleeper};
use crate::verify::{verify, Trust, VerifiedArtifact};
use crate::CoreError;
use packsmith_remote::{ProviderSet, Transport};
use packsmith_schema::{
    LockEntry, LockFile, ManifestEntry, ModId, NormalizedManifest, PackExtras, Side, EXTRAS_ID,
};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const DEFAULT_CONCURRENCY: usize = 8;

/// What happens to the target when some entries fail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CommitPolicy {
    /// Apply the successful entries; failed ones keep their previous state.
    #[default]
    Partial,
    /// Touch nothing unless every entry succeeded.
    AllOrNothing,
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Worker threads for resolve, fetch and verify.
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub commit: CommitPolicy,
    pub cache_dir: Option<PathBuf>,
    /// Compute the plan without touching the target or the lock file.
    pub dry_run: bool,
    pub side: Side,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
            commit: CommitPolicy::default(),
            cache_dir: None,
            dry_run: false,
            side: Side::Both,
        }
    }
}

/// The pipeline stage an entry failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Resolve,
    Fetch,
    Verify,
    /// The extras archive could not be unpacked.
    Extract,
    /// Two entries resolved to the same install path.
    Conflict,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Resolve => "resolve",
            Stage::Fetch => "fetch",
            Stage::Verify => "verify",
            Stage::Extract => "extract",
            Stage::Conflict => "conflict",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryFailure {
    pub id: ModId,
    pub stage: Stage,
    pub message: String,
}

impl EntryFailure {
    fn new(id: &ModId, stage: Stage, error: &impl fmt::Display) -> Self {
        Self {
            id: id.clone(),
            stage,
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildReport {
    pub pack_name: String,
    pub plan: ReconciliationPlan,
    pub failures: Vec<EntryFailure>,
    /// Entries accepted without any checksum to compare against.
    pub first_use: Vec<ModId>,
    /// Entries that were downloaded from the network this run.
    pub downloaded: Vec<ModId>,
    /// Extras archive members left out for the selected side.
    pub extras_excluded: Vec<String>,
    /// `None` when nothing was applied (dry run, or all-or-nothing with failures).
    pub assembly: Option<AssemblyResult>,
}

impl BuildReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn committed(&self) -> bool {
        self.assembly.is_some()
    }

    /// The lock that is (or would be) written for this build.
    pub fn next_lock(&self) -> LockFile {
        match &self.assembly {
            Some(result) => result.lock.clone(),
            None => self.plan.next_lock(&self.pack_name),
        }
    }
}

/// Locked versus newest available version for one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutdatedEntry {
    pub id: ModId,
    pub locked: Option<String>,
    /// `None` for sources that cannot be enumerated.
    pub latest: Option<String>,
    pub error: Option<String>,
}

impl OutdatedEntry {
    pub fn is_outdated(&self) -> bool {
        match (&self.locked, &self.latest) {
            (Some(locked), Some(latest)) => locked != latest,
            (None, Some(_)) => true,
            _ => false,
        }
    }
}

/// Shared context for a run: providers, transport, and cancellation.
#[derive(Clone)]
pub struct Pipeline {
    providers: Arc<ProviderSet>,
    transport: Arc<dyn Transport>,
    sleeper: Arc<dyn Sleeper>,
    shutdown: ShutdownFlag,
}

impl Pipeline {
    pub fn new(providers: Arc<ProviderSet>, transport: Arc<dyn Transport>) -> Self {
        Self {
            providers,
            transport,
            sleeper: Arc::new(ThreadSleeper),
            shutdown: ShutdownFlag::new(),
        }
    }

    #[must_use]
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    #[must_use]
    pub fn with_shutdown(mut self, shutdown: ShutdownFlag) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown(&self) -> &ShutdownFlag {
        &self.shutdown
    }

    fn retrier(&self, policy: &RetryPolicy) -> Retrier {
        Retrier::new(
            policy.clone(),
            Arc::clone(&self.sleeper),
            self.shutdown.clone(),
        )
    }

    fn resolver(&self, options: &BuildOptions, previous: Option<Arc<LockFile>>) -> Resolver {
        Resolver::new(Arc::clone(&self.providers), self.retrier(&options.retry))
            .with_previous_lock(previous)
    }

    fn pool(options: &BuildOptions) -> Result<rayon::ThreadPool, CoreError> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(options.concurrency.max(1))
            .thread_name(|i| format!("packsmith-worker-{i}"))
            .build()
            .map_err(|e| CoreError::ThreadPool(e.to_string()))
    }

    /// Resolve one entry outside of a build.
    pub fn resolve_entry(
        &self,
        entry: &ManifestEntry,
        options: &BuildOptions,
    ) -> Result<ArtifactReference, ResolutionError> {
        self.resolver(options, None).resolve(entry)
    }

    /// Run the full pipeline against `target` and `lock_path`.
    pub fn build(
        &self,
        manifest: &NormalizedManifest,
        target: &Path,
        lock_path: &Path,
        options: &BuildOptions,
    ) -> Result<BuildReport, CoreError> {
        let _run_lock = if options.dry_run {
            None
        } else {
            Some(TargetLock::for_target(target)?)
        };
        let previous = LockFile::read_optional(lock_path)?.map(Arc::new);
        let manifest = manifest.for_side(options.side);
        info!(
            "building {} ({} entries, side {}) into {}",
            manifest.pack_name,
            manifest.entries.len(),
            options.side,
            target.display()
        );

        let resolver = self.resolver(options, previous.clone());
        let fetcher = Fetcher::new(Arc::clone(&self.transport), self.retrier(&options.retry))
            .with_cache(
                options
                    .cache_dir
                    .as_ref()
                    .map(|dir| Arc::new(ArtifactCache::new(dir))),
            );

        let pool = Self::pool(options)?;
        let outcomes: Vec<Result<VerifiedArtifact, EntryFailure>> = pool.install(|| {
            manifest
                .entries
                .par_iter()
                .map(|entry| {
                    process_entry(entry, &resolver, &fetcher, previous.as_deref(), target)
                })
                .collect()
        });

        let extras_outcome = manifest.extras.as_ref().map(|extras| {
            process_extras(extras, options.side, &resolver, &fetcher)
        });

        let mut verified = Vec::with_capacity(outcomes.len());
        let mut failures = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(artifact) => verified.push(artifact),
                Err(failure) => failures.push(failure),
            }
        }
        let (extras_artifact, extras) = match extras_outcome {
            Some(Ok((artifact, unpacked))) => (Some(artifact), Some(unpacked)),
            Some(Err(failure)) => {
                failures.push(failure);
                (None, None)
            }
            None => (None, None),
        };
        for failure in &failures {
            warn!("{} failed at {}: {}", failure.id, failure.stage, failure.message);
        }
        reject_path_conflicts(&mut verified, &mut failures, previous.as_deref());

        let previous_extras = previous.as_ref().and_then(|lock| lock.extras.as_ref());
        let extras_plan = match (extras_artifact, extras.as_ref()) {
            (Some(artifact), Some(unpacked)) => {
                match extras_conflict(unpacked, &verified, &failures, previous.as_deref()) {
                    Some(failure) => {
                        warn!("{}: {}", failure.id, failure.message);
                        failures.push(failure);
                        ExtrasPlan::keep(previous_extras)
                    }
                    None => {
                        let lock = unpacked.lock(
                            &artifact.reference.version,
                            artifact.checksum.clone(),
                            &artifact.reference.url,
                        );
                        verified.push(artifact);
                        reconcile_extras(previous_extras, Some(lock))
                    }
                }
            }
            _ if manifest.extras.is_some() => ExtrasPlan::keep(previous_extras),
            _ => reconcile_extras(previous_extras, None),
        };

        failures.sort_by(|a, b| a.id.cmp(&b.id));
        let retained: BTreeSet<ModId> = failures.iter().map(|f| f.id.clone()).collect();
        let entries: Vec<LockEntry> = verified
            .iter()
            .filter(|a| a.reference.id != EXTRAS_ID)
            .map(VerifiedArtifact::lock_entry)
            .collect();
        let mut plan = reconcile_retaining(previous.as_deref(), &entries, &retained);
        plan.extras = extras_plan;
        info!(
            "plan: {} add, {} update, {} remove, {} unchanged, {} extras changes",
            plan.to_add.len(),
            plan.to_update.len(),
            plan.to_remove.len(),
            plan.unchanged.len(),
            plan.extras.action_count()
        );

        let mut report = BuildReport {
            pack_name: manifest.pack_name.clone(),
            plan,
            failures,
            first_use: verified
                .iter()
                .filter(|a| a.trust == Trust::FirstUse)
                .map(|a| a.reference.id.clone())
                .collect(),
            downloaded: verified
                .iter()
                .filter(|a| a.source == FetchSource::Network)
                .map(|a| a.reference.id.clone())
                .collect(),
            extras_excluded: extras
                .as_ref()
                .map(|x| x.excluded.clone())
                .unwrap_or_default(),
            assembly: None,
        };

        if options.dry_run {
            return Ok(report);
        }
        for artifact in &verified {
            if let Err(e) = fetcher.remember(artifact) {
                warn!("{e}");
            }
        }
        if options.commit == CommitPolicy::AllOrNothing && !report.failures.is_empty() {
            warn!(
                "{} entries failed, leaving {} untouched",
                report.failures.len(),
                target.display()
            );
            return Ok(report);
        }
        if self.shutdown.is_requested() {
            return Err(CoreError::Interrupted);
        }

        let artifacts: BTreeMap<ModId, VerifiedArtifact> = verified
            .into_iter()
            .filter(|a| a.reference.id != EXTRAS_ID)
            .map(|a| (a.reference.id.clone(), a))
            .collect();
        let extras_files = extras.map(|x| x.files).unwrap_or_default();
        let assembler = Assembler::new(target, lock_path).with_shutdown(self.shutdown.clone());
        let result = assembler
            .apply_with_extras(
                &manifest.pack_name,
                &report.plan,
                &artifacts,
                &extras_files,
                previous.as_deref(),
            )
            .map_err(|e| match e {
                AssemblyError::Interrupted => CoreError::Interrupted,
                other => CoreError::Assembly(other),
            })?;
        report.assembly = Some(result);
        Ok(report)
    }

    /// Compute what `build` would do without writing anything.
    pub fn plan(
        &self,
        manifest: &NormalizedManifest,
        target: &Path,
        lock_path: &Path,
        options: &BuildOptions,
    ) -> Result<BuildReport, CoreError> {
        let options = BuildOptions {
            dry_run: true,
            ..options.clone()
        };
        self.build(manifest, target, lock_path, &options)
    }

    /// Compare each entry's locked version with the newest upstream release.
    pub fn check_outdated(
        &self,
        manifest: &NormalizedManifest,
        lock: Option<&LockFile>,
        options: &BuildOptions,
    ) -> Result<Vec<OutdatedEntry>, CoreError> {
        let manifest = manifest.for_side(options.side);
        let resolver = self.resolver(options, None);
        let pool = Self::pool(options)?;
        let mut report: Vec<OutdatedEntry> = pool.install(|| {
            manifest
                .entries
                .par_iter()
                .map(|entry| {
                    let locked = lock
                        .and_then(|l| l.get(&entry.id))
                        .map(|e| e.version.clone());
                    outdated_entry(&resolver, entry, locked)
                })
                .collect()
        });
        if let Some(extras) = &manifest.extras {
            let locked = lock
                .and_then(|l| l.extras.as_ref())
                .map(|x| x.version.clone());
            report.push(outdated_entry(&resolver, &extras.entry, locked));
        }
        Ok(report)
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("providers", &self.providers)
            .field("shutdown", &self.shutdown.is_requested())
            .finish_non_exhaustive()
    }
}

fn outdated_entry(
    resolver: &Resolver,
    entry: &ManifestEntry,
    locked: Option<String>,
) -> OutdatedEntry {
    let (latest, error) = match resolver.latest_available(entry) {
        Ok(found) => (found.map(|r| r.version), None),
        Err(e) => (None, Some(e.to_string())),
    };
    OutdatedEntry {
        id: entry.id.clone(),
        locked,
        latest,
        error,
    }
}

/// Resolve, fetch, verify and unpack the extras archive.
///
/// The archive itself is never installed, so there is no installed copy to
/// reuse; the download cache still applies.
fn process_extras(
    extras: &PackExtras,
    side: Side,
    resolver: &Resolver,
    fetcher: &Fetcher,
) -> Result<(VerifiedArtifact, UnpackedExtras), EntryFailure> {
    let id = &extras.entry.id;
    let reference = resolver
        .resolve(&extras.entry)
        .map_err(|e| EntryFailure::new(id, Stage::Resolve, &e))?;
    let fetched = fetcher
        .fetch(&reference)
        .map_err(|e| EntryFailure::new(id, Stage::Fetch, &e))?;
    let artifact = verify(fetched).map_err(|e| EntryFailure::new(id, Stage::Verify, &e))?;
    let unpacked = unpack(&artifact.payload, extras, side)
        .map_err(|e| EntryFailure::new(id, Stage::Extract, &e))?;
    info!(
        "extras {}: {} files, {} excluded for side {side}",
        artifact.reference.version,
        unpacked.files.len(),
        unpacked.excluded.len()
    );
    Ok((artifact, unpacked))
}

/// A conflict failure for the extras when one of its files would land on a
/// path a mod owns. Mods that failed this run still own their locked path.
fn extras_conflict(
    unpacked: &UnpackedExtras,
    verified: &[VerifiedArtifact],
    failures: &[EntryFailure],
    previous: Option<&LockFile>,
) -> Option<EntryFailure> {
    let failed: BTreeSet<&ModId> = failures.iter().map(|f| &f.id).collect();
    let retained = previous
        .into_iter()
        .flat_map(|lock| lock.entries.iter())
        .filter(|entry| failed.contains(&entry.id))
        .map(|entry| (&entry.id, entry.path.as_str()));
    let mut clashes = verified
        .iter()
        .map(|a| (&a.reference.id, a.reference.install_path.as_str()))
        .chain(retained)
        .filter(|(_, path)| unpacked.files.contains_key(*path))
        .map(|(id, path)| format!("{path} ({id})"))
        .collect::<Vec<_>>();
    if clashes.is_empty() {
        return None;
    }
    clashes.sort();
    Some(EntryFailure {
        id: ModId::new(EXTRAS_ID),
        stage: Stage::Conflict,
        message: format!("extras files collide with mods: {}", clashes.join(", ")),
    })
}

/// Resolve, obtain bytes for, and verify one entry.
fn process_entry(
    entry: &ManifestEntry,
    resolver: &Resolver,
    fetcher: &Fetcher,
    previous: Option<&LockFile>,
    target: &Path,
) -> Result<VerifiedArtifact, EntryFailure> {
    let reference = resolver
        .resolve(entry)
        .map_err(|e| EntryFailure::new(&entry.id, Stage::Resolve, &e))?;
    let fetched = match installed_copy(&reference, previous, target) {
        Some(fetched) => fetched,
        None => fetcher
            .fetch(&reference)
            .map_err(|e| EntryFailure::new(&entry.id, Stage::Fetch, &e))?,
    };
    verify(fetched).map_err(|e| EntryFailure::new(&entry.id, Stage::Verify, &e))
}

/// The already installed file, when the previous lock recorded exactly this
/// artifact at this path and the bytes on disk still match.
fn installed_copy(
    reference: &ArtifactReference,
    previous: Option<&LockFile>,
    target: &Path,
) -> Option<FetchedArtifact> {
    let locked = previous?.get(&reference.id)?;
    if locked.version != reference.version
        || locked.path != reference.install_path
        || reference.checksum.as_ref() != Some(&locked.checksum)
    {
        return None;
    }
    let bytes = std::fs::read(target.join(&locked.path)).ok()?;
    if !locked.checksum.matches(&bytes) {
        debug!("{}: installed file changed on disk, refetching", reference.id);
        return None;
    }
    debug!("{}: reusing installed {}", reference.id, locked.path);
    Some(FetchedArtifact::new(
        reference.clone(),
        bytes,
        FetchSource::Installed,
    ))
}

/// Fail every entry whose install path is claimed by another entry.
///
/// Entries that failed this run keep their previously locked files, so those
/// paths are claimed too. This includes extras files when the extras archive
/// failed. Only the newly verified side of such a clash is failed.
fn reject_path_conflicts(
    verified: &mut Vec<VerifiedArtifact>,
    failures: &mut Vec<EntryFailure>,
    previous: Option<&LockFile>,
) {
    let failed: BTreeSet<&str> = failures.iter().map(|f| f.id.as_str()).collect();
    let retained = previous
        .into_iter()
        .flat_map(LockFile::installed_paths)
        .filter(|(owner, _)| failed.contains(owner));

    let mut owners: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for artifact in verified.iter() {
        owners
            .entry(artifact.reference.install_path.as_str())
            .or_default()
            .push(artifact.reference.id.as_str());
    }
    for (owner, path) in retained {
        owners.entry(path).or_default().push(owner);
    }

    let mut clashing: BTreeMap<ModId, String> = BTreeMap::new();
    for (path, ids) in owners.iter().filter(|(_, ids)| ids.len() > 1) {
        let names = ids.join(", ");
        for id in ids.iter().filter(|id| !failed.contains(*id)) {
            clashing.insert(
                ModId::new(*id),
                format!("install path {path} is shared by {names}"),
            );
        }
    }
    if clashing.is_empty() {
        return;
    }
    verified.retain(|a| !clashing.contains_key(&a.reference.id));
    for (id, message) in clashing {
        warn!("{id}: {message}");
        failures.push(EntryFailure {
            id,
            stage: Stage::Conflict,
            message,
        });
    }
    failures.sort_by(|a, b| a.id.cmp(&b.id));
}
