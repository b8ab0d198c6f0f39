use crate::concurrency::ShutdownFlag;
use crate::reconcile::ReconciliationPlan;
use crate::verify::VerifiedArtifact;
use packsmith_schema::{is_safe_relative_path, ExtraFile, LockEntry, LockError, LockFile, ModId};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("install path '{0}' escapes the target directory")]
    UnsafePath(String),
    #[error("no verified artifact for '{0}'")]
    MissingArtifact(ModId),
    #[error("verified artifact for '{id}' does not match the planned checksum")]
    ChecksumDrift { id: ModId },
    #[error("no unpacked extras file for '{0}'")]
    MissingExtra(String),
    #[error("unpacked extras file '{0}' does not match the planned checksum")]
    ExtraDrift(String),
    #[error("interrupted; the previous lock file is still authoritative")]
    Interrupted,
    #[error("failed to write lock file: {0}")]
    Lock(#[from] LockError),
}

fn io_at(path: &Path) -> impl FnOnce(std::io::Error) -> AssemblyError + '_ {
    move |source| AssemblyError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn fsync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

/// A fully written, fsynced temp file next to its destination.
///
/// Nothing exists at the destination until [`StagedFile::commit`] renames it
/// into place. Dropping an uncommitted `StagedFile` deletes the temp file.
pub struct StagedFile {
    tmp: NamedTempFile,
    dest: PathBuf,
    dir: PathBuf,
}

impl StagedFile {
    pub fn stage(dest: &Path, data: &[u8]) -> std::io::Result<Self> {
        let dir = match dest.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;
        let mut tmp = tempfile::Builder::new()
            .prefix(".packsmith-")
            .suffix(".part")
            .tempfile_in(&dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        Ok(Self {
            tmp,
            dest: dest.to_path_buf(),
            dir,
        })
    }

    pub fn destination(&self) -> &Path {
        &self.dest
    }

    /// Atomically rename into place, then fsync the directory.
    pub fn commit(self) -> std::io::Result<()> {
        self.tmp.persist(&self.dest).map_err(|e| e.error)?;
        fsync_dir(&self.dir)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyResult {
    /// Pack-relative paths written for adds and updates.
    pub written: Vec<String>,
    /// Unchanged entries whose file was missing and has been rewritten.
    pub repaired: Vec<String>,
    pub removed: Vec<String>,
    /// Files scheduled for removal that were already gone.
    pub already_absent: Vec<String>,
    pub lock: LockFile,
    pub lock_written: bool,
}

/// Applies a reconciliation plan to a target directory.
#[derive(Debug, Clone)]
pub struct Assembler {
    target: PathBuf,
    lock_path: PathBuf,
    shutdown: ShutdownFlag,
}

impl Assembler {
    pub fn new(target: impl Into<PathBuf>, lock_path: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
            lock_path: lock_path.into(),
            shutdown: ShutdownFlag::new(),
        }
    }

    #[must_use]
    pub fn with_shutdown(mut self, shutdown: ShutdownFlag) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Target-confined absolute path for a pack-relative one.
    pub fn resolve_path(&self, relative: &str) -> Result<PathBuf, AssemblyError> {
        if !is_safe_relative_path(relative) {
            return Err(AssemblyError::UnsafePath(relative.to_owned()));
        }
        Ok(self.target.join(relative))
    }

    fn check_interrupt(&self) -> Result<(), AssemblyError> {
        if self.shutdown.is_requested() {
            warn!("shutdown requested, stopping assembly before the lock file is written");
            return Err(AssemblyError::Interrupted);
        }
        Ok(())
    }

    fn write_entry(
        &self,
        entry: &LockEntry,
        artifacts: &BTreeMap<ModId, VerifiedArtifact>,
    ) -> Result<(), AssemblyError> {
        let artifact = artifacts
            .get(&entry.id)
            .ok_or_else(|| AssemblyError::MissingArtifact(entry.id.clone()))?;
        if artifact.checksum != entry.checksum {
            return Err(AssemblyError::ChecksumDrift {
                id: entry.id.clone(),
            });
        }
        let dest = self.resolve_path(&entry.path)?;
        StagedFile::stage(&dest, &artifact.payload)
            .and_then(StagedFile::commit)
            .map_err(io_at(&dest))?;
        debug!("wrote {} ({} bytes)", entry.path, artifact.payload.len());
        Ok(())
    }

    fn write_extra(
        &self,
        file: &ExtraFile,
        extras: &BTreeMap<String, Vec<u8>>,
    ) -> Result<(), AssemblyError> {
        let data = extras
            .get(&file.path)
            .ok_or_else(|| AssemblyError::MissingExtra(file.path.clone()))?;
        if !file.checksum.matches(data) {
            return Err(AssemblyError::ExtraDrift(file.path.clone()));
        }
        let dest = self.resolve_path(&file.path)?;
        StagedFile::stage(&dest, data)
            .and_then(StagedFile::commit)
            .map_err(io_at(&dest))?;
        debug!("wrote extras file {} ({} bytes)", file.path, data.len());
        Ok(())
    }

    fn remove_stale(&self, path: &str, result: &mut AssemblyResult) -> Result<(), AssemblyError> {
        self.check_interrupt()?;
        let full = self.resolve_path(path)?;
        match fs::remove_file(&full) {
            Ok(()) => result.removed.push(path.to_owned()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("{path} already absent");
                result.already_absent.push(path.to_owned());
            }
            Err(e) => return Err(io_at(&full)(e)),
        }
        Ok(())
    }

    /// Apply a plan that carries no extras changes.
    pub fn apply(
        &self,
        pack_name: &str,
        plan: &ReconciliationPlan,
        artifacts: &BTreeMap<ModId, VerifiedArtifact>,
        previous: Option<&LockFile>,
    ) -> Result<AssemblyResult, AssemblyError> {
        self.apply_with_extras(pack_name, plan, artifacts, &BTreeMap::new(), previous)
    }

    /// Apply `plan`: write adds and updates, repair missing unchanged files,
    /// remove stale files, then write the lock file last. `extras` holds the
    /// unpacked extras files by pack-relative path.
    ///
    /// Any error stops application immediately and leaves the previous lock
    /// file in place.
    pub fn apply_with_extras(
        &self,
        pack_name: &str,
        plan: &ReconciliationPlan,
        artifacts: &BTreeMap<ModId, VerifiedArtifact>,
        extras: &BTreeMap<String, Vec<u8>>,
        previous: Option<&LockFile>,
    ) -> Result<AssemblyResult, AssemblyError> {
        let next = plan.next_lock(pack_name);
        for (_, path) in next.installed_paths() {
            self.resolve_path(path)?;
        }
        let live_paths: BTreeSet<&str> = next.installed_paths().map(|(_, path)| path).collect();
        let mut result = AssemblyResult {
            written: Vec::new(),
            repaired: Vec::new(),
            removed: Vec::new(),
            already_absent: Vec::new(),
            lock: LockFile::empty(pack_name),
            lock_written: false,
        };

        for entry in plan.to_add.iter().chain(plan.to_update.iter().map(|u| &u.new)) {
            self.check_interrupt()?;
            self.write_entry(entry, artifacts)?;
            result.written.push(entry.path.clone());
        }
        for file in &plan.extras.to_write {
            self.check_interrupt()?;
            self.write_extra(file, extras)?;
            result.written.push(file.path.clone());
        }

        for entry in &plan.unchanged {
            if self.resolve_path(&entry.path)?.exists() || !artifacts.contains_key(&entry.id) {
                continue;
            }
            self.check_interrupt()?;
            warn!("{}: installed file {} is missing, restoring", entry.id, entry.path);
            self.write_entry(entry, artifacts)?;
            result.repaired.push(entry.path.clone());
        }
        for file in &plan.extras.unchanged {
            if self.resolve_path(&file.path)?.exists() || !extras.contains_key(&file.path) {
                continue;
            }
            self.check_interrupt()?;
            warn!("extras file {} is missing, restoring", file.path);
            self.write_extra(file, extras)?;
            result.repaired.push(file.path.clone());
        }

        let stale = plan
            .to_remove
            .iter()
            .chain(
                plan.to_update
                    .iter()
                    .filter(|u| u.old.path != u.new.path)
                    .map(|u| &u.old),
            )
            .map(|e| e.path.as_str())
            .chain(plan.extras.to_remove.iter().map(|f| f.path.as_str()));
        for path in stale {
            if !live_paths.contains(path) {
                self.remove_stale(path, &mut result)?;
            }
        }

        self.check_interrupt()?;
        let unchanged_lock = previous.is_some_and(|p| *p == next) && self.lock_path.exists();
        if !unchanged_lock {
            next.write_to_file(&self.lock_path)?;
            result.lock_written = true;
        }
        info!(
            "assembled {}: {} written, {} removed, {} repaired",
            self.target.display(),
            result.written.len(),
            result.removed.len(),
            result.repaired.len()
        );
        result.lock = next;
        Ok(result)
    }
}
