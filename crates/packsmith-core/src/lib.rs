//! Resolution and assembly pipeline for packsmith mod packs.
//!
//! This crate turns a normalized manifest into an installed pack directory:
//! the `Resolver` picks a concrete release per entry, the `Fetcher` downloads it
//! with retry and backoff, `verify` checks its digest, `reconcile` diffs the
//! verified set against the previous lock file, and the `Assembler` applies the
//! resulting plan with atomic writes before committing the new lock file. The
//! pack's extras archive is unpacked by `extras` and assembled alongside.
//! `Pipeline` wires the stages together over a bounded thread pool.

pub mod assemble;
pub mod cache;
pub mod concurrency;
pub mod extras;
pub mod fetcher;
pub mod pipeline;
pub mod reconcile;
pub mod resolver;
pub mod retry;
pub mod verify;

pub use assemble::{AssemblyError, AssemblyResult, Assembler, StagedFile};
pub use cache::ArtifactCache;
pub use concurrency::{install_signal_handler, ShutdownFlag, TargetLock};
pub use extras::{unpack, ExtrasError, UnpackedExtras};
pub use fetcher::{FetchError, FetchSource, FetchedArtifact, Fetcher};
pub use pipeline::{
    BuildOptions, BuildReport, CommitPolicy, EntryFailure, OutdatedEntry, Pipeline, Stage,
};
pub use reconcile::{
    reconcile, reconcile_extras, reconcile_retaining, EntryUpdate, ExtrasPlan, ReconciliationPlan,
};
pub use resolver::{ArtifactReference, ResolutionError, Resolver};
pub use retry::{RecordingSleeper, RetryError, RetryPolicy, Retrier, Sleeper, ThreadSleeper};
pub use verify::{
    verify, verify_installed, InstalledState, InstalledStatus, IntegrityError, Trust,
    VerifiedArtifact,
};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("manifest error: {0}")]
    Manifest(#[from] packsmith_schema::ManifestError),
    #[error("lock error: {0}")]
    Lock(#[from] packsmith_schema::LockError),
    #[error("remote error: {0}")]
    Remote(#[from] packsmith_remote::RemoteError),
    #[error("assembly error: {0}")]
    Assembly(#[from] AssemblyError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("target directory {} is in use by another packsmith run", .0.display())]
    TargetLocked(PathBuf),
    #[error("failed to start worker pool: {0}")]
    ThreadPool(String),
    #[error("interrupted before the pack was assembled")]
    Interrupted,
}
