//! Manifest parsing, normalization, checksums, and lock files for packsmith.
//!
//! This crate defines the schema layer: TOML manifest parsing (`ManifestV1`),
//! the normalized per-mod entries the pipeline consumes (`NormalizedManifest`,
//! `ManifestEntry`), version selectors backed by semver ordering, algorithm-tagged
//! checksums, the optional extras archive, and the lock file that records exactly
//! what a pack build installed.

pub mod checksum;
pub mod lock;
pub mod manifest;
pub mod normalize;
pub mod selector;
pub mod types;

pub use checksum::{Checksum, ChecksumAlgorithm, ChecksumError};
pub use lock::{ExtraFile, ExtrasLock, LockEntry, LockError, LockFile, LOCK_VERSION};
pub use manifest::{
    parse_manifest_file, parse_manifest_str, ExtrasSection, ManifestError, ManifestV1, ModSection,
    PackSection, Side, SourceSection,
};
pub use normalize::{
    is_safe_relative_path, ManifestEntry, NormalizedManifest, PackExtras, ProviderKind,
    SourceDescriptor, DEFAULT_INSTALL_DIR, EXTRAS_ID,
};
pub use selector::{parse_release_version, VersionSelector};
pub use types::{ModId, RepoSlug};
