use crate::retry::{RetryError, Retrier};
use crate::verify::Trust;
use packsmith_remote::{ProviderSet, Release, ReleaseProvider, RemoteError};
use packsmith_schema::{
    is_safe_relative_path, parse_release_version, Checksum, LockFile, ManifestEntry, ModId,
    ProviderKind, VersionSelector, EXTRAS_ID,
};
use semver::Version;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// A concrete, downloadable artifact chosen for one manifest entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactReference {
    pub id: ModId,
    /// Resolved version, normalized to semver form when the tag parses.
    pub version: String,
    pub url: String,
    pub file_name: String,
    /// Pack-relative install path, `/`-separated.
    pub install_path: String,
    /// Expected digest, if one is known before download.
    pub checksum: Option<Checksum>,
    /// Where `checksum` came from; `FirstUse` when there is none.
    pub trust: Trust,
}

#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("{id}: version {version} not found upstream")]
    NotFound { id: ModId, version: String },
    #[error("{id}: no release matches '{selector}' ({candidates} candidates)")]
    NoMatchingVersion {
        id: ModId,
        selector: String,
        candidates: usize,
    },
    #[error("{id}: no provider registered for '{kind}' sources")]
    UnknownProvider { id: ModId, kind: ProviderKind },
    #[error("{id}: provider query failed: {source}")]
    Provider {
        id: ModId,
        #[source]
        source: RemoteError,
    },
    #[error("{id}: provider query failed after {attempts} attempts: {last}")]
    Exhausted {
        id: ModId,
        attempts: u32,
        #[source]
        last: RemoteError,
    },
    #[error("{id}: release file '{file_name}' is not a safe install path")]
    UnsafeFileName { id: ModId, file_name: String },
    #[error("{id}: resolution interrupted")]
    Interrupted { id: ModId },
}

impl ResolutionError {
    pub fn id(&self) -> &ModId {
        match self {
            ResolutionError::NotFound { id, .. }
            | ResolutionError::NoMatchingVersion { id, .. }
            | ResolutionError::UnknownProvider { id, .. }
            | ResolutionError::Provider { id, .. }
            | ResolutionError::Exhausted { id, .. }
            | ResolutionError::UnsafeFileName { id, .. }
            | ResolutionError::Interrupted { id } => id,
        }
    }
}

/// Maps manifest entries to concrete artifacts. Read-only: it never touches
/// the target directory.
#[derive(Debug, Clone)]
pub struct Resolver {
    providers: Arc<ProviderSet>,
    retrier: Retrier,
    previous: Option<Arc<LockFile>>,
}

impl Resolver {
    pub fn new(providers: Arc<ProviderSet>, retrier: Retrier) -> Self {
        Self {
            providers,
            retrier,
            previous: None,
        }
    }

    /// Use checksums from a previous lock file as trust-on-first-use pins.
    #[must_use]
    pub fn with_previous_lock(mut self, previous: Option<Arc<LockFile>>) -> Self {
        self.previous = previous;
        self
    }

    pub fn resolve(&self, entry: &ManifestEntry) -> Result<ArtifactReference, ResolutionError> {
        let provider = self.provider_for(entry)?;
        let release = match &entry.selector {
            VersionSelector::Exact { raw, .. } => {
                self.query(entry, || provider.get_release(&entry.source, raw))
                    .map_err(|e| match e {
                        ResolutionError::Provider {
                            id,
                            source: RemoteError::NotFound(_),
                        } => ResolutionError::NotFound {
                            id,
                            version: raw.clone(),
                        },
                        other => other,
                    })?
            }
            selector => {
                let releases = self.query(entry, || provider.list_releases(&entry.source))?;
                let candidates = releases.len();
                highest(releases, |v| {
                    selector.accepts(v, entry.source.allows_prerelease())
                })
                .ok_or_else(|| ResolutionError::NoMatchingVersion {
                    id: entry.id.clone(),
                    selector: selector.to_string(),
                    candidates,
                })?
            }
        };
        let reference = self.to_reference(entry, release)?;
        info!(
            "resolved {} {} -> {} ({})",
            entry.id, entry.selector, reference.version, reference.file_name
        );
        Ok(reference)
    }

    /// The newest release the source offers, ignoring the entry's own pin.
    ///
    /// Returns `Ok(None)` for sources that cannot be enumerated.
    pub fn latest_available(
        &self,
        entry: &ManifestEntry,
    ) -> Result<Option<ArtifactReference>, ResolutionError> {
        if entry.source.kind() == ProviderKind::Url {
            return Ok(None);
        }
        let unpinned = ManifestEntry {
            selector: VersionSelector::Latest,
            checksum: None,
            ..entry.clone()
        };
        match self.resolve(&unpinned) {
            Ok(reference) => Ok(Some(reference)),
            Err(ResolutionError::NoMatchingVersion { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn provider_for(
        &self,
        entry: &ManifestEntry,
    ) -> Result<&dyn ReleaseProvider, ResolutionError> {
        let kind = entry.source.kind();
        self.providers
            .get(kind)
            .ok_or_else(|| ResolutionError::UnknownProvider {
                id: entry.id.clone(),
                kind,
            })
    }

    fn query<T>(
        &self,
        entry: &ManifestEntry,
        mut op: impl FnMut() -> Result<T, RemoteError>,
    ) -> Result<T, ResolutionError> {
        let label = format!("resolve {}", entry.id);
        self.retrier
            .run(&label, RemoteError::is_transient, |_| op())
            .map_err(|e| match e {
                RetryError::Permanent { error, .. } => ResolutionError::Provider {
                    id: entry.id.clone(),
                    source: error,
                },
                RetryError::Exhausted { attempts, last } => ResolutionError::Exhausted {
                    id: entry.id.clone(),
                    attempts,
                    last,
                },
                RetryError::Interrupted { .. } => ResolutionError::Interrupted {
                    id: entry.id.clone(),
                },
            })
    }

    fn to_reference(
        &self,
        entry: &ManifestEntry,
        release: Release,
    ) -> Result<ArtifactReference, ResolutionError> {
        let install_path = entry.install_path(&release.file_name);
        if release.file_name.contains(['/', '\\']) || !is_safe_relative_path(&install_path) {
            return Err(ResolutionError::UnsafeFileName {
                id: entry.id.clone(),
                file_name: release.file_name,
            });
        }

        let version = parse_release_version(&release.version)
            .map_or_else(|| release.version.clone(), |v| v.to_string());

        let (checksum, trust) = if let Some(sum) = &entry.checksum {
            (Some(sum.clone()), Trust::Declared)
        } else if let Some(sum) = release.checksum {
            (Some(sum), Trust::Published)
        } else if let Some(pinned) = self.pinned_checksum(&entry.id, &version) {
            debug!("{}: using checksum pinned by previous lock", entry.id);
            (Some(pinned), Trust::Pinned)
        } else {
            (None, Trust::FirstUse)
        };

        Ok(ArtifactReference {
            id: entry.id.clone(),
            version,
            url: release.url,
            file_name: release.file_name,
            install_path,
            checksum,
            trust,
        })
    }

    fn pinned_checksum(&self, id: &ModId, version: &str) -> Option<Checksum> {
        let previous = self.previous.as_ref()?;
        let (locked_version, checksum) = if *id == EXTRAS_ID {
            let extras = previous.extras.as_ref()?;
            (&extras.version, &extras.checksum)
        } else {
            let entry = previous.get(id)?;
            (&entry.version, &entry.checksum)
        };
        (locked_version == version).then(|| checksum.clone())
    }
}

/// The release with the highest parseable version accepted by `accept`.
/// Releases whose version does not parse are ignored.
fn highest(releases: Vec<Release>, accept: impl Fn(&Version) -> bool) -> Option<Release> {
    releases
        .into_iter()
        .filter_map(|r| parse_release_version(&r.version).map(|v| (v, r)))
        .filter(|(v, _)| accept(v))
        .max_by(|(a, _), (b, _)| a.cmp(b))
        .map(|(_, r)| r)
}
