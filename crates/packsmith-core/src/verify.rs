use crate::fetcher::{FetchSource, FetchedArtifact};
use crate::resolver::ArtifactReference;
use chrono::{DateTime, Utc};
use packsmith_schema::{is_safe_relative_path, Checksum, LockEntry, LockFile, ModId, EXTRAS_ID};
use std::fmt;
use std::io::ErrorKind;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

/// How the checksum of a verified artifact came to be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trust {
    /// Declared in the manifest.
    Declared,
    /// Published by the provider next to the file.
    Published,
    /// Recorded by a previous lock file for the same version.
    Pinned,
    /// Nothing to compare against; the computed digest was accepted.
    FirstUse,
}

impl fmt::Display for Trust {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Trust::Declared => "declared",
            Trust::Published => "published",
            Trust::Pinned => "pinned",
            Trust::FirstUse => "first-use",
        })
    }
}

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("{id}: checksum mismatch for {url}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        id: ModId,
        url: String,
        expected: Checksum,
        actual: Checksum,
    },
}

/// An artifact whose payload is known to match its checksum.
#[derive(Debug, Clone)]
pub struct VerifiedArtifact {
    pub reference: ArtifactReference,
    pub payload: Vec<u8>,
    pub checksum: Checksum,
    pub trust: Trust,
    pub source: FetchSource,
    pub fetched_at: DateTime<Utc>,
}

impl VerifiedArtifact {
    /// The lock entry that records this artifact once installed.
    pub fn lock_entry(&self) -> LockEntry {
        LockEntry {
            id: self.reference.id.clone(),
            version: self.reference.version.clone(),
            checksum: self.checksum.clone(),
            path: self.reference.install_path.clone(),
            url: self.reference.url.clone(),
        }
    }
}

/// Check a fetched payload against its expected checksum.
///
/// With an expected checksum the payload is re-hashed with that algorithm and
/// must match exactly; on mismatch the payload is dropped here. Without one the
/// blake3 digest is accepted and recorded.
pub fn verify(fetched: FetchedArtifact) -> Result<VerifiedArtifact, IntegrityError> {
    let FetchedArtifact {
        reference,
        payload,
        checksum: actual,
        source,
        fetched_at,
    } = fetched;

    let (checksum, trust) = match &reference.checksum {
        Some(expected) => {
            if actual != *expected {
                warn!(
                    "{}: checksum mismatch (expected {expected}, got {actual}), discarding payload",
                    reference.id
                );
                return Err(IntegrityError::ChecksumMismatch {
                    id: reference.id.clone(),
                    url: reference.url.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
            (actual, reference.trust)
        }
        None => {
            debug!("{}: trusting on first use: {actual}", reference.id);
            (actual, Trust::FirstUse)
        }
    };

    Ok(VerifiedArtifact {
        reference,
        payload,
        checksum,
        trust,
        source,
        fetched_at,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstalledState {
    Ok,
    Missing,
    Mismatch { actual: Checksum },
    UnsafePath,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledStatus {
    pub id: ModId,
    pub path: String,
    pub state: InstalledState,
}

impl InstalledStatus {
    pub fn is_ok(&self) -> bool {
        self.state == InstalledState::Ok
    }
}

/// Re-hash every file the lock says is installed under `target`, mods first,
/// then extras files (reported under the extras id).
pub fn verify_installed(target: &Path, lock: &LockFile) -> std::io::Result<Vec<InstalledStatus>> {
    let mods = lock
        .entries
        .iter()
        .map(|e| (&e.id, e.path.as_str(), &e.checksum));
    let extras_id = ModId::new(EXTRAS_ID);
    let extras = lock
        .extras
        .iter()
        .flat_map(|x| x.files.iter())
        .map(|f| (&extras_id, f.path.as_str(), &f.checksum));

    let mut statuses = Vec::with_capacity(lock.entries.len());
    for (id, path, expected) in mods.chain(extras) {
        statuses.push(InstalledStatus {
            id: id.clone(),
            path: path.to_owned(),
            state: installed_state(target, path, expected)?,
        });
    }
    Ok(statuses)
}

fn installed_state(
    target: &Path,
    path: &str,
    expected: &Checksum,
) -> std::io::Result<InstalledState> {
    if !is_safe_relative_path(path) {
        return Ok(InstalledState::UnsafePath);
    }
    match std::fs::read(target.join(path)) {
        Ok(bytes) => {
            let actual = Checksum::compute(expected.algorithm(), &bytes);
            Ok(if actual == *expected {
                InstalledState::Ok
            } else {
                InstalledState::Mismatch { actual }
            })
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(InstalledState::Missing),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packsmith_schema::ChecksumAlgorithm;

    fn reference(checksum: Option<Checksum>, trust: Trust) -> ArtifactReference {
        ArtifactReference {
            id: ModId::new("modA"),
            version: "1.0.0".to_owned(),
            url: "https://dl.test/modA-1.0.0.jar".to_owned(),
            file_name: "modA-1.0.0.jar".to_owned(),
            install_path: "mods/modA-1.0.0.jar".to_owned(),
            checksum,
            trust,
        }
    }

    fn fetched(reference: ArtifactReference, payload: &[u8]) -> FetchedArtifact {
        FetchedArtifact::new(reference, payload.to_vec(), FetchSource::Network)
    }

    #[test]
    fn matching_checksum_keeps_trust_source() {
        let expected = Checksum::blake3(b"jar");
        let verified = verify(fetched(
            reference(Some(expected.clone()), Trust::Published),
            b"jar",
        ))
        .unwrap();
        assert_eq!(verified.checksum, expected);
        assert_eq!(verified.trust, Trust::Published);
        assert_eq!(verified.lock_entry().path, "mods/modA-1.0.0.jar");
    }

    #[test]
    fn sha256_expectations_are_honored() {
        let expected = Checksum::compute(ChecksumAlgorithm::Sha256, b"jar");
        let verified = verify(fetched(
            reference(Some(expected.clone()), Trust::Declared),
            b"jar",
        ))
        .unwrap();
        assert_eq!(verified.checksum.algorithm(), ChecksumAlgorithm::Sha256);
        assert_eq!(verified.checksum, expected);
    }

    #[test]
    fn mismatch_is_rejected() {
        let expected = Checksum::blake3(b"expected bytes");
        let err = verify(fetched(
            reference(Some(expected.clone()), Trust::Declared),
            b"tampered bytes",
        ))
        .unwrap_err();
        let IntegrityError::ChecksumMismatch {
            expected: e,
            actual,
            ..
        } = err;
        assert_eq!(e, expected);
        assert_eq!(actual, Checksum::blake3(b"tampered bytes"));
    }

    #[test]
    fn absent_checksum_is_trusted_on_first_use() {
        let verified = verify(fetched(reference(None, Trust::FirstUse), b"new")).unwrap();
        assert_eq!(verified.trust, Trust::FirstUse);
        assert_eq!(verified.checksum, Checksum::blake3(b"new"));
    }

    #[test]
    fn installed_files_are_rehashed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("mods")).unwrap();
        std::fs::write(dir.path().join("mods/a.jar"), b"a").unwrap();
        std::fs::write(dir.path().join("mods/b.jar"), b"corrupt").unwrap();

        let entry = |id: &str, path: &str, bytes: &[u8]| LockEntry {
            id: ModId::new(id),
            version: "1".to_owned(),
            checksum: Checksum::blake3(bytes),
            path: path.to_owned(),
            url: "https://dl.test/x".to_owned(),
        };
        let lock = LockFile::new(
            "p",
            vec![
                entry("a", "mods/a.jar", b"a"),
                entry("b", "mods/b.jar", b"b"),
                entry("c", "mods/c.jar", b"c"),
            ],
        );

        let statuses = verify_installed(dir.path(), &lock).unwrap();
        assert!(statuses[0].is_ok());
        assert!(matches!(statuses[1].state, InstalledState::Mismatch { .. }));
        assert_eq!(statuses[2].state, InstalledState::Missing);
    }

    #[test]
    fn extras_files_are_rehashed_too() {
        use packsmith_schema::{ExtraFile, ExtrasLock};

        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("config")).unwrap();
        std::fs::write(dir.path().join("config/a.cfg"), b"edited").unwrap();
        let lock = LockFile::empty("p").with_extras(Some(ExtrasLock::new(
            "1",
            Checksum::blake3(b"zip"),
            "https://dl.test/extras.zip",
            vec![ExtraFile {
                path: "config/a.cfg".to_owned(),
                checksum: Checksum::blake3(b"a"),
            }],
        )));

        let statuses = verify_installed(dir.path(), &lock).unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].id, EXTRAS_ID);
        assert!(matches!(statuses[0].state, InstalledState::Mismatch { .. }));
    }
}
