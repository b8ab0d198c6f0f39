use crate::checksum::Checksum;
use crate::normalize::{is_safe_relative_path, EXTRAS_ID};
use crate::types::ModId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use thiserror::Error;

/// Current lock file format version.
pub const LOCK_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock file I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("lock file parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("lock file serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("unsupported lock_version: {0}, expected {LOCK_VERSION}")]
    UnsupportedVersion(u32),
    #[error("lock file digest mismatch: lock has '{lock_digest}', recomputed '{computed_digest}'")]
    DigestMismatch {
        lock_digest: String,
        computed_digest: String,
    },
    #[error("lock file lists mod '{0}' more than once")]
    DuplicateEntry(String),
    #[error("lock file entries are not sorted by id ('{next}' follows '{prev}')")]
    Unsorted { prev: String, next: String },
    #[error("lock file installs both '{first}' and '{second}' at '{path}'")]
    DuplicatePath {
        path: String,
        first: String,
        second: String,
    },
    #[error("lock file entry '{id}' has unsafe install path '{path}'")]
    UnsafePath { id: String, path: String },
    #[error("lock file extras are not sorted by path ('{next}' follows '{prev}')")]
    UnsortedExtras { prev: String, next: String },
}

/// One installed artifact, exactly as it was written to the pack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockEntry {
    pub id: ModId,
    pub version: String,
    pub checksum: Checksum,
    /// Install path relative to the pack root, `/`-separated.
    pub path: String,
    /// Where the artifact was downloaded from.
    pub url: String,
}

/// The unpacked extras archive and every file it put into the pack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtrasLock {
    pub version: String,
    /// Checksum of the archive itself.
    pub checksum: Checksum,
    pub url: String,
    /// Sorted by path.
    #[serde(default, rename = "file")]
    pub files: Vec<ExtraFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtraFile {
    pub path: String,
    pub checksum: Checksum,
}

impl ExtrasLock {
    pub fn new(
        version: impl Into<String>,
        checksum: Checksum,
        url: impl Into<String>,
        mut files: Vec<ExtraFile>,
    ) -> Self {
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Self {
            version: version.into(),
            checksum,
            url: url.into(),
            files,
        }
    }

    pub fn get(&self, path: &str) -> Option<&ExtraFile> {
        self.files
            .binary_search_by(|f| f.path.as_str().cmp(path))
            .ok()
            .map(|i| &self.files[i])
    }
}

/// The lock file records what the most recent successful build installed.
///
/// Entries are kept sorted by id. `pack_digest` is a blake3 hash over the
/// entries and extras, so a hand-edited or truncated lock file is detected on
/// read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockFile {
    pub lock_version: u32,
    pub pack_name: String,
    pub pack_digest: String,
    #[serde(default, rename = "mod")]
    pub entries: Vec<LockEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extras: Option<ExtrasLock>,
}

impl LockFile {
    pub fn new(pack_name: impl Into<String>, mut entries: Vec<LockEntry>) -> Self {
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        let mut lock = LockFile {
            lock_version: LOCK_VERSION,
            pack_name: pack_name.into(),
            pack_digest: String::new(),
            entries,
            extras: None,
        };
        lock.pack_digest = lock.compute_digest();
        lock
    }

    /// Attach the extras record and refresh the digest.
    #[must_use]
    pub fn with_extras(mut self, extras: Option<ExtrasLock>) -> Self {
        self.extras = extras;
        self.pack_digest = self.compute_digest();
        self
    }

    pub fn empty(pack_name: impl Into<String>) -> Self {
        Self::new(pack_name, Vec::new())
    }

    /// Hash of the locked state. Only resolved, installed data goes in.
    pub fn compute_digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(format!("lock:{}", self.lock_version).as_bytes());
        for entry in &self.entries {
            hasher.update(
                format!(
                    "mod:{}@{}:{}:{}:{}\n",
                    entry.id, entry.version, entry.checksum, entry.path, entry.url
                )
                .as_bytes(),
            );
        }
        if let Some(extras) = &self.extras {
            hasher.update(
                format!(
                    "extras:{}:{}:{}\n",
                    extras.version, extras.checksum, extras.url
                )
                .as_bytes(),
            );
            for file in &extras.files {
                hasher.update(format!("file:{}:{}\n", file.path, file.checksum).as_bytes());
            }
        }
        hasher.finalize().to_hex().to_string()
    }

    /// Check that the stored digest matches the entries, that entries are
    /// sorted with unique ids and paths, and that every path stays inside the
    /// pack directory. Extras files count as installed paths too.
    pub fn verify_integrity(&self) -> Result<(), LockError> {
        if self.lock_version != LOCK_VERSION {
            return Err(LockError::UnsupportedVersion(self.lock_version));
        }
        let computed = self.compute_digest();
        if self.pack_digest != computed {
            return Err(LockError::DigestMismatch {
                lock_digest: self.pack_digest.clone(),
                computed_digest: computed,
            });
        }
        for pair in self.entries.windows(2) {
            match pair[0].id.cmp(&pair[1].id) {
                Ordering::Less => {}
                Ordering::Equal => return Err(LockError::DuplicateEntry(pair[1].id.to_string())),
                Ordering::Greater => {
                    return Err(LockError::Unsorted {
                        prev: pair[0].id.to_string(),
                        next: pair[1].id.to_string(),
                    })
                }
            }
        }
        if let Some(extras) = &self.extras {
            for pair in extras.files.windows(2) {
                if pair[0].path >= pair[1].path {
                    return Err(LockError::UnsortedExtras {
                        prev: pair[0].path.clone(),
                        next: pair[1].path.clone(),
                    });
                }
            }
        }

        let mut owners: BTreeMap<&str, &str> = BTreeMap::new();
        for (owner, path) in self.installed_paths() {
            if let Some(first) = owners.insert(path, owner) {
                return Err(LockError::DuplicatePath {
                    path: path.to_owned(),
                    first: first.to_owned(),
                    second: owner.to_owned(),
                });
            }
            if !is_safe_relative_path(path) {
                return Err(LockError::UnsafePath {
                    id: owner.to_owned(),
                    path: path.to_owned(),
                });
            }
        }
        Ok(())
    }

    /// Every `(owner, path)` pair the lock installs. Extras files are owned by
    /// [`EXTRAS_ID`].
    pub fn installed_paths(&self) -> impl Iterator<Item = (&str, &str)> {
        let mods = self
            .entries
            .iter()
            .map(|e| (e.id.as_str(), e.path.as_str()));
        let extras = self
            .extras
            .iter()
            .flat_map(|x| x.files.iter())
            .map(|f| (EXTRAS_ID, f.path.as_str()));
        mods.chain(extras)
    }

    pub fn get(&self, id: &str) -> Option<&LockEntry> {
        self.entries
            .binary_search_by(|e| e.id.as_str().cmp(id))
            .ok()
            .map(|i| &self.entries[i])
    }

    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<(), LockError> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)?;
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        std::io::Write::write_all(&mut tmp, content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| LockError::Io(e.error))?;
        // Fsync parent directory to ensure rename durability on power loss.
        if let Ok(f) = fs::File::open(dir) {
            let _ = f.sync_all();
        }
        Ok(())
    }

    pub fn read_from_file(path: impl AsRef<Path>) -> Result<Self, LockError> {
        let content = fs::read_to_string(path)?;
        let lock: LockFile = toml::from_str(&content)?;
        lock.verify_integrity()?;
        Ok(lock)
    }

    /// Read the lock file, or `None` if it does not exist yet (first build).
    pub fn read_optional(path: impl AsRef<Path>) -> Result<Option<Self>, LockError> {
        match Self::read_from_file(path) {
            Ok(lock) => Ok(Some(lock)),
            Err(LockError::Io(e)) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}
