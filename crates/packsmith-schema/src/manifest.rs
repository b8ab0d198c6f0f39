use crate::checksum::ChecksumError;
use crate::lock::LockFile;
use crate::normalize::EXTRAS_ID;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse manifest: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("failed to serialize manifest: {0}")]
    SerializeToml(#[from] toml::ser::Error),
    #[error("unsupported manifest_version: {0}, expected 1")]
    UnsupportedVersion(u32),
    #[error("pack.name must not be empty")]
    EmptyPackName,
    #[error("mod #{0} has an empty id")]
    EmptyModId(usize),
    #[error("mod '{0}' is declared more than once")]
    DuplicateMod(String),
    #[error("mod '{id}': invalid version selector '{selector}'")]
    InvalidSelector { id: String, selector: String },
    #[error("mod '{id}': invalid checksum: {source}")]
    InvalidChecksum {
        id: String,
        #[source]
        source: ChecksumError,
    },
    #[error("mod '{id}': invalid GitHub repository '{repo}', expected 'owner/name'")]
    InvalidRepo { id: String, repo: String },
    #[error("mod '{id}': invalid URL '{url}', expected http(s)://...")]
    InvalidUrl { id: String, url: String },
    #[error("mod '{id}': url sources require an exact version pin, got '{selector}'")]
    UnpinnedUrlSource { id: String, selector: String },
    #[error("mod '{id}': install_dir '{dir}' must be a relative path inside the pack")]
    UnsafeInstallDir { id: String, dir: String },
    #[error("mod id '{0}' is reserved")]
    ReservedId(String),
    #[error("extras: exclusion '{0}' must be a relative path inside the pack")]
    UnsafeExclusion(String),
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ManifestV1 {
    pub manifest_version: u32,
    pub pack: PackSection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extras: Option<ExtrasSection>,
    #[serde(default)]
    pub mods: Vec<ModSection>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PackSection {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ModSection {
    pub id: String,
    #[serde(default = "default_selector")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default)]
    pub side: Side,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_dir: Option<String>,
    pub source: SourceSection,
}

/// The pack's own files (configs, scripts) shipped as a zip archive.
///
/// The archive is unpacked into the pack root. Paths listed under
/// `client_exclusions`/`server_exclusions` (files or whole directories) are
/// left out of the tree built for that side.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ExtrasSection {
    #[serde(default = "default_selector")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub client_exclusions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub server_exclusions: Vec<String>,
    pub source: SourceSection,
}

/// Where a mod's releases come from.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "provider", rename_all = "lowercase", deny_unknown_fields)]
pub enum SourceSection {
    /// Assets attached to GitHub releases of `repo`.
    Github {
        repo: String,
        /// Asset file name pattern; a single `*` wildcard is allowed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        asset: Option<String>,
        #[serde(default)]
        prerelease: bool,
    },
    /// A fixed download URL. `{version}` is substituted with the pinned version.
    Url { url: String },
    /// A mirror serving `<base>/<name>/index.json`.
    Mirror {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
}

impl SourceSection {
    pub fn provider_name(&self) -> &'static str {
        match self {
            SourceSection::Github { .. } => "github",
            SourceSection::Url { .. } => "url",
            SourceSection::Mirror { .. } => "mirror",
        }
    }
}

/// Which pack flavour a mod belongs to.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    #[default]
    Both,
    Client,
    Server,
}

impl Side {
    /// Whether a mod declared for `self` belongs in a pack built for `target`.
    pub fn includes(self, target: Side) -> bool {
        self == Side::Both || target == Side::Both || self == target
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Both => write!(f, "both"),
            Side::Client => write!(f, "client"),
            Side::Server => write!(f, "server"),
        }
    }
}

fn default_selector() -> String {
    "latest".to_owned()
}

pub fn parse_manifest_str(input: &str) -> Result<ManifestV1, ManifestError> {
    Ok(toml::from_str(input)?)
}

pub fn parse_manifest_file(path: impl AsRef<Path>) -> Result<ManifestV1, ManifestError> {
    let content = fs::read_to_string(path)?;
    parse_manifest_str(&content)
}

impl ManifestV1 {
    /// Serialize back to TOML. Comments in the original file are not kept.
    pub fn to_toml(&self) -> Result<String, ManifestError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Atomically replace the manifest at `path`.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<(), ManifestError> {
        let path = path.as_ref();
        let content = self.to_toml()?;
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        std::io::Write::write_all(&mut tmp, content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| ManifestError::Io(e.error))?;
        Ok(())
    }

    /// Pin every mod the lock file knows to its locked version and checksum.
    /// The extras archive is pinned the same way.
    ///
    /// Returns the ids whose declaration changed. Mods missing from the lock
    /// are left alone.
    pub fn pin_from_lock(&mut self, lock: &LockFile) -> Vec<String> {
        let mut changed = Vec::new();
        if let (Some(section), Some(locked)) = (self.extras.as_mut(), lock.extras.as_ref()) {
            let checksum = locked.checksum.to_string();
            if section.version != locked.version
                || section.checksum.as_deref() != Some(checksum.as_str())
            {
                section.version.clone_from(&locked.version);
                section.checksum = Some(checksum);
                changed.push(EXTRAS_ID.to_owned());
            }
        }
        for section in &mut self.mods {
            let Some(locked) = lock.get(section.id.trim()) else {
                continue;
            };
            let checksum = locked.checksum.to_string();
            if section.version == locked.version
                && section.checksum.as_deref() == Some(checksum.as_str())
            {
                continue;
            }
            section.version.clone_from(&locked.version);
            section.checksum = Some(checksum);
            changed.push(section.id.clone());
        }
        changed
    }
}
