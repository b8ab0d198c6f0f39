use crate::checksum::Checksum;
use crate::manifest::{ExtrasSection, ManifestError, ManifestV1, ModSection, Side, SourceSection};
use crate::selector::VersionSelector;
use crate::types::{ModId, RepoSlug};
use std::collections::BTreeSet;

/// Directory, relative to the pack root, that mods land in unless overridden.
pub const DEFAULT_INSTALL_DIR: &str = "mods";

/// Id the extras archive is tracked under. Mods may not use it.
pub const EXTRAS_ID: &str = "@extras";

/// Mirror name used for the extras archive when the source gives none.
const EXTRAS_MIRROR_NAME: &str = "extras";

/// Canonical, validated representation of a parsed manifest.
///
/// Entries are sorted by id and guaranteed unique. This is the only form the
/// resolution pipeline accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedManifest {
    pub manifest_version: u32,
    pub pack_name: String,
    pub pack_version: Option<String>,
    pub entries: Vec<ManifestEntry>,
    pub extras: Option<PackExtras>,
}

/// The extras archive: resolved like a mod, then unpacked into the pack root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackExtras {
    /// Resolution details. Its id is always [`EXTRAS_ID`].
    pub entry: ManifestEntry,
    pub client_exclusions: Vec<String>,
    pub server_exclusions: Vec<String>,
}

impl PackExtras {
    /// Exclusions that apply when building for `side`. A combined pack keeps everything.
    pub fn exclusions(&self, side: Side) -> &[String] {
        match side {
            Side::Both => &[],
            Side::Client => &self.client_exclusions,
            Side::Server => &self.server_exclusions,
        }
    }

    /// Whether the archive member at `path` is left out for `side`.
    ///
    /// An exclusion matches the path itself or anything below it.
    pub fn is_excluded(&self, path: &str, side: Side) -> bool {
        self.exclusions(side).iter().any(|excluded| {
            path == excluded
                || path
                    .strip_prefix(excluded.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }
}

/// One declared mod, ready for resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub id: ModId,
    pub selector: VersionSelector,
    pub source: SourceDescriptor,
    pub checksum: Option<Checksum>,
    pub side: Side,
    pub install_dir: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceDescriptor {
    Github {
        repo: RepoSlug,
        asset: Option<String>,
        prerelease: bool,
    },
    Url {
        url: String,
    },
    Mirror {
        url: Option<String>,
        name: String,
    },
}

/// Provider families. Each has exactly one provider implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProviderKind {
    Github,
    Url,
    Mirror,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Github => "github",
            ProviderKind::Url => "url",
            ProviderKind::Mirror => "mirror",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SourceDescriptor {
    pub fn kind(&self) -> ProviderKind {
        match self {
            SourceDescriptor::Github { .. } => ProviderKind::Github,
            SourceDescriptor::Url { .. } => ProviderKind::Url,
            SourceDescriptor::Mirror { .. } => ProviderKind::Mirror,
        }
    }

    /// Whether prerelease versions may be selected for `latest`.
    pub fn allows_prerelease(&self) -> bool {
        matches!(
            self,
            SourceDescriptor::Github {
                prerelease: true,
                ..
            }
        )
    }
}

impl ManifestEntry {
    /// Pack-relative path a file with this name is installed at.
    pub fn install_path(&self, file_name: &str) -> String {
        format!("{}/{file_name}", self.install_dir)
    }
}

impl ManifestV1 {
    /// Normalize the manifest: validate every entry, reject duplicates, sort by id.
    pub fn normalize(&self) -> Result<NormalizedManifest, ManifestError> {
        if self.manifest_version != 1 {
            return Err(ManifestError::UnsupportedVersion(self.manifest_version));
        }

        let pack_name = self.pack.name.trim().to_owned();
        if pack_name.is_empty() {
            return Err(ManifestError::EmptyPackName);
        }

        let mut seen = BTreeSet::new();
        let mut entries = Vec::with_capacity(self.mods.len());
        for (index, section) in self.mods.iter().enumerate() {
            let entry = normalize_entry(index, section)?;
            if entry.id == EXTRAS_ID {
                return Err(ManifestError::ReservedId(entry.id.into_inner()));
            }
            if !seen.insert(entry.id.clone()) {
                return Err(ManifestError::DuplicateMod(entry.id.into_inner()));
            }
            entries.push(entry);
        }
        entries.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(NormalizedManifest {
            manifest_version: self.manifest_version,
            pack_name,
            pack_version: self
                .pack
                .version
                .as_ref()
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty()),
            entries,
            extras: self.extras.as_ref().map(normalize_extras).transpose()?,
        })
    }
}

impl NormalizedManifest {
    /// Keep only the entries that belong in a pack for `side`.
    #[must_use]
    pub fn for_side(&self, side: Side) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .filter(|e| e.side.includes(side))
                .cloned()
                .collect(),
            ..self.clone()
        }
    }

    pub fn get(&self, id: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.id == id)
    }
}

fn normalize_entry(index: usize, section: &ModSection) -> Result<ManifestEntry, ManifestError> {
    let id = section.id.trim();
    if id.is_empty() {
        return Err(ManifestError::EmptyModId(index));
    }

    let selector =
        VersionSelector::parse(&section.version).ok_or_else(|| ManifestError::InvalidSelector {
            id: id.to_owned(),
            selector: section.version.clone(),
        })?;

    let checksum = section
        .checksum
        .as_deref()
        .map(Checksum::parse)
        .transpose()
        .map_err(|source| ManifestError::InvalidChecksum {
            id: id.to_owned(),
            source,
        })?;

    let source = match &section.source {
        SourceSection::Github {
            repo,
            asset,
            prerelease,
        } => {
            let slug = RepoSlug::new(repo.trim());
            if slug.split().is_none() {
                return Err(ManifestError::InvalidRepo {
                    id: id.to_owned(),
                    repo: repo.clone(),
                });
            }
            SourceDescriptor::Github {
                repo: slug,
                asset: asset.as_ref().map(|a| a.trim().to_owned()).filter(|a| !a.is_empty()),
                prerelease: *prerelease,
            }
        }
        SourceSection::Url { url } => {
            let url = url.trim();
            if !is_http_url(url) {
                return Err(ManifestError::InvalidUrl {
                    id: id.to_owned(),
                    url: url.to_owned(),
                });
            }
            if !selector.is_exact() {
                return Err(ManifestError::UnpinnedUrlSource {
                    id: id.to_owned(),
                    selector: selector.to_string(),
                });
            }
            SourceDescriptor::Url {
                url: url.to_owned(),
            }
        }
        SourceSection::Mirror { url, name } => {
            let url = url.as_ref().map(|u| u.trim().trim_end_matches('/').to_owned());
            if let Some(ref u) = url {
                if !is_http_url(u) {
                    return Err(ManifestError::InvalidUrl {
                        id: id.to_owned(),
                        url: u.clone(),
                    });
                }
            }
            SourceDescriptor::Mirror {
                url,
                name: name
                    .as_ref()
                    .map(|n| n.trim().to_owned())
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| id.to_owned()),
            }
        }
    };

    let install_dir = normalize_install_dir(id, section.install_dir.as_deref())?;

    Ok(ManifestEntry {
        id: ModId::new(id),
        selector,
        source,
        checksum,
        side: section.side,
        install_dir,
    })
}

fn normalize_extras(section: &ExtrasSection) -> Result<PackExtras, ManifestError> {
    let as_mod = ModSection {
        id: EXTRAS_ID.to_owned(),
        version: section.version.clone(),
        checksum: section.checksum.clone(),
        side: Side::Both,
        install_dir: None,
        source: section.source.clone(),
    };
    let mut entry = normalize_entry(0, &as_mod)?;
    if let SourceDescriptor::Mirror { name, .. } = &mut entry.source {
        if name == EXTRAS_ID {
            *name = EXTRAS_MIRROR_NAME.to_owned();
        }
    }

    Ok(PackExtras {
        entry,
        client_exclusions: normalize_exclusions(&section.client_exclusions)?,
        server_exclusions: normalize_exclusions(&section.server_exclusions)?,
    })
}

fn normalize_exclusions(raw: &[String]) -> Result<Vec<String>, ManifestError> {
    let mut cleaned = BTreeSet::new();
    for exclusion in raw {
        let unified = exclusion.trim().replace('\\', "/");
        let trimmed = unified.trim_end_matches('/');
        if !is_safe_relative_path(trimmed) {
            return Err(ManifestError::UnsafeExclusion(exclusion.clone()));
        }
        cleaned.insert(trimmed.to_owned());
    }
    Ok(cleaned.into_iter().collect())
}

fn is_http_url(url: &str) -> bool {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"));
    matches!(rest, Some(r) if !r.is_empty())
}

/// Whether `path` is a non-empty relative path that cannot escape its root.
pub fn is_safe_relative_path(path: &str) -> bool {
    let unified = path.replace('\\', "/");
    if unified.is_empty() || unified.starts_with('/') || unified.contains(':') {
        return false;
    }
    unified
        .split('/')
        .all(|part| !part.is_empty() && part != "." && part != "..")
}

fn normalize_install_dir(id: &str, dir: Option<&str>) -> Result<String, ManifestError> {
    let Some(raw) = dir else {
        return Ok(DEFAULT_INSTALL_DIR.to_owned());
    };
    let unsafe_dir = || ManifestError::UnsafeInstallDir {
        id: id.to_owned(),
        dir: raw.to_owned(),
    };

    let unified = raw.trim().replace('\\', "/");
    if unified.starts_with('/') || unified.contains(':') {
        return Err(unsafe_dir());
    }
    let parts: Vec<&str> = unified
        .split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .collect();
    if parts.is_empty() || parts.iter().any(|p| *p == "..") {
        return Err(unsafe_dir());
    }
    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::parse_manifest_str;

    fn manifest_with_mods(mods: &str) -> String {
        format!("manifest_version = 1\n[pack]\nname = \"p\"\n{mods}")
    }

    #[test]
    fn sorts_entries_by_id() {
        let input = manifest_with_mods(
            r#"
[[mods]]
id = "zeta"
[mods.source]
provider = "github"
repo = "o/zeta"

[[mods]]
id = "alpha"
[mods.source]
provider = "github"
repo = "o/alpha"
"#,
        );
        let normalized = parse_manifest_str(&input).unwrap().normalize().unwrap();
        let ids: Vec<&str> = normalized.entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
        assert_eq!(normalized.entries[0].install_dir, DEFAULT_INSTALL_DIR);
        assert_eq!(normalized.entries[0].selector, VersionSelector::Latest);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let input = manifest_with_mods(
            r#"
[[mods]]
id = "dup"
[mods.source]
provider = "mirror"

[[mods]]
id = " dup "
[mods.source]
provider = "mirror"
"#,
        );
        let err = parse_manifest_str(&input).unwrap().normalize().unwrap_err();
        assert!(matches!(err, ManifestError::DuplicateMod(ref id) if id == "dup"));
    }

    #[test]
    fn url_source_requires_exact_pin() {
        let input = manifest_with_mods(
            r#"
[[mods]]
id = "direct"
version = "latest"
[mods.source]
provider = "url"
url = "https://example.com/direct.jar"
"#,
        );
        let err = parse_manifest_str(&input).unwrap().normalize().unwrap_err();
        assert!(matches!(err, ManifestError::UnpinnedUrlSource { .. }));
    }

    #[test]
    fn unsafe_install_dirs_are_rejected() {
        for dir in ["../outside", "/abs", "C:/win", "mods/../../x", ""] {
            let input = manifest_with_mods(&format!(
                r#"
[[mods]]
id = "m"
install_dir = "{dir}"
[mods.source]
provider = "mirror"
"#
            ));
            let err = parse_manifest_str(&input).unwrap().normalize().unwrap_err();
            assert!(
                matches!(err, ManifestError::UnsafeInstallDir { .. }),
                "{dir} should be rejected, got {err}"
            );
        }
    }

    #[test]
    fn install_dir_is_cleaned() {
        let input = manifest_with_mods(
            r#"
[[mods]]
id = "m"
install_dir = "./config\\extra/"
[mods.source]
provider = "mirror"
"#,
        );
        let normalized = parse_manifest_str(&input).unwrap().normalize().unwrap();
        assert_eq!(normalized.entries[0].install_dir, "config/extra");
        assert_eq!(
            normalized.entries[0].install_path("m-1.0.jar"),
            "config/extra/m-1.0.jar"
        );
    }

    #[test]
    fn invalid_checksum_and_repo_are_reported() {
        let bad_sum = manifest_with_mods(
            r#"
[[mods]]
id = "m"
checksum = "abc123"
[mods.source]
provider = "mirror"
"#,
        );
        assert!(matches!(
            parse_manifest_str(&bad_sum).unwrap().normalize(),
            Err(ManifestError::InvalidChecksum { .. })
        ));

        let bad_repo = manifest_with_mods(
            r#"
[[mods]]
id = "m"
[mods.source]
provider = "github"
repo = "just-a-name"
"#,
        );
        assert!(matches!(
            parse_manifest_str(&bad_repo).unwrap().normalize(),
            Err(ManifestError::InvalidRepo { .. })
        ));
    }

    #[test]
    fn mirror_name_defaults_to_id() {
        let input = manifest_with_mods(
            r#"
[[mods]]
id = "ae2"
[mods.source]
provider = "mirror"
url = "https://mirror.example.com/packs/"
"#,
        );
        let normalized = parse_manifest_str(&input).unwrap().normalize().unwrap();
        assert_eq!(
            normalized.entries[0].source,
            SourceDescriptor::Mirror {
                url: Some("https://mirror.example.com/packs".to_owned()),
                name: "ae2".to_owned(),
            }
        );
    }

    #[test]
    fn side_filter_keeps_shared_entries() {
        let input = manifest_with_mods(
            r#"
[[mods]]
id = "client-only"
side = "client"
[mods.source]
provider = "mirror"

[[mods]]
id = "server-only"
side = "server"
[mods.source]
provider = "mirror"

[[mods]]
id = "shared"
[mods.source]
provider = "mirror"
"#,
        );
        let normalized = parse_manifest_str(&input).unwrap().normalize().unwrap();
        let server = normalized.for_side(Side::Server);
        let ids: Vec<&str> = server.entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["server-only", "shared"]);
        assert_eq!(normalized.for_side(Side::Both).entries.len(), 3);
    }

    #[test]
    fn safe_relative_paths() {
        assert!(is_safe_relative_path("mods/a.jar"));
        assert!(!is_safe_relative_path("mods/../a.jar"));
        assert!(!is_safe_relative_path("/etc/passwd"));
        assert!(!is_safe_relative_path("mods//a.jar"));
        assert!(!is_safe_relative_path(""));
    }

    #[test]
    fn extras_section_is_normalized() {
        let input = manifest_with_mods(
            r#"
[extras]
version = "2.7.0"
client_exclusions = ["serverutilities/", "config\\server.cfg"]
server_exclusions = ["resourcepacks"]
[extras.source]
provider = "mirror"
url = "https://mirror.example.com/"
"#,
        );
        let normalized = parse_manifest_str(&input).unwrap().normalize().unwrap();
        let extras = normalized.extras.expect("extras present");
        assert_eq!(extras.entry.id, EXTRAS_ID);
        assert_eq!(extras.entry.selector, VersionSelector::parse("2.7.0").unwrap());
        assert_eq!(
            extras.entry.source,
            SourceDescriptor::Mirror {
                url: Some("https://mirror.example.com".to_owned()),
                name: "extras".to_owned(),
            }
        );
        assert_eq!(
            extras.client_exclusions,
            vec!["config/server.cfg".to_owned(), "serverutilities".to_owned()]
        );

        assert!(extras.is_excluded("serverutilities/ranks.txt", Side::Client));
        assert!(extras.is_excluded("config/server.cfg", Side::Client));
        assert!(!extras.is_excluded("config/server.cfg.bak", Side::Client));
        assert!(!extras.is_excluded("serverutilities-notes.txt", Side::Client));
        assert!(extras.is_excluded("resourcepacks/a.zip", Side::Server));
        assert!(!extras.is_excluded("resourcepacks/a.zip", Side::Both));
    }

    #[test]
    fn extras_exclusions_must_stay_inside_the_pack() {
        for bad in ["../up", "/etc", ""] {
            let input = manifest_with_mods(&format!(
                r#"
[extras]
client_exclusions = ["{bad}"]
[extras.source]
provider = "mirror"
"#
            ));
            let err = parse_manifest_str(&input).unwrap().normalize().unwrap_err();
            assert!(
                matches!(err, ManifestError::UnsafeExclusion(_)),
                "{bad:?} should be rejected, got {err}"
            );
        }
    }

    #[test]
    fn extras_id_is_reserved_for_mods() {
        let input = manifest_with_mods(
            r#"
[[mods]]
id = "@extras"
[mods.source]
provider = "mirror"
"#,
        );
        let err = parse_manifest_str(&input).unwrap().normalize().unwrap_err();
        assert!(matches!(err, ManifestError::ReservedId(ref id) if id == "@extras"));
    }

    #[test]
    fn rejects_unsupported_version() {
        let input = "manifest_version = 2\n[pack]\nname = \"p\"\n";
        assert!(matches!(
            parse_manifest_str(input).unwrap().normalize(),
            Err(ManifestError::UnsupportedVersion(2))
        ));
    }
}
