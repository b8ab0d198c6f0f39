use semver::{Version, VersionReq};
use std::fmt;

/// Which release of a mod the manifest asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionSelector {
    /// A pinned version. The raw text is kept because upstream tags are not
    /// always normalized (`v1.2`, `1.2.0-GTNH`).
    Exact { raw: String, version: Version },
    /// The highest stable release.
    Latest,
    /// The highest release satisfying the requirement.
    Range(VersionReq),
}

impl VersionSelector {
    /// Parse a selector string. Returns `None` if it is neither `latest`, a
    /// version, nor a semver requirement.
    pub fn parse(input: &str) -> Option<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.eq_ignore_ascii_case("latest") || trimmed == "*" {
            return Some(VersionSelector::Latest);
        }
        if let Some(version) = parse_release_version(trimmed) {
            return Some(VersionSelector::Exact {
                raw: trimmed.to_owned(),
                version,
            });
        }
        VersionReq::parse(trimmed).ok().map(VersionSelector::Range)
    }

    pub fn is_exact(&self) -> bool {
        matches!(self, VersionSelector::Exact { .. })
    }

    /// Whether a release version satisfies this selector.
    ///
    /// Prerelease versions only satisfy `Latest` when `allow_prerelease` is set;
    /// `Range` follows semver's own prerelease rules.
    pub fn accepts(&self, version: &Version, allow_prerelease: bool) -> bool {
        match self {
            VersionSelector::Exact { version: pinned, .. } => pinned == version,
            VersionSelector::Latest => allow_prerelease || version.pre.is_empty(),
            VersionSelector::Range(req) => req.matches(version),
        }
    }
}

impl fmt::Display for VersionSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionSelector::Exact { raw, .. } => f.write_str(raw),
            VersionSelector::Latest => f.write_str("latest"),
            VersionSelector::Range(req) => write!(f, "{req}"),
        }
    }
}

/// Leniently parse a release tag as a semantic version.
///
/// Accepts a leading `v`/`V` and pads `major.minor` to `major.minor.0`.
/// Build metadata is kept as-is.
pub fn parse_release_version(tag: &str) -> Option<Version> {
    let trimmed = tag.trim();
    let stripped = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);
    if !stripped.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    if let Ok(v) = Version::parse(stripped) {
        return Some(v);
    }

    // `1.2` or `1.2-pre`: pad the numeric core.
    let split_at = stripped.find(['-', '+']).unwrap_or(stripped.len());
    let (core, rest) = stripped.split_at(split_at);
    if core.split('.').count() == 2 {
        return Version::parse(&format!("{core}.0{rest}")).ok();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_aliases() {
        assert_eq!(VersionSelector::parse("latest"), Some(VersionSelector::Latest));
        assert_eq!(VersionSelector::parse("LATEST"), Some(VersionSelector::Latest));
        assert_eq!(VersionSelector::parse("*"), Some(VersionSelector::Latest));
    }

    #[test]
    fn exact_keeps_raw_tag() {
        let sel = VersionSelector::parse("v1.2").unwrap();
        match &sel {
            VersionSelector::Exact { raw, version } => {
                assert_eq!(raw, "v1.2");
                assert_eq!(version, &Version::new(1, 2, 0));
            }
            other => panic!("expected exact, got {other:?}"),
        }
        assert_eq!(sel.to_string(), "v1.2");
    }

    #[test]
    fn range_parses() {
        let sel = VersionSelector::parse(">=1.2, <2").unwrap();
        assert!(matches!(sel, VersionSelector::Range(_)));
        assert!(sel.accepts(&Version::new(1, 9, 3), false));
        assert!(!sel.accepts(&Version::new(2, 0, 0), false));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(VersionSelector::parse("").is_none());
        assert!(VersionSelector::parse("not a version").is_none());
    }

    #[test]
    fn latest_skips_prereleases_unless_allowed() {
        let pre = Version::parse("2.0.0-beta.1").unwrap();
        assert!(!VersionSelector::Latest.accepts(&pre, false));
        assert!(VersionSelector::Latest.accepts(&pre, true));
    }

    #[test]
    fn lenient_release_parsing() {
        assert_eq!(parse_release_version("1.0.0"), Some(Version::new(1, 0, 0)));
        assert_eq!(parse_release_version("V3.4.5"), Some(Version::new(3, 4, 5)));
        assert_eq!(
            parse_release_version("2.1-GTNH"),
            Some(Version::parse("2.1.0-GTNH").unwrap())
        );
        assert_eq!(parse_release_version("release-7"), None);
        assert_eq!(parse_release_version("1"), None);
    }
}
