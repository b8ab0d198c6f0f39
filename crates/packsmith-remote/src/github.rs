use crate::provider::expect_kind;
use crate::{Release, ReleaseProvider, RemoteError, Transport};
use packsmith_schema::{
    parse_release_version, Checksum, ProviderKind, RepoSlug, SourceDescriptor,
};
use serde::Deserialize;
use std::sync::Arc;

const PAGE_SIZE: usize = 100;
const MAX_PAGES: usize = 10;

/// Artifact classifiers that are never the installable jar.
const SECONDARY_SUFFIXES: &[&str] = &["-dev.jar", "-sources.jar", "-api.jar", "-javadoc.jar"];

#[derive(Debug, Deserialize)]
struct GhRelease {
    tag_name: String,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    prerelease: bool,
    #[serde(default)]
    assets: Vec<GhAsset>,
}

#[derive(Debug, Deserialize)]
struct GhAsset {
    name: String,
    browser_download_url: String,
    #[serde(default)]
    digest: Option<String>,
}

/// Releases attached to a GitHub repository.
pub struct GithubProvider {
    transport: Arc<dyn Transport>,
    api: String,
}

impl GithubProvider {
    pub fn new(transport: Arc<dyn Transport>, api: &str) -> Self {
        Self {
            transport,
            api: api.trim_end_matches('/').to_owned(),
        }
    }

    fn repo_url(&self, repo: &RepoSlug) -> String {
        format!("{}/repos/{repo}", self.api)
    }

    fn parse<T: serde::de::DeserializeOwned>(url: &str, body: &[u8]) -> Result<T, RemoteError> {
        serde_json::from_slice(body)
            .map_err(|e| RemoteError::Serialization(format!("{url}: {e}")))
    }

    /// Every usable release of `repo`, newest page first.
    fn collect_releases(
        &self,
        repo: &RepoSlug,
        asset: Option<&str>,
        prerelease: bool,
    ) -> Result<Vec<Release>, RemoteError> {
        let mut releases = Vec::new();
        for page in 1..=MAX_PAGES {
            let url = format!(
                "{}/releases?per_page={PAGE_SIZE}&page={page}",
                self.repo_url(repo)
            );
            let body = self.transport.get(&url)?;
            let batch: Vec<GhRelease> = Self::parse(&url, &body)?;
            let count = batch.len();
            for release in &batch {
                if release.draft || (release.prerelease && !prerelease) {
                    continue;
                }
                match Self::to_release(release, asset) {
                    Some(r) => releases.push(r),
                    None => tracing::debug!(
                        "{repo}@{}: no matching asset, skipping",
                        release.tag_name
                    ),
                }
            }
            if count < PAGE_SIZE {
                break;
            }
        }
        tracing::debug!("{repo}: {} usable releases", releases.len());
        Ok(releases)
    }

    fn to_release(release: &GhRelease, asset_pattern: Option<&str>) -> Option<Release> {
        let asset = select_asset(&release.assets, asset_pattern)?;
        let checksum = asset.digest.as_deref().and_then(|d| match Checksum::parse(d) {
            Ok(sum) => Some(sum),
            Err(e) => {
                tracing::warn!(
                    "ignoring unparseable digest on {}@{}: {e}",
                    asset.name,
                    release.tag_name
                );
                None
            }
        });
        Some(Release {
            version: release.tag_name.clone(),
            url: asset.browser_download_url.clone(),
            file_name: asset.name.clone(),
            checksum,
        })
    }
}

fn github_parts(source: &SourceDescriptor) -> Option<(&RepoSlug, Option<&str>, bool)> {
    match source {
        SourceDescriptor::Github {
            repo,
            asset,
            prerelease,
        } => Some((repo, asset.as_deref(), *prerelease)),
        _ => None,
    }
}

/// Pick the asset to install from a release.
///
/// With a pattern, the asset name must match it (one `*` wildcard allowed).
/// Without one, the first `.jar` that is not a dev/sources/api/javadoc
/// classifier wins.
fn select_asset<'a>(assets: &'a [GhAsset], pattern: Option<&str>) -> Option<&'a GhAsset> {
    match pattern {
        Some(p) => assets.iter().find(|a| matches_pattern(&a.name, p)),
        None => assets.iter().find(|a| {
            let lower = a.name.to_ascii_lowercase();
            lower.ends_with(".jar") && !SECONDARY_SUFFIXES.iter().any(|s| lower.ends_with(s))
        }),
    }
}

fn matches_pattern(name: &str, pattern: &str) -> bool {
    match pattern.split_once('*') {
        Some((prefix, suffix)) => {
            name.len() >= prefix.len() + suffix.len()
                && name.starts_with(prefix)
                && name.ends_with(suffix)
        }
        None => name == pattern,
    }
}

/// Tags a pinned version may have been published under.
fn tag_candidates(version: &str) -> Vec<String> {
    let mut tags = vec![version.to_owned()];
    match version.strip_prefix('v') {
        Some(bare) => tags.push(bare.to_owned()),
        None => tags.push(format!("v{version}")),
    }
    tags
}

impl ReleaseProvider for GithubProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Github
    }

    fn list_releases(&self, source: &SourceDescriptor) -> Result<Vec<Release>, RemoteError> {
        expect_kind(ProviderKind::Github, source)?;
        let Some((repo, asset, prerelease)) = github_parts(source) else {
            return Ok(Vec::new());
        };
        self.collect_releases(repo, asset, prerelease)
    }

    fn get_release(
        &self,
        source: &SourceDescriptor,
        version: &str,
    ) -> Result<Release, RemoteError> {
        expect_kind(ProviderKind::Github, source)?;
        let Some((repo, asset, _)) = github_parts(source) else {
            return Err(RemoteError::NotFound(version.to_owned()));
        };

        for tag in tag_candidates(version) {
            let url = format!("{}/releases/tags/{tag}", self.repo_url(repo));
            let body = match self.transport.get(&url) {
                Ok(body) => body,
                Err(RemoteError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            let release: GhRelease = Self::parse(&url, &body)?;
            if release.draft {
                continue;
            }
            return Self::to_release(&release, asset).ok_or_else(|| {
                RemoteError::NotFound(format!("{repo}@{tag}: no matching release asset"))
            });
        }

        // Locked versions are normalized (`1.2` is recorded as `1.2.0`), so a
        // tag that is spelled differently is only found by comparing versions.
        let wanted = parse_release_version(version)
            .ok_or_else(|| RemoteError::NotFound(format!("{repo}@{version}")))?;
        tracing::debug!("{repo}: no tag named {version}, searching releases");
        self.collect_releases(repo, asset, true)?
            .into_iter()
            .find(|r| parse_release_version(&r.version).as_ref() == Some(&wanted))
            .ok_or_else(|| RemoteError::NotFound(format!("{repo}@{version}")))
    }
}
