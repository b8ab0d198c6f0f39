use crate::{
    DirectUrlProvider, GithubProvider, MirrorProvider, RemoteConfig, RemoteError, Transport,
};
use packsmith_schema::{Checksum, ProviderKind, SourceDescriptor};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One downloadable release as a provider publishes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    /// Version string as published (a tag name, an index entry).
    pub version: String,
    pub url: String,
    pub file_name: String,
    /// Digest the provider publishes alongside the file, if any.
    pub checksum: Option<Checksum>,
}

/// Capability to enumerate and look up releases for one kind of source.
pub trait ReleaseProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// All releases the source currently offers. Order is unspecified.
    fn list_releases(&self, source: &SourceDescriptor) -> Result<Vec<Release>, RemoteError>;

    /// The release published as `version`. `RemoteError::NotFound` if it is gone.
    fn get_release(&self, source: &SourceDescriptor, version: &str)
        -> Result<Release, RemoteError>;
}

/// Reject a source that belongs to another provider family.
pub(crate) fn expect_kind(
    provider: ProviderKind,
    source: &SourceDescriptor,
) -> Result<(), RemoteError> {
    if source.kind() == provider {
        Ok(())
    } else {
        Err(RemoteError::SourceMismatch {
            provider,
            found: source.kind(),
        })
    }
}

/// Last path segment of a URL, without query or fragment.
pub(crate) fn file_name_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let name = path.rsplit('/').next()?;
    if name.is_empty() || name == ".." || name == "." || name.contains(':') {
        None
    } else {
        Some(name.to_owned())
    }
}

/// Providers keyed by the source kind they serve.
#[derive(Default)]
pub struct ProviderSet {
    providers: BTreeMap<ProviderKind, Box<dyn ReleaseProvider>>,
}

impl ProviderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// GitHub, direct URL, and mirror providers sharing one transport.
    pub fn standard(config: &RemoteConfig, transport: &Arc<dyn Transport>) -> Self {
        Self::new()
            .with(GithubProvider::new(
                Arc::clone(transport),
                &config.github_api,
            ))
            .with(DirectUrlProvider::new(Arc::clone(transport)))
            .with(MirrorProvider::new(
                Arc::clone(transport),
                config.mirror_url.clone(),
            ))
    }

    #[must_use]
    pub fn with(mut self, provider: impl ReleaseProvider + 'static) -> Self {
        self.insert(Box::new(provider));
        self
    }

    /// Register a provider, replacing any previous one of the same kind.
    pub fn insert(&mut self, provider: Box<dyn ReleaseProvider>) {
        self.providers.insert(provider.kind(), provider);
    }

    pub fn get(&self, kind: ProviderKind) -> Option<&dyn ReleaseProvider> {
        self.providers.get(&kind).map(|p| &**p as &dyn ReleaseProvider)
    }

    pub fn kinds(&self) -> Vec<ProviderKind> {
        self.providers.keys().copied().collect()
    }
}

impl std::fmt::Debug for ProviderSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSet")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryTransport;

    #[test]
    fn standard_set_covers_every_kind() {
        let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        let set = ProviderSet::standard(&RemoteConfig::default(), &transport);
        assert_eq!(
            set.kinds(),
            vec![ProviderKind::Github, ProviderKind::Url, ProviderKind::Mirror]
        );
        assert_eq!(
            set.get(ProviderKind::Mirror).map(|p| p.kind()),
            Some(ProviderKind::Mirror)
        );
    }

    #[test]
    fn empty_set_has_no_providers() {
        let set = ProviderSet::new();
        assert!(set.get(ProviderKind::Github).is_none());
    }

    #[test]
    fn file_names_from_urls() {
        assert_eq!(
            file_name_from_url("https://cdn.example.com/a/modB-3.1.0.jar?x=1").as_deref(),
            Some("modB-3.1.0.jar")
        );
        assert_eq!(file_name_from_url("https://cdn.example.com/"), None);
    }

    #[test]
    fn mismatched_source_is_rejected() {
        let source = SourceDescriptor::Url {
            url: "https://example.com/a.jar".to_owned(),
        };
        assert!(matches!(
            expect_kind(ProviderKind::Github, &source),
            Err(RemoteError::SourceMismatch { .. })
        ));
        assert!(expect_kind(ProviderKind::Url, &source).is_ok());
    }
}
