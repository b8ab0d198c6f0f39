use crate::provider::{expect_kind, file_name_from_url};
use crate::{Release, ReleaseProvider, RemoteError, Transport};
use packsmith_schema::{ProviderKind, SourceDescriptor};
use std::sync::Arc;

/// A fixed download URL, optionally templated with `{version}`.
///
/// There is no way to enumerate what a plain URL offers, so only pinned
/// versions resolve. Existence is confirmed with a HEAD request.
pub struct DirectUrlProvider {
    transport: Arc<dyn Transport>,
}

impl DirectUrlProvider {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

/// Substitute `{version}` into a URL template.
pub fn expand_url(template: &str, version: &str) -> String {
    template.replace("{version}", version)
}

impl ReleaseProvider for DirectUrlProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Url
    }

    fn list_releases(&self, source: &SourceDescriptor) -> Result<Vec<Release>, RemoteError> {
        expect_kind(ProviderKind::Url, source)?;
        Err(RemoteError::Unsupported {
            provider: ProviderKind::Url,
            operation: "listing releases",
        })
    }

    fn get_release(
        &self,
        source: &SourceDescriptor,
        version: &str,
    ) -> Result<Release, RemoteError> {
        expect_kind(ProviderKind::Url, source)?;
        let SourceDescriptor::Url { url: template } = source else {
            return Err(RemoteError::NotFound(version.to_owned()));
        };
        let url = expand_url(template, version);
        let file_name =
            file_name_from_url(&url).ok_or_else(|| RemoteError::InvalidUrl(url.clone()))?;

        match self.transport.head(&url)? {
            404 | 410 => Err(RemoteError::NotFound(url)),
            code if code >= 400 && code != 405 => Err(RemoteError::Status { url, code }),
            // Some hosts refuse HEAD; let the download itself decide.
            _ => Ok(Release {
                version: version.to_owned(),
                url,
                file_name,
                checksum: None,
            }),
        }
    }
}
