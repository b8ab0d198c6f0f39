use crate::provider::expect_kind;
use crate::{Release, ReleaseProvider, RemoteError, Transport};
use packsmith_schema::{
    is_safe_relative_path, parse_release_version, Checksum, ProviderKind, SourceDescriptor,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One entry of a mirror's `<base>/<name>/index.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorIndexEntry {
    pub version: String,
    /// File name relative to `<base>/<name>/`.
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<Checksum>,
}

/// A static mirror laid out as `<base>/<name>/index.json` plus the files it lists.
pub struct MirrorProvider {
    transport: Arc<dyn Transport>,
    default_base: Option<String>,
}

impl MirrorProvider {
    pub fn new(transport: Arc<dyn Transport>, default_base: Option<String>) -> Self {
        Self {
            transport,
            default_base: default_base.map(|b| b.trim_end_matches('/').to_owned()),
        }
    }

    fn location<'a>(
        &'a self,
        source: &'a SourceDescriptor,
    ) -> Result<(&'a str, &'a str), RemoteError> {
        expect_kind(ProviderKind::Mirror, source)?;
        let SourceDescriptor::Mirror { url, name } = source else {
            return Err(RemoteError::Config("not a mirror source".to_owned()));
        };
        let base = url
            .as_deref()
            .or(self.default_base.as_deref())
            .ok_or_else(|| {
                RemoteError::Config(format!(
                    "mirror source '{name}' has no url and no mirror_url is configured"
                ))
            })?;
        Ok((base, name.as_str()))
    }

    fn index(&self, base: &str, name: &str) -> Result<Vec<MirrorIndexEntry>, RemoteError> {
        let url = format!("{base}/{name}/index.json");
        let body = self.transport.get(&url)?;
        serde_json::from_slice(&body)
            .map_err(|e| RemoteError::Serialization(format!("{url}: {e}")))
    }

    fn to_release(base: &str, name: &str, entry: &MirrorIndexEntry) -> Option<Release> {
        if !is_safe_relative_path(&entry.file) {
            tracing::warn!("mirror {base}/{name}: skipping unsafe file '{}'", entry.file);
            return None;
        }
        let file_name = entry.file.rsplit('/').next()?.to_owned();
        Some(Release {
            version: entry.version.clone(),
            url: format!("{base}/{name}/{}", entry.file),
            file_name,
            checksum: entry.checksum.clone(),
        })
    }
}

impl ReleaseProvider for MirrorProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Mirror
    }

    fn list_releases(&self, source: &SourceDescriptor) -> Result<Vec<Release>, RemoteError> {
        let (base, name) = self.location(source)?;
        Ok(self
            .index(base, name)?
            .iter()
            .filter_map(|e| Self::to_release(base, name, e))
            .collect())
    }

    fn get_release(
        &self,
        source: &SourceDescriptor,
        version: &str,
    ) -> Result<Release, RemoteError> {
        let (base, name) = self.location(source)?;
        let index = self.index(base, name)?;
        let wanted = parse_release_version(version);
        let found = index
            .iter()
            .find(|e| e.version == version)
            .or_else(|| {
                let wanted = wanted.as_ref()?;
                index
                    .iter()
                    .find(|e| parse_release_version(&e.version).as_ref() == Some(wanted))
            });
        found
            .and_then(|e| Self::to_release(base, name, e))
            .ok_or_else(|| RemoteError::NotFound(format!("{base}/{name}@{version}")))
    }
}
