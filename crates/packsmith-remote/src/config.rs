use crate::RemoteError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_GITHUB_API: &str = "https://api.github.com";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Environment variable that overrides `github_token`.
pub const GITHUB_TOKEN_ENV: &str = "GITHUB_TOKEN";
/// Environment variable that points at an alternative config file.
pub const CONFIG_PATH_ENV: &str = "PACKSMITH_REMOTE_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub github_api: String,
    pub github_token: Option<String>,
    /// Base URL for `mirror` sources that do not name their own.
    pub mirror_url: Option<String>,
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            github_api: DEFAULT_GITHUB_API.to_owned(),
            github_token: None,
            mirror_url: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            user_agent: format!("packsmith/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl RemoteConfig {
    #[must_use]
    pub fn with_token(mut self, token: &str) -> Self {
        self.github_token = Some(token.to_owned());
        self
    }

    #[must_use]
    pub fn with_mirror(mut self, url: &str) -> Self {
        self.mirror_url = Some(url.trim_end_matches('/').to_owned());
        self
    }

    #[must_use]
    pub fn with_github_api(mut self, url: &str) -> Self {
        self.github_api = url.trim_end_matches('/').to_owned();
        self
    }

    /// Load config from `$PACKSMITH_REMOTE_CONFIG` or
    /// `~/.config/packsmith/remote.json`. A missing file yields the defaults.
    /// `GITHUB_TOKEN` overrides the stored token either way.
    pub fn load_default() -> Result<Self, RemoteError> {
        let path = match std::env::var_os(CONFIG_PATH_ENV) {
            Some(p) => Some(PathBuf::from(p)),
            None => default_config_path(),
        };
        let mut config = match path {
            Some(ref p) if p.exists() => Self::load(p)?,
            _ => Self::default(),
        };
        if let Ok(token) = std::env::var(GITHUB_TOKEN_ENV) {
            if !token.trim().is_empty() {
                config.github_token = Some(token.trim().to_owned());
            }
        }
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, RemoteError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&content)
            .map_err(|e| RemoteError::Config(format!("invalid remote config: {e}")))?;
        config.github_api = config.github_api.trim_end_matches('/').to_owned();
        config.mirror_url = config
            .mirror_url
            .map(|u| u.trim_end_matches('/').to_owned());
        if config.timeout_secs == 0 {
            return Err(RemoteError::Config(
                "timeout_secs must be greater than zero".to_owned(),
            ));
        }
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), RemoteError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| RemoteError::Serialization(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

fn default_config_path() -> Option<PathBuf> {
    let home = std::env::var_os("HOME")?;
    Some(PathBuf::from(home).join(".config/packsmith/remote.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remote.json");

        let config = RemoteConfig::default()
            .with_token("secret123")
            .with_mirror("https://mirror.example.com/packs/");
        config.save(&path).unwrap();

        let loaded = RemoteConfig::load(&path).unwrap();
        assert_eq!(loaded.github_token.as_deref(), Some("secret123"));
        assert_eq!(
            loaded.mirror_url.as_deref(),
            Some("https://mirror.example.com/packs")
        );
        assert_eq!(loaded.github_api, DEFAULT_GITHUB_API);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remote.json");
        std::fs::write(&path, r#"{"timeout_secs": 5, "github_api": "http://localhost:9/"}"#)
            .unwrap();

        let loaded = RemoteConfig::load(&path).unwrap();
        assert_eq!(loaded.timeout_secs, 5);
        assert_eq!(loaded.github_api, "http://localhost:9");
        assert!(loaded.user_agent.starts_with("packsmith/"));
        assert!(loaded.mirror_url.is_none());
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remote.json");
        std::fs::write(&path, r#"{"timeout_secs": 0}"#).unwrap();
        assert!(matches!(
            RemoteConfig::load(&path),
            Err(RemoteError::Config(_))
        ));
    }

    #[test]
    fn invalid_json_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remote.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            RemoteConfig::load(&path),
            Err(RemoteError::Config(_))
        ));
    }
}
