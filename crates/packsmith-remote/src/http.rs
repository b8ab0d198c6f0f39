use crate::{RemoteConfig, RemoteError, Transport};
use std::io::Read;
use std::time::Duration;

/// HTTP transport over a shared `ureq` agent.
///
/// Every request carries the configured `User-Agent`. Requests to the GitHub
/// API base additionally carry `Accept: application/vnd.github+json` and, when
/// a token is configured, `Authorization: Bearer <token>`. The token is never
/// sent to any other host (release assets redirect to a CDN).
pub struct HttpTransport {
    config: RemoteConfig,
    agent: ureq::Agent,
}

impl HttpTransport {
    pub fn new(config: RemoteConfig) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(config.timeout_secs)))
            .build()
            .into();
        Self { config, agent }
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    fn is_github_api(&self, url: &str) -> bool {
        url.starts_with(&self.config.github_api)
    }

    fn check_url(url: &str) -> Result<(), RemoteError> {
        if url.starts_with("http://") || url.starts_with("https://") {
            Ok(())
        } else {
            Err(RemoteError::InvalidUrl(url.to_owned()))
        }
    }

    fn map_error(url: &str, err: ureq::Error) -> RemoteError {
        match err {
            ureq::Error::StatusCode(404) => RemoteError::NotFound(url.to_owned()),
            ureq::Error::StatusCode(code) => RemoteError::Status {
                url: url.to_owned(),
                code,
            },
            ureq::Error::Timeout(_) => RemoteError::Timeout(url.to_owned()),
            ureq::Error::BadUri(_) => RemoteError::InvalidUrl(url.to_owned()),
            other => RemoteError::Connection {
                url: url.to_owned(),
                message: other.to_string(),
            },
        }
    }
}

impl Transport for HttpTransport {
    fn get(&self, url: &str) -> Result<Vec<u8>, RemoteError> {
        Self::check_url(url)?;
        tracing::debug!("GET {url}");
        let mut req = self
            .agent
            .get(url)
            .header("User-Agent", &self.config.user_agent);
        if self.is_github_api(url) {
            req = req.header("Accept", "application/vnd.github+json");
            if let Some(ref token) = self.config.github_token {
                req = req.header("Authorization", &format!("Bearer {token}"));
            }
        }
        let resp = req.call().map_err(|e| Self::map_error(url, e))?;

        let code = resp.status().as_u16();
        if code == 404 {
            return Err(RemoteError::NotFound(url.to_owned()));
        }
        if code >= 400 {
            return Err(RemoteError::Status {
                url: url.to_owned(),
                code,
            });
        }

        let mut reader = resp.into_body().into_reader();
        let mut body = Vec::new();
        reader
            .read_to_end(&mut body)
            .map_err(|e| RemoteError::Connection {
                url: url.to_owned(),
                message: e.to_string(),
            })?;
        tracing::debug!("GET {url}: {} bytes", body.len());
        Ok(body)
    }

    fn head(&self, url: &str) -> Result<u16, RemoteError> {
        Self::check_url(url)?;
        tracing::debug!("HEAD {url}");
        let req = self
            .agent
            .head(url)
            .header("User-Agent", &self.config.user_agent);
        match req.call() {
            Ok(resp) => Ok(resp.status().as_u16()),
            Err(ureq::Error::StatusCode(code)) => Ok(code),
            Err(e) => Err(Self::map_error(url, e)),
        }
    }
}
