//! Release discovery and artifact transport for packsmith.
//!
//! This crate provides the byte-level `Transport` capability (real HTTP via
//! `ureq`, plus an in-memory implementation for tests), the `ReleaseProvider`
//! capability with one implementation per source kind (GitHub releases, direct
//! URLs, mirror indexes), and the remote configuration file.

pub mod config;
pub mod direct;
pub mod github;
pub mod http;
pub mod memory;
pub mod mirror;
pub mod provider;

pub use config::RemoteConfig;
pub use direct::DirectUrlProvider;
pub use github::GithubProvider;
pub use http::HttpTransport;
pub use memory::{MemoryFailure, MemoryTransport};
pub use mirror::{MirrorIndexEntry, MirrorProvider};
pub use provider::{ProviderSet, Release, ReleaseProvider};

use packsmith_schema::ProviderKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection failed for {url}: {message}")]
    Connection { url: String, message: String },
    #[error("HTTP {code} for {url}")]
    Status { url: String, code: u16 },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("remote config error: {0}")]
    Config(String),
    #[error("{provider} provider does not support {operation}")]
    Unsupported {
        provider: ProviderKind,
        operation: &'static str,
    },
    #[error("{provider} provider cannot handle a {found} source")]
    SourceMismatch {
        provider: ProviderKind,
        found: ProviderKind,
    },
}

impl RemoteError {
    /// Whether retrying the same request may succeed.
    ///
    /// Timeouts, dropped connections, 5xx, 408 and 429 are transient. Everything
    /// else (404, other 4xx, malformed URLs, bad payloads) fails the same way
    /// every time.
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Timeout(_) | RemoteError::Connection { .. } => true,
            RemoteError::Status { code, .. } => *code >= 500 || *code == 408 || *code == 429,
            _ => false,
        }
    }
}

/// Byte-level access to remote URLs.
pub trait Transport: Send + Sync {
    /// Download the body at `url`. Non-2xx responses are errors.
    fn get(&self, url: &str) -> Result<Vec<u8>, RemoteError>;

    /// Issue a HEAD request and return the status code.
    fn head(&self, url: &str) -> Result<u16, RemoteError>;
}
