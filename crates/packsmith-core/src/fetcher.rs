use crate::cache::ArtifactCache;
use crate::resolver::ArtifactReference;
use crate::retry::{RetryError, Retrier};
use crate::verify::VerifiedArtifact;
use chrono::{DateTime, Utc};
use packsmith_remote::{RemoteError, Transport};
use packsmith_schema::{Checksum, ChecksumAlgorithm, ModId};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Where a payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
    Network,
    Cache,
    /// The file already installed in the target directory.
    Installed,
}

/// Downloaded bytes for one reference. Never written anywhere by the fetcher.
#[derive(Debug, Clone)]
pub struct FetchedArtifact {
    pub reference: ArtifactReference,
    pub payload: Vec<u8>,
    /// Digest of `payload`, computed with the expected checksum's algorithm
    /// (blake3 when nothing is expected).
    pub checksum: Checksum,
    pub source: FetchSource,
    pub fetched_at: DateTime<Utc>,
}

impl FetchedArtifact {
    pub fn new(reference: ArtifactReference, payload: Vec<u8>, source: FetchSource) -> Self {
        let algorithm = reference
            .checksum
            .as_ref()
            .map_or(ChecksumAlgorithm::Blake3, Checksum::algorithm);
        let checksum = Checksum::compute(algorithm, &payload);
        Self {
            reference,
            payload,
            checksum,
            source,
            fetched_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{id}: download of {url} failed: {source}")]
    Permanent {
        id: ModId,
        url: String,
        #[source]
        source: RemoteError,
    },
    #[error("{id}: download of {url} failed after {attempts} attempts: {last}")]
    Exhausted {
        id: ModId,
        url: String,
        attempts: u32,
        #[source]
        last: RemoteError,
    },
    #[error("{id}: download interrupted")]
    Interrupted { id: ModId },
    #[error("{id}: download cache error: {source}")]
    Cache {
        id: ModId,
        #[source]
        source: std::io::Error,
    },
}

/// Downloads artifact bytes with retry, consulting an optional cache first.
#[derive(Clone)]
pub struct Fetcher {
    transport: Arc<dyn Transport>,
    retrier: Retrier,
    cache: Option<Arc<ArtifactCache>>,
}

impl Fetcher {
    pub fn new(transport: Arc<dyn Transport>, retrier: Retrier) -> Self {
        Self {
            transport,
            retrier,
            cache: None,
        }
    }

    #[must_use]
    pub fn with_cache(mut self, cache: Option<Arc<ArtifactCache>>) -> Self {
        self.cache = cache;
        self
    }

    pub fn fetch(&self, reference: &ArtifactReference) -> Result<FetchedArtifact, FetchError> {
        if let Some(payload) = self.cached(reference) {
            return Ok(FetchedArtifact::new(
                reference.clone(),
                payload,
                FetchSource::Cache,
            ));
        }

        let label = format!("fetch {}", reference.id);
        let payload = self
            .retrier
            .run(&label, RemoteError::is_transient, |_| {
                self.transport.get(&reference.url)
            })
            .map_err(|e| match e {
                RetryError::Permanent { error, .. } => FetchError::Permanent {
                    id: reference.id.clone(),
                    url: reference.url.clone(),
                    source: error,
                },
                RetryError::Exhausted { attempts, last } => FetchError::Exhausted {
                    id: reference.id.clone(),
                    url: reference.url.clone(),
                    attempts,
                    last,
                },
                RetryError::Interrupted { .. } => FetchError::Interrupted {
                    id: reference.id.clone(),
                },
            })?;
        debug!("{}: downloaded {} bytes", reference.id, payload.len());
        Ok(FetchedArtifact::new(
            reference.clone(),
            payload,
            FetchSource::Network,
        ))
    }

    /// Put a verified network download into the cache.
    pub fn remember(&self, artifact: &VerifiedArtifact) -> Result<(), FetchError> {
        let Some(cache) = &self.cache else {
            return Ok(());
        };
        if artifact.source != FetchSource::Network {
            return Ok(());
        }
        cache
            .put(&artifact.checksum, &artifact.payload)
            .map_err(|source| FetchError::Cache {
                id: artifact.reference.id.clone(),
                source,
            })
    }

    fn cached(&self, reference: &ArtifactReference) -> Option<Vec<u8>> {
        let cache = self.cache.as_ref()?;
        let checksum = reference.checksum.as_ref()?;
        match cache.get(checksum) {
            Ok(hit) => hit,
            Err(e) => {
                warn!("{}: cache read failed, downloading: {e}", reference.id);
                None
            }
        }
    }
}

impl std::fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetcher")
            .field("retrier", &self.retrier)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}
