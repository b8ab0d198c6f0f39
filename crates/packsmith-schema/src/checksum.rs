use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Hex length of every supported digest (both are 256-bit).
const DIGEST_HEX_LEN: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChecksumError {
    #[error("checksum must not be empty")]
    Empty,
    #[error("unknown checksum algorithm '{0}', expected blake3 or sha256")]
    UnknownAlgorithm(String),
    #[error("invalid checksum digest '{0}': expected 64 hex characters")]
    InvalidDigest(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChecksumAlgorithm {
    Blake3,
    Sha256,
}

impl ChecksumAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            ChecksumAlgorithm::Blake3 => "blake3",
            ChecksumAlgorithm::Sha256 => "sha256",
        }
    }

    fn digest_hex(self, data: &[u8]) -> String {
        match self {
            ChecksumAlgorithm::Blake3 => blake3::hash(data).to_hex().to_string(),
            ChecksumAlgorithm::Sha256 => format!("{:x}", Sha256::digest(data)),
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An algorithm-tagged content digest, written as `<algorithm>:<hex>`.
///
/// A bare hex string parses as blake3. Digests are stored lowercase so that
/// comparison is a plain string comparison.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Checksum {
    algorithm: ChecksumAlgorithm,
    hex: String,
}

impl Checksum {
    pub fn parse(input: &str) -> Result<Self, ChecksumError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ChecksumError::Empty);
        }

        let (algorithm, digest) = match trimmed.split_once(':') {
            Some((algo, digest)) => {
                let algorithm = match algo.to_ascii_lowercase().as_str() {
                    "blake3" => ChecksumAlgorithm::Blake3,
                    "sha256" | "sha-256" => ChecksumAlgorithm::Sha256,
                    other => return Err(ChecksumError::UnknownAlgorithm(other.to_owned())),
                };
                (algorithm, digest)
            }
            None => (ChecksumAlgorithm::Blake3, trimmed),
        };

        if digest.len() != DIGEST_HEX_LEN || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ChecksumError::InvalidDigest(digest.to_owned()));
        }

        Ok(Self {
            algorithm,
            hex: digest.to_ascii_lowercase(),
        })
    }

    /// Compute the digest of `data` with the given algorithm.
    pub fn compute(algorithm: ChecksumAlgorithm, data: &[u8]) -> Self {
        Self {
            algorithm,
            hex: algorithm.digest_hex(data),
        }
    }

    /// Compute the blake3 digest of `data`. Used when no algorithm is imposed.
    pub fn blake3(data: &[u8]) -> Self {
        Self::compute(ChecksumAlgorithm::Blake3, data)
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Whether `data` hashes to this checksum under the same algorithm.
    pub fn matches(&self, data: &[u8]) -> bool {
        self.algorithm.digest_hex(data) == self.hex
    }

    /// File-name-safe key, used by the download cache.
    pub fn cache_key(&self) -> String {
        format!("{}-{}", self.algorithm, self.hex)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Checksum {
    type Err = ChecksumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Checksum {
    type Error = ChecksumError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Checksum> for String {
    fn from(value: Checksum) -> Self {
        value.to_string()
    }
}
