//! Content hashes in the `{algorithm, digest}` form used across lockfile
//! dialects.
//!
//! Lockfiles carry hashes either as Subresource-Integrity strings
//! (`sha512-<base64>`) or as bare hex `shasum` values. Both normalise to an
//! [`Integrity`] whose digest is always lower-case hex.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use thiserror::Error;

/// Errors produced while parsing or validating an integrity value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    /// The algorithm name is not one of the supported SHA variants.
    #[error("Unsupported hash algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// The value is not of the form `algorithm-digest`.
    #[error("Malformed integrity string: '{0}'")]
    Malformed(String),

    /// The base64 payload could not be decoded.
    #[error("Invalid base64 digest in '{value}': {reason}")]
    Base64 { value: String, reason: String },

    /// The digest has the wrong length for its algorithm.
    #[error("Invalid {algorithm} digest: expected {expected} hex chars, got {actual}")]
    Length {
        algorithm: HashAlgorithm,
        expected: usize,
        actual: usize,
    },

    /// The digest contains non-hex characters.
    #[error("Invalid hex digest: '{0}'")]
    Hex(String),
}

/// The closed set of hash algorithms a lockfile may reference.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// Legacy `shasum` values.
    Sha1,
    /// Default for hashes computed locally.
    #[default]
    Sha256,
    /// Rare, but valid in SRI strings.
    Sha384,
    /// What npm writes for every modern package.
    Sha512,
}

impl HashAlgorithm {
    /// Lower-case name, also used as the manifest field name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
        }
    }

    /// Length of the raw digest in bytes.
    pub fn digest_len(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }
}

impl std::fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HashAlgorithm {
    type Err = IntegrityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            "sha384" => Ok(Self::Sha384),
            "sha512" => Ok(Self::Sha512),
            _ => Err(IntegrityError::UnsupportedAlgorithm(s.to_string())),
        }
    }
}

/// An algorithm-tagged content hash.
///
/// Constructed only through validating constructors, so `digest` is always
/// lower-case hex of the correct length for `algorithm`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawIntegrity")]
pub struct Integrity {
    algorithm: HashAlgorithm,
    digest: String,
}

#[derive(Deserialize)]
struct RawIntegrity {
    algorithm: HashAlgorithm,
    digest: String,
}

impl TryFrom<RawIntegrity> for Integrity {
    type Error = IntegrityError;

    fn try_from(raw: RawIntegrity) -> Result<Self, Self::Error> {
        Self::from_hex(raw.algorithm, &raw.digest)
    }
}

impl Integrity {
    /// Build from an algorithm and a hex digest.
    pub fn from_hex(algorithm: HashAlgorithm, hex: &str) -> Result<Self, IntegrityError> {
        let expected = algorithm.digest_len() * 2;
        if hex.len() != expected {
            return Err(IntegrityError::Length {
                algorithm,
                expected,
                actual: hex.len(),
            });
        }
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(IntegrityError::Hex(hex.to_string()));
        }

        Ok(Self {
            algorithm,
            digest: hex.to_ascii_lowercase(),
        })
    }

    /// Parse an SRI value such as `sha512-<base64>`.
    ///
    /// When several space-separated hashes are present only the first one is
    /// used, and SRI options after `?` are ignored.
    pub fn parse(value: &str) -> Result<Self, IntegrityError> {
        let first = value
            .split_whitespace()
            .next()
            .ok_or_else(|| IntegrityError::Malformed(value.to_string()))?;

        let (algorithm, encoded) = first
            .split_once('-')
            .ok_or_else(|| IntegrityError::Malformed(value.to_string()))?;
        let algorithm: HashAlgorithm = algorithm.parse()?;
        let encoded = encoded.split('?').next().unwrap_or(encoded);

        let raw = STANDARD
            .decode(encoded)
            .map_err(|e| IntegrityError::Base64 {
                value: value.to_string(),
                reason: e.to_string(),
            })?;

        Self::from_hex(algorithm, &hex::encode(raw))
    }

    /// Wrap a legacy 40-character `shasum`.
    pub fn from_sha1(sha1: &str) -> Result<Self, IntegrityError> {
        Self::from_hex(HashAlgorithm::Sha1, sha1)
    }

    /// Hash `data` in one go.
    pub fn generate(data: impl AsRef<[u8]>, algorithm: HashAlgorithm) -> Self {
        let mut builder = IntegrityBuilder::new(algorithm);
        builder.update(data.as_ref());
        builder.build()
    }

    /// The hash algorithm.
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Lower-case hex digest.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// The digest re-encoded as standard padded base64.
    pub fn to_base64(&self) -> String {
        // from_hex validated the digest, so decoding cannot fail.
        let raw = hex::decode(&self.digest).unwrap_or_default();
        STANDARD.encode(raw)
    }

    /// The `algorithm-base64` SRI form.
    pub fn to_sri(&self) -> String {
        format!("{}-{}", self.algorithm, self.to_base64())
    }
}

impl std::fmt::Display for Integrity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_sri())
    }
}

/// Incremental hasher producing an [`Integrity`].
///
/// Lets callers hash a download chunk by chunk without buffering it.
#[derive(Debug, Clone)]
pub struct IntegrityBuilder {
    hasher: Hasher,
}

#[derive(Debug, Clone)]
enum Hasher {
    Sha1(Sha1),
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl IntegrityBuilder {
    /// Start a new hash.
    pub fn new(algorithm: HashAlgorithm) -> Self {
        let hasher = match algorithm {
            HashAlgorithm::Sha1 => Hasher::Sha1(Sha1::new()),
            HashAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            HashAlgorithm::Sha384 => Hasher::Sha384(Sha384::new()),
            HashAlgorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        };
        Self { hasher }
    }

    /// Feed another chunk.
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.hasher {
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha384(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    /// Finish hashing.
    pub fn build(self) -> Integrity {
        let (algorithm, digest) = match self.hasher {
            Hasher::Sha1(h) => (HashAlgorithm::Sha1, hex::encode(h.finalize())),
            Hasher::Sha256(h) => (HashAlgorithm::Sha256, hex::encode(h.finalize())),
            Hasher::Sha384(h) => (HashAlgorithm::Sha384, hex::encode(h.finalize())),
            Hasher::Sha512(h) => (HashAlgorithm::Sha512, hex::encode(h.finalize())),
        };
        Integrity { algorithm, digest }
    }
}
