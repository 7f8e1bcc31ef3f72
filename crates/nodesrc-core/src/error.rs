//! Error types for every layer of generation.

use std::path::PathBuf;

use nodesrc_schema::{Integrity, IntegrityError, SpecifierError};
use thiserror::Error;

/// Failures reading or writing a cache bucket.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt cache entry '{key}': {message}")]
    Corrupt { key: String, message: String },
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failures retrieving a remote resource.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("HTTP error fetching {url}: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("Unexpected response from {url}: {message}")]
    InvalidResponse { url: String, message: String },

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl FetchError {
    pub(crate) fn invalid(url: &str, message: impl std::fmt::Display) -> Self {
        Self::InvalidResponse {
            url: url.to_string(),
            message: message.to_string(),
        }
    }
}

/// A lockfile could not be read or is not one we understand.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid YAML in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{path}: lockfile version {version} is not supported ({hint})")]
    UnsupportedVersion {
        path: PathBuf,
        version: String,
        hint: &'static str,
    },

    #[error("{path}:{line}: {message}")]
    Syntax {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("{path}: invalid entry '{entry}': {message}")]
    Entry {
        path: PathBuf,
        entry: String,
        message: String,
    },

    #[error("{path}: bad integrity for '{entry}': {source}")]
    Integrity {
        path: PathBuf,
        entry: String,
        #[source]
        source: IntegrityError,
    },

    #[error("{path}: bad git specifier for '{entry}': {source}")]
    Specifier {
        path: PathBuf,
        entry: String,
        #[source]
        source: SpecifierError,
    },
}

/// Failures while accumulating manifest sources.
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Conflicting sources for {dest}: {existing} vs {incoming}")]
    DestinationConflict {
        dest: String,
        existing: String,
        incoming: String,
    },

    #[error("{url}#{commit} is checked out to both {existing} and {incoming}")]
    CheckoutConflict {
        url: String,
        commit: String,
        existing: String,
        incoming: String,
    },

    #[error("Manifest already finalized")]
    Finalized,

    #[error("Failed to serialize manifest: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Aggregate error for a generation run.
#[derive(Error, Debug)]
pub enum GenerateError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("{package}: lockfile integrity {declared} does not match registry integrity {registry}")]
    IntegrityMismatch {
        package: String,
        declared: Integrity,
        registry: Integrity,
    },

    #[error("{package}: {reason}")]
    UnsupportedSource { package: String, reason: String },

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{context}: {message}")]
    Context {
        context: &'static str,
        message: String,
    },

    #[error("Generation cancelled")]
    Cancelled,
}

impl GenerateError {
    /// Create an error with context for better debugging.
    pub fn context(ctx: &'static str, msg: impl std::fmt::Display) -> Self {
        Self::Context {
            context: ctx,
            message: msg.to_string(),
        }
    }

    pub fn unsupported(package: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        Self::UnsupportedSource {
            package: package.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether this error aborts the run even in keep-going mode.
    ///
    /// Fetch failures, unsupported sources and bad remote payloads only lose
    /// one package. Everything else means the dependency graph or the output
    /// cannot be trusted.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Fetch(_) | Self::UnsupportedSource { .. } | Self::Context { .. } => false,
            Self::Parse(_)
            | Self::IntegrityMismatch { .. }
            | Self::Manifest(_)
            | Self::Cache(_)
            | Self::Io { .. }
            | Self::Cancelled => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodesrc_schema::HashAlgorithm;

    #[test]
    fn fatality_follows_taxonomy() {
        let fetch = GenerateError::Fetch(FetchError::Status {
            url: "https://example.com".into(),
            status: 503,
        });
        assert!(!fetch.is_fatal());
        assert!(!GenerateError::unsupported("x@1.0.0", "no provider").is_fatal());

        let mismatch = GenerateError::IntegrityMismatch {
            package: "x@1.0.0".into(),
            declared: Integrity::generate(b"a", HashAlgorithm::Sha512),
            registry: Integrity::generate(b"b", HashAlgorithm::Sha512),
        };
        assert!(mismatch.is_fatal());
        assert!(GenerateError::Manifest(ManifestError::Finalized).is_fatal());
    }
}
