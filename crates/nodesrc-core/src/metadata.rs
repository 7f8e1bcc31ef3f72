//! Integrity and size of remote artifacts, computed by streaming.

use std::sync::Arc;

use nodesrc_schema::{HashAlgorithm, Integrity, IntegrityBuilder};
use serde::{Deserialize, Serialize};

use crate::cache::{Cache, read_bucket, working_cache, write_bucket};
use crate::error::{CacheError, FetchError};
use crate::fetch::{ChunkSink, Fetcher};

/// Hash and length of a remote resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMetadata {
    pub integrity: Integrity,
    pub size: u64,
}

struct MetadataSink {
    algorithm: HashAlgorithm,
    builder: IntegrityBuilder,
    size: u64,
}

impl ChunkSink for MetadataSink {
    fn chunk(&mut self, data: &[u8]) {
        self.builder.update(data);
        self.size += data.len() as u64;
    }

    fn restart(&mut self) {
        self.builder = IntegrityBuilder::new(self.algorithm);
        self.size = 0;
    }
}

struct SizeSink(u64);

impl ChunkSink for SizeSink {
    fn chunk(&mut self, data: &[u8]) {
        self.0 += data.len() as u64;
    }

    fn restart(&mut self) {
        self.0 = 0;
    }
}

impl RemoteMetadata {
    /// Stream `url` once and hash it with `algorithm`.
    ///
    /// The body itself is never stored; only the resulting metadata goes into
    /// the cache (when `cachable`). Stub fetchers never touch the cache.
    pub async fn get(
        fetcher: &dyn Fetcher,
        cache: &Arc<dyn Cache>,
        url: &str,
        cachable: bool,
        algorithm: HashAlgorithm,
    ) -> Result<Self, FetchError> {
        let cache = working_cache(cache, cachable && !fetcher.is_stub());
        let key = format!("remote-url-metadata:full:{url}");

        if let Some(raw) = read_bucket(cache.as_ref(), &key).await? {
            let cached: Self = serde_json::from_slice(&raw).map_err(|e| CacheError::Corrupt {
                key: key.clone(),
                message: e.to_string(),
            })?;
            if cached.integrity.algorithm() == algorithm {
                return Ok(cached);
            }
        }

        let mut sink = MetadataSink {
            algorithm,
            builder: IntegrityBuilder::new(algorithm),
            size: 0,
        };
        fetcher.read_parts(url, false, &mut sink).await?;

        let metadata = Self {
            integrity: sink.builder.build(),
            size: sink.size,
        };
        let raw = serde_json::to_vec(&metadata).map_err(|e| FetchError::invalid(url, e))?;
        write_bucket(cache.as_ref(), &key, &raw).await?;

        Ok(metadata)
    }

    /// Stream `url` once and count its bytes.
    pub async fn get_size(
        fetcher: &dyn Fetcher,
        cache: &Arc<dyn Cache>,
        url: &str,
        cachable: bool,
    ) -> Result<u64, FetchError> {
        let cache = working_cache(cache, cachable && !fetcher.is_stub());
        let key = format!("remote-url-metadata:size:{url}");

        if let Some(raw) = read_bucket(cache.as_ref(), &key).await? {
            let size = std::str::from_utf8(&raw)
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .ok_or_else(|| CacheError::Corrupt {
                    key: key.clone(),
                    message: "not a size".to_string(),
                })?;
            return Ok(size);
        }

        let mut sink = SizeSink(0);
        fetcher.read_parts(url, false, &mut sink).await?;
        write_bucket(cache.as_ref(), &key, sink.0.to_string().as_bytes()).await?;

        Ok(sink.0)
    }
}
