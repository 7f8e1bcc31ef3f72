//! Remote fetching with bounded retries and a request cache.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::Client;
use tracing::{debug, warn};

use crate::cache::{BucketWriter, Cache, DEFAULT_PART_SIZE, working_cache};
use crate::error::FetchError;

pub const DEFAULT_RETRIES: u32 = 5;

/// Receives a response body chunk by chunk.
pub trait ChunkSink: Send {
    fn chunk(&mut self, data: &[u8]);

    /// A retry is about to re-send the body from the start; drop anything
    /// accumulated so far.
    fn restart(&mut self);
}

impl ChunkSink for Vec<u8> {
    fn chunk(&mut self, data: &[u8]) {
        self.extend_from_slice(data);
    }

    fn restart(&mut self) {
        self.clear();
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync + std::fmt::Debug {
    /// Stream `url` into `sink`.
    ///
    /// With `cachable` set the response is served from and stored into the
    /// request cache; live API calls must pass `false`.
    async fn read_parts(
        &self,
        url: &str,
        cachable: bool,
        sink: &mut dyn ChunkSink,
    ) -> Result<(), FetchError>;

    /// Fetch the whole body.
    async fn read_all(&self, url: &str, cachable: bool) -> Result<Vec<u8>, FetchError> {
        let mut data = Vec::new();
        self.read_parts(url, cachable, &mut data).await?;
        Ok(data)
    }

    /// Whether this fetcher serves canned data instead of the network.
    fn is_stub(&self) -> bool {
        false
    }
}

/// Fetches over HTTP(S) with reqwest.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    cache: Arc<dyn Cache>,
    retries: u32,
}

impl HttpFetcher {
    pub fn new(cache: Arc<dyn Cache>) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(crate::USER_AGENT)
            .build()
            .map_err(FetchError::Client)?;
        Ok(Self {
            client,
            cache,
            retries: DEFAULT_RETRIES,
        })
    }

    /// Total number of attempts per request (at least one).
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries.max(1);
        self
    }

    async fn attempt(
        &self,
        url: &str,
        writer: &mut BucketWriter,
        sink: &mut dyn ChunkSink,
    ) -> Result<(), FetchError> {
        let http = |source| FetchError::Http {
            url: url.to_string(),
            source,
        };

        let response = self.client.get(url).send().await.map_err(http)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(http)?;
            writer.write(&chunk).await?;
            sink.chunk(&chunk);
        }

        Ok(())
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn read_parts(
        &self,
        url: &str,
        cachable: bool,
        sink: &mut dyn ChunkSink,
    ) -> Result<(), FetchError> {
        let key = format!("requests:{url}");
        let cache = working_cache(&self.cache, cachable);

        if let Some(mut reader) = cache.open_read(&key).await? {
            debug!("Cache hit for {url}");
            let mut buf = vec![0u8; DEFAULT_PART_SIZE];
            loop {
                let n = reader.read_part(&mut buf).await?;
                if n == 0 {
                    return Ok(());
                }
                sink.chunk(&buf[..n]);
            }
        }

        let mut attempt = 1;
        loop {
            let mut writer = cache.open_write(&key).await?;
            match self.attempt(url, &mut writer, sink).await {
                Ok(()) => {
                    writer.seal().await?;
                    return Ok(());
                }
                Err(e) if attempt < self.retries => {
                    // Release the bucket before the next attempt takes it again.
                    drop(writer);
                    warn!("Fetching {url} failed (attempt {attempt}/{}): {e}", self.retries);
                    sink.restart();
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Serves canned responses from memory; unknown URLs yield an empty body.
#[derive(Debug, Clone, Default)]
pub struct StubFetcher {
    responses: HashMap<String, Bytes>,
}

impl StubFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(mut self, url: impl Into<String>, body: impl Into<Bytes>) -> Self {
        self.responses.insert(url.into(), body.into());
        self
    }
}

#[async_trait]
impl Fetcher for StubFetcher {
    async fn read_parts(
        &self,
        url: &str,
        _cachable: bool,
        sink: &mut dyn ChunkSink,
    ) -> Result<(), FetchError> {
        match self.responses.get(url) {
            Some(body) => sink.chunk(body),
            None => sink.chunk(&[]),
        }
        Ok(())
    }

    fn is_stub(&self) -> bool {
        true
    }
}
