//! Key to bytes store that persists fetched resources across runs.
//!
//! A bucket is either absent, being written by exactly one writer, or
//! complete. Writers stream into a temporary file next to the final location
//! and only become visible once sealed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tempfile::TempPath;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::CacheError;

/// Size of the chunks handed out by [`BucketReader::read_part`].
pub const DEFAULT_PART_SIZE: usize = 4096;

#[async_trait]
pub trait Cache: Send + Sync + std::fmt::Debug {
    /// Open a complete bucket, if one exists.
    async fn open_read(&self, key: &str) -> Result<Option<BucketReader>, CacheError>;

    /// Acquire exclusive write access to a bucket.
    ///
    /// Waits while another writer holds the same key.
    async fn open_write(&self, key: &str) -> Result<BucketWriter, CacheError>;
}

/// The cache to use for one fetch: `cache` when the result is stable,
/// otherwise one that never hits and discards writes.
pub fn working_cache(cache: &Arc<dyn Cache>, cachable: bool) -> Arc<dyn Cache> {
    if cachable {
        Arc::clone(cache)
    } else {
        Arc::new(NullCache)
    }
}

/// Streaming access to a complete bucket.
#[derive(Debug)]
pub struct BucketReader {
    path: PathBuf,
    file: tokio::fs::File,
}

impl BucketReader {
    /// Read the next chunk into `buf`; returns 0 at the end.
    pub async fn read_part(&mut self, buf: &mut [u8]) -> Result<usize, CacheError> {
        self.file
            .read(buf)
            .await
            .map_err(|e| CacheError::io(&self.path, e))
    }

    /// Read the remaining contents.
    pub async fn read_all(mut self) -> Result<Vec<u8>, CacheError> {
        let mut data = Vec::new();
        self.file
            .read_to_end(&mut data)
            .await
            .map_err(|e| CacheError::io(&self.path, e))?;
        Ok(data)
    }
}

/// Exclusive writer for one bucket.
///
/// Dropping a writer without calling [`BucketWriter::seal`] discards
/// everything written so far.
#[derive(Debug)]
pub struct BucketWriter {
    pending: Option<PendingBucket>,
    lock: Option<KeyLock>,
}

#[derive(Debug)]
struct PendingBucket {
    file: tokio::fs::File,
    temp: TempPath,
    target: PathBuf,
}

impl BucketWriter {
    fn discard() -> Self {
        Self {
            pending: None,
            lock: None,
        }
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<(), CacheError> {
        if let Some(pending) = &mut self.pending {
            pending
                .file
                .write_all(data)
                .await
                .map_err(|e| CacheError::io(pending.temp.to_path_buf(), e))?;
        }
        Ok(())
    }

    /// Atomically publish the bucket.
    pub async fn seal(mut self) -> Result<(), CacheError> {
        let Some(PendingBucket {
            mut file,
            temp,
            target,
        }) = self.pending.take()
        else {
            return Ok(());
        };

        file.flush()
            .await
            .map_err(|e| CacheError::io(temp.to_path_buf(), e))?;
        drop(file);

        let path = target.clone();
        tokio::task::spawn_blocking(move || {
            temp.persist(&target)
                .map_err(|e| CacheError::io(&target, e.error))
        })
        .await
        .map_err(|e| CacheError::io(path, std::io::Error::other(e)))?
    }
}

type LockMap = Mutex<HashMap<String, Arc<AsyncMutex<()>>>>;

/// Held write access to one key; forgets the key once nobody else wants it.
#[derive(Debug)]
struct KeyLock {
    guard: Option<OwnedMutexGuard<()>>,
    key: String,
    locks: Arc<LockMap>,
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Waiters hold their own clone, so a count of one means only the map is left.
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

/// Never hits; writes are discarded.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCache;

#[async_trait]
impl Cache for NullCache {
    async fn open_read(&self, _key: &str) -> Result<Option<BucketReader>, CacheError> {
        Ok(None)
    }

    async fn open_write(&self, _key: &str) -> Result<BucketWriter, CacheError> {
        Ok(BucketWriter::discard())
    }
}

/// One file per key under a root directory.
#[derive(Debug)]
pub struct FilesystemCache {
    root: PathBuf,
    locks: Arc<LockMap>,
}

impl FilesystemCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Arc::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a key to a safe file name: bytes outside `[A-Za-z0-9._-]`
    /// become `_XX`.
    pub fn escape_key(key: &str) -> String {
        let mut escaped = String::with_capacity(key.len());
        for byte in key.bytes() {
            if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-') {
                escaped.push(char::from(byte));
            } else {
                escaped.push_str(&format!("_{byte:02X}"));
            }
        }
        escaped
    }

    fn bucket_path(&self, key: &str) -> PathBuf {
        self.root.join(Self::escape_key(key))
    }

    fn key_lock(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key.to_string()).or_default())
    }
}

#[async_trait]
impl Cache for FilesystemCache {
    async fn open_read(&self, key: &str) -> Result<Option<BucketReader>, CacheError> {
        let path = self.bucket_path(key);
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(Some(BucketReader { path, file })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::io(path, e)),
        }
    }

    async fn open_write(&self, key: &str) -> Result<BucketWriter, CacheError> {
        let guard = self.key_lock(key).lock_owned().await;
        let lock = KeyLock {
            guard: Some(guard),
            key: key.to_string(),
            locks: Arc::clone(&self.locks),
        };

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| CacheError::io(&self.root, e))?;

        let root = self.root.clone();
        let temp = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix("__temp__")
                .tempfile_in(&root)
                .map_err(|e| CacheError::io(&root, e))
        })
        .await
        .map_err(|e| CacheError::io(&self.root, std::io::Error::other(e)))??;
        let (file, temp) = temp.into_parts();

        Ok(BucketWriter {
            pending: Some(PendingBucket {
                file: tokio::fs::File::from_std(file),
                temp,
                target: self.bucket_path(key),
            }),
            lock: Some(lock),
        })
    }
}

/// Read a whole bucket, if present.
pub async fn read_bucket(cache: &dyn Cache, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
    match cache.open_read(key).await? {
        Some(reader) => Ok(Some(reader.read_all().await?)),
        None => Ok(None),
    }
}

/// Write and seal a whole bucket.
pub async fn write_bucket(cache: &dyn Cache, key: &str, data: &[u8]) -> Result<(), CacheError> {
    let mut writer = cache.open_write(key).await?;
    writer.write(data).await?;
    writer.seal().await
}
