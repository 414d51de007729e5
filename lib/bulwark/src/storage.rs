//! Pluggable cache storage backends.
//!
//! The cache layer talks to a [`CacheStorage`] trait object. Two backends
//! ship with the crate: [`MemoryStorage`] (mutex-guarded map with optional
//! capacity, evicting the oldest inserted entry first) and [`FileStorage`]
//! (one JSON file per record, named by the SHA-256 of the cache key).
//!
//! Every backend treats "record not found" and "record expired" identically
//! as a miss, and deletes what it cannot parse.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use bulwark_core::{Error, Response, Result};

/// Milliseconds since the unix epoch.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A serialized response snapshot with explicit expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRecord {
    /// Cache key this record was stored under.
    pub key: String,
    /// HTTP status code of the snapshot.
    pub status: u16,
    /// Response headers of the snapshot.
    pub headers: HashMap<String, String>,
    /// Response body bytes.
    pub body: Vec<u8>,
    /// URL the response was fetched from.
    pub url: Option<String>,
    /// Unix-millis timestamp when the record was stored.
    pub stored_at_ms: u64,
    /// Unix-millis timestamp after which the record is a miss.
    pub expires_at_ms: u64,
}

impl CacheRecord {
    /// Snapshot a response under `key`, expiring `ttl` from now.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn snapshot(key: impl Into<String>, response: &Response<Bytes>, ttl: Duration) -> Self {
        let stored_at_ms = now_ms();
        Self {
            key: key.into(),
            status: response.status(),
            headers: response.headers().clone(),
            body: response.body().to_vec(),
            url: response.url().map(url::Url::to_string),
            stored_at_ms,
            expires_at_ms: stored_at_ms.saturating_add(ttl.as_millis() as u64),
        }
    }

    /// Rebuild an independently consumable response from the snapshot.
    #[must_use]
    pub fn to_response(&self) -> Response<Bytes> {
        let response = Response::new(
            self.status,
            self.headers.clone(),
            Bytes::from(self.body.clone()),
        );
        match self.url.as_deref().and_then(|u| url::Url::parse(u).ok()) {
            Some(url) => response.with_url(url),
            None => response,
        }
    }

    /// Whether the record is past its expiry.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        now_ms() > self.expires_at_ms
    }
}

/// Pluggable storage contract consumed by the cache layer.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Fetch a live record, or `None` on miss (absent, expired, corrupt).
    async fn get(&self, key: &str) -> Result<Option<CacheRecord>>;

    /// Store a record under its key, replacing any previous one.
    async fn set(&self, record: CacheRecord) -> Result<()>;

    /// Remove a record.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Remove all records, or only those whose key starts with `prefix`.
    async fn clear(&self, prefix: Option<&str>) -> Result<()>;

    /// Remove expired records, returning how many were purged.
    async fn purge_expired(&self) -> Result<usize>;
}

// ============================================================================
// In-memory backend
// ============================================================================

#[derive(Debug, Default)]
struct MemoryInner {
    map: HashMap<String, CacheRecord>,
    // Insertion order, oldest first, for capacity eviction.
    order: VecDeque<String>,
}

/// In-memory storage with optional capacity.
///
/// At capacity, the oldest inserted entry is evicted to make room.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: Mutex<MemoryInner>,
    capacity: Option<usize>,
}

impl MemoryStorage {
    /// Unbounded in-memory storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// In-memory storage holding at most `capacity` records.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(MemoryInner::default()),
            capacity: Some(capacity),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl CacheStorage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<CacheRecord>> {
        let mut inner = self.lock();
        match inner.map.get(key) {
            Some(record) if record.is_expired() => {
                inner.map.remove(key);
                inner.order.retain(|k| k != key);
                Ok(None)
            }
            Some(record) => Ok(Some(record.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, record: CacheRecord) -> Result<()> {
        let mut inner = self.lock();
        let key = record.key.clone();

        if inner.map.contains_key(&key) {
            inner.order.retain(|k| k != &key);
        } else if let Some(capacity) = self.capacity {
            while inner.map.len() >= capacity {
                let Some(oldest) = inner.order.pop_front() else {
                    break;
                };
                tracing::debug!(key = %oldest, "evicting oldest cache entry");
                inner.map.remove(&oldest);
            }
        }

        inner.order.push_back(key.clone());
        inner.map.insert(key, record);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.map.remove(key);
        inner.order.retain(|k| k != key);
        Ok(())
    }

    async fn clear(&self, prefix: Option<&str>) -> Result<()> {
        let mut inner = self.lock();
        match prefix {
            None => {
                inner.map.clear();
                inner.order.clear();
            }
            Some(prefix) => {
                inner.map.retain(|k, _| !k.starts_with(prefix));
                inner.order.retain(|k| !k.starts_with(prefix));
            }
        }
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let mut inner = self.lock();
        let before = inner.map.len();
        inner.map.retain(|_, record| !record.is_expired());
        let map = &inner.map;
        let retained: Vec<String> = inner
            .order
            .iter()
            .filter(|k| map.contains_key(*k))
            .cloned()
            .collect();
        inner.order = retained.into();
        Ok(before - inner.map.len())
    }
}

// ============================================================================
// On-disk backend
// ============================================================================

/// On-disk storage: one JSON file per record under a directory, named by the
/// SHA-256 of the cache key.
///
/// Corrupted files are deleted and reported as a miss.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Storage rooted at `dir`. The directory is created on first write.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        let mut name = String::with_capacity(digest.len() * 2 + 5);
        for byte in digest {
            name.push_str(&format!("{byte:02x}"));
        }
        name.push_str(".json");
        self.dir.join(name)
    }

    async fn remove_quiet(path: &std::path::Path) {
        if let Err(error) = tokio::fs::remove_file(path).await
            && error.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %path.display(), %error, "failed to remove cache file");
        }
    }

    async fn read_record(&self, path: &std::path::Path) -> Result<Option<CacheRecord>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(Error::cache(error.to_string())),
        };

        match serde_json::from_slice::<CacheRecord>(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "deleting corrupt cache file");
                Self::remove_quiet(path).await;
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl CacheStorage for FileStorage {
    async fn get(&self, key: &str) -> Result<Option<CacheRecord>> {
        let path = self.path_for(key);
        match self.read_record(&path).await? {
            Some(record) if record.is_expired() => {
                Self::remove_quiet(&path).await;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    async fn set(&self, record: CacheRecord) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Error::cache(e.to_string()))?;

        let path = self.path_for(&record.key);
        let bytes = serde_json::to_vec(&record).map_err(|e| Error::cache(e.to_string()))?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| Error::cache(e.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        Self::remove_quiet(&self.path_for(key)).await;
        Ok(())
    }

    async fn clear(&self, prefix: Option<&str>) -> Result<()> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(error) => return Err(Error::cache(error.to_string())),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::cache(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let matches = match prefix {
                None => true,
                // Keys are only recoverable from the record itself; an
                // unreadable file matches so clear() also sheds corruption.
                Some(prefix) => self
                    .read_record(&path)
                    .await?
                    .is_none_or(|record| record.key.starts_with(prefix)),
            };
            if matches {
                Self::remove_quiet(&path).await;
            }
        }
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(error) => return Err(Error::cache(error.to_string())),
        };

        let mut purged = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::cache(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            if let Some(record) = self.read_record(&path).await?
                && record.is_expired()
            {
                Self::remove_quiet(&path).await;
                purged += 1;
            }
        }
        Ok(purged)
    }
}

// ============================================================================
// Background sweeper
// ============================================================================

/// Spawn a background task purging expired records every `interval`,
/// independent of reads. Abort the returned handle to stop it.
pub fn spawn_sweeper(
    storage: Arc<dyn CacheStorage>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match storage.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => tracing::debug!(purged, "cache sweeper purged expired entries"),
                Err(error) => tracing::warn!(%error, "cache sweeper failed"),
            }
        }
    })
}
