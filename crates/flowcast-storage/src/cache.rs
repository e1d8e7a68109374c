use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use flowcast_core::{format_timestamp, FeedType, TimeRange};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Identity of a cached response: nothing outside these four fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub source_id: String,
    pub spatial_key: String,
    pub range: TimeRange,
    pub feed: FeedType,
}

impl Fingerprint {
    pub fn new(
        source_id: impl Into<String>,
        spatial_key: impl Into<String>,
        range: TimeRange,
        feed: FeedType,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            spatial_key: spatial_key.into(),
            range,
            feed,
        }
    }

    pub fn canonical(&self) -> String {
        format!(
            "flowcast-cache/v1\nsource={}\nspatial={}\nstart={}\nend={}\nfeed={}\n",
            self.source_id,
            self.spatial_key,
            format_timestamp(self.range.start),
            format_timestamp(self.range.end),
            self.feed.as_str()
        )
    }

    pub fn digest(&self) -> String {
        sha256_hex(self.canonical().as_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub digest: String,
    pub body: Vec<u8>,
    pub stored_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    #[default]
    ReadWrite,
    /// Skip lookups; every fetch goes upstream and repopulates the cache.
    Refresh,
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cache metadata at {path}: {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[async_trait]
pub trait ResponseCache: Send + Sync {
    /// `None` on a miss, including expired or unreadable entries.
    async fn lookup(&self, fingerprint: &Fingerprint) -> Option<CacheEntry>;

    async fn store(
        &self,
        fingerprint: &Fingerprint,
        body: &[u8],
        fetched_at: DateTime<Utc>,
    ) -> Result<CacheEntry, CacheError>;

    /// Remove every entry, returning how many were dropped.
    async fn clear(&self) -> Result<usize, CacheError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryMeta {
    source_id: String,
    spatial_key: String,
    range: TimeRange,
    feed: FeedType,
    stored_at: DateTime<Utc>,
    byte_size: usize,
    body_sha256: String,
}

/// Content-addressed response cache under a single directory.
#[derive(Debug, Clone)]
pub struct DiskCache {
    root: PathBuf,
    ttl: Option<Duration>,
}

impl DiskCache {
    pub fn new(root: impl Into<PathBuf>, ttl: Option<Duration>) -> Self {
        Self {
            root: root.into(),
            ttl,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_dir(&self, digest: &str) -> PathBuf {
        self.root.join(&digest[..2])
    }

    fn body_path(&self, digest: &str) -> PathBuf {
        self.entry_dir(digest).join(format!("{digest}.body"))
    }

    fn meta_path(&self, digest: &str) -> PathBuf {
        self.entry_dir(digest).join(format!("{digest}.meta.json"))
    }

    fn is_expired(&self, stored_at: DateTime<Utc>) -> bool {
        match self.ttl {
            Some(ttl) => Utc::now() - stored_at >= ttl,
            None => false,
        }
    }

    async fn read_entry(&self, digest: &str) -> Option<CacheEntry> {
        let meta_path = self.meta_path(digest);
        let meta_bytes = fs::read(&meta_path).await.ok()?;
        let meta: EntryMeta = match serde_json::from_slice(&meta_bytes) {
            Ok(meta) => meta,
            Err(err) => {
                warn!(path = %meta_path.display(), error = %err, "unreadable cache metadata");
                return None;
            }
        };

        if self.is_expired(meta.stored_at) {
            debug!(digest, "cache entry expired");
            return None;
        }

        let body = fs::read(self.body_path(digest)).await.ok()?;
        if body.len() != meta.byte_size || sha256_hex(&body) != meta.body_sha256 {
            warn!(digest, "cache body does not match its metadata");
            return None;
        }

        Some(CacheEntry {
            digest: digest.to_string(),
            body,
            stored_at: meta.stored_at,
        })
    }
}

/// Write `bytes` to `target` through a uniquely named sibling temp file and a rename.
async fn write_atomic(target: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| CacheError::Io { path, source }
    };

    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await.map_err(io_err(parent))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(io_err(&temp_path))?;
    file.write_all(bytes).await.map_err(io_err(&temp_path))?;
    file.flush().await.map_err(io_err(&temp_path))?;
    drop(file);

    if let Err(source) = fs::rename(&temp_path, target).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(CacheError::Io {
            path: target.to_path_buf(),
            source,
        });
    }
    Ok(())
}

#[async_trait]
impl ResponseCache for DiskCache {
    async fn lookup(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        self.read_entry(&fingerprint.digest()).await
    }

    async fn store(
        &self,
        fingerprint: &Fingerprint,
        body: &[u8],
        fetched_at: DateTime<Utc>,
    ) -> Result<CacheEntry, CacheError> {
        let digest = fingerprint.digest();
        let meta = EntryMeta {
            source_id: fingerprint.source_id.clone(),
            spatial_key: fingerprint.spatial_key.clone(),
            range: fingerprint.range,
            feed: fingerprint.feed,
            stored_at: fetched_at,
            byte_size: body.len(),
            body_sha256: sha256_hex(body),
        };
        let meta_path = self.meta_path(&digest);
        let meta_bytes = serde_json::to_vec_pretty(&meta).map_err(|source| CacheError::Metadata {
            path: meta_path.clone(),
            source,
        })?;

        // Body lands first so a visible meta file always points at a complete body.
        write_atomic(&self.body_path(&digest), body).await?;
        write_atomic(&meta_path, &meta_bytes).await?;

        Ok(CacheEntry {
            digest,
            body: body.to_vec(),
            stored_at: fetched_at,
        })
    }

    async fn clear(&self) -> Result<usize, CacheError> {
        let mut removed = 0usize;
        let mut top = match fs::read_dir(&self.root).await {
            Ok(top) => top,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(source) => {
                return Err(CacheError::Io {
                    path: self.root.clone(),
                    source,
                })
            }
        };

        let io_err = |path: &Path, source| CacheError::Io {
            path: path.to_path_buf(),
            source,
        };

        while let Some(shard) = top.next_entry().await.map_err(|e| io_err(&self.root, e))? {
            let shard_path = shard.path();
            if !shard_path.is_dir() {
                continue;
            }
            let mut files = fs::read_dir(&shard_path)
                .await
                .map_err(|e| io_err(&shard_path, e))?;
            while let Some(file) = files.next_entry().await.map_err(|e| io_err(&shard_path, e))? {
                if file.file_name().to_string_lossy().ends_with(".meta.json") {
                    removed += 1;
                }
            }
            fs::remove_dir_all(&shard_path)
                .await
                .map_err(|e| io_err(&shard_path, e))?;
        }

        Ok(removed)
    }
}

/// In-process cache; entries never expire.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[async_trait]
impl ResponseCache for MemoryCache {
    async fn lookup(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        self.entries.lock().await.get(&fingerprint.digest()).cloned()
    }

    async fn store(
        &self,
        fingerprint: &Fingerprint,
        body: &[u8],
        fetched_at: DateTime<Utc>,
    ) -> Result<CacheEntry, CacheError> {
        let entry = CacheEntry {
            digest: fingerprint.digest(),
            body: body.to_vec(),
            stored_at: fetched_at,
        };
        self.entries
            .lock()
            .await
            .insert(entry.digest.clone(), entry.clone());
        Ok(entry)
    }

    async fn clear(&self) -> Result<usize, CacheError> {
        let mut entries = self.entries.lock().await;
        let removed = entries.len();
        entries.clear();
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn range() -> TimeRange {
        TimeRange::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap(),
        )
        .expect("range")
    }

    fn fingerprint(site: &str) -> Fingerprint {
        Fingerprint::new("usgs-nwis", site, range(), FeedType::StreamflowInstant)
    }

    #[test]
    fn fingerprint_depends_only_on_its_inputs() {
        assert_eq!(fingerprint("05420500").digest(), fingerprint("05420500").digest());
        assert_ne!(fingerprint("05420500").digest(), fingerprint("05420501").digest());

        let daily = Fingerprint::new("usgs-nwis", "05420500", range(), FeedType::StreamflowDaily);
        assert_ne!(daily.digest(), fingerprint("05420500").digest());
        assert_eq!(fingerprint("x").digest().len(), 64);
    }

    #[tokio::test]
    async fn disk_cache_returns_exact_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = DiskCache::new(dir.path(), None);
        let fp = fingerprint("05420500");
        let body = br#"{"value":{"timeSeries":[]}}"#;

        assert!(cache.lookup(&fp).await.is_none());
        let stored = cache.store(&fp, body, Utc::now()).await.expect("store");
        let hit = cache.lookup(&fp).await.expect("hit");
        assert_eq!(hit.body, body.to_vec());
        assert_eq!(hit.digest, stored.digest);
        assert!(dir
            .path()
            .join(&stored.digest[..2])
            .join(format!("{}.body", stored.digest))
            .exists());
    }

    #[tokio::test]
    async fn tampered_body_is_a_miss() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = DiskCache::new(dir.path(), None);
        let fp = fingerprint("05420500");
        let stored = cache.store(&fp, b"original", Utc::now()).await.expect("store");

        let body_path = dir
            .path()
            .join(&stored.digest[..2])
            .join(format!("{}.body", stored.digest));
        std::fs::write(&body_path, b"corrupted").expect("overwrite");

        assert!(cache.lookup(&fp).await.is_none());
    }

    #[tokio::test]
    async fn ttl_expiry_is_a_miss() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = DiskCache::new(dir.path(), Some(Duration::hours(1)));
        let fp = fingerprint("05420500");
        cache
            .store(&fp, b"old", Utc::now() - Duration::hours(2))
            .await
            .expect("store");
        assert!(cache.lookup(&fp).await.is_none());

        cache.store(&fp, b"fresh", Utc::now()).await.expect("store");
        assert_eq!(cache.lookup(&fp).await.expect("hit").body, b"fresh".to_vec());
    }

    #[tokio::test]
    async fn clear_counts_and_removes_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = DiskCache::new(dir.path().join("cache"), None);
        assert_eq!(cache.clear().await.expect("clear empty"), 0);

        for site in ["a1", "b2", "c3"] {
            cache.store(&fingerprint(site), site.as_bytes(), Utc::now()).await.expect("store");
        }
        assert_eq!(cache.clear().await.expect("clear"), 3);
        assert!(cache.lookup(&fingerprint("a1")).await.is_none());
    }

    #[tokio::test]
    async fn memory_cache_behaves_like_disk_cache() {
        let cache = MemoryCache::new();
        let fp = fingerprint("05420500");
        cache.store(&fp, b"payload", Utc::now()).await.expect("store");
        assert_eq!(cache.lookup(&fp).await.expect("hit").body, b"payload".to_vec());
        assert_eq!(cache.clear().await.expect("clear"), 1);
        assert_eq!(cache.len().await, 0);
    }
}
