//! Bucket stores.
//!
//! A store holds named buckets, each mapping a request URL to a [`CacheEntry`].
//! Every operation is atomic per key: a `put` replaces the whole entry, so
//! concurrent writers to one key resolve as last-write-wins.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hashbrown::HashMap;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

use crate::CacheEntry;

/// Errors raised by a bucket store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt entry {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Quota exceeded for bucket {bucket} ({limit} entries)")]
    QuotaExceeded { bucket: String, limit: usize },
}

/// Named bucket storage, injected into the cache manager.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Open a bucket, creating it if absent.
    async fn open(&self, bucket: &str) -> Result<(), StoreError>;

    /// Check if a bucket exists.
    async fn has(&self, bucket: &str) -> Result<bool, StoreError>;

    /// Delete a bucket and everything in it. Returns whether it existed.
    async fn delete(&self, bucket: &str) -> Result<bool, StoreError>;

    /// All bucket names, sorted.
    async fn keys(&self) -> Result<Vec<String>, StoreError>;

    /// Store an entry under its URL, creating the bucket if absent.
    async fn put(&self, bucket: &str, entry: CacheEntry) -> Result<(), StoreError>;

    /// Look up an entry by URL.
    async fn get(&self, bucket: &str, url: &str) -> Result<Option<CacheEntry>, StoreError>;

    /// URLs stored in a bucket, sorted. Empty if the bucket does not exist.
    async fn entries(&self, bucket: &str) -> Result<Vec<String>, StoreError>;
}

// ==================== Memory Store ====================

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    buckets: RwLock<HashMap<String, HashMap<String, CacheEntry>>>,
    quota: Option<usize>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit each bucket to `max_entries`; further new keys fail with
    /// [`StoreError::QuotaExceeded`].
    pub fn with_quota(max_entries: usize) -> Self {
        Self {
            buckets: RwLock::default(),
            quota: Some(max_entries),
        }
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn open(&self, bucket: &str) -> Result<(), StoreError> {
        self.buckets
            .write()
            .await
            .entry(bucket.to_string())
            .or_default();
        Ok(())
    }

    async fn has(&self, bucket: &str) -> Result<bool, StoreError> {
        Ok(self.buckets.read().await.contains_key(bucket))
    }

    async fn delete(&self, bucket: &str) -> Result<bool, StoreError> {
        Ok(self.buckets.write().await.remove(bucket).is_some())
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        let mut names: Vec<String> = self.buckets.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn put(&self, bucket: &str, entry: CacheEntry) -> Result<(), StoreError> {
        let mut buckets = self.buckets.write().await;
        let entries = buckets.entry(bucket.to_string()).or_default();

        if let Some(limit) = self.quota {
            if !entries.contains_key(&entry.url) && entries.len() >= limit {
                return Err(StoreError::QuotaExceeded {
                    bucket: bucket.to_string(),
                    limit,
                });
            }
        }

        entries.insert(entry.url.clone(), entry);
        Ok(())
    }

    async fn get(&self, bucket: &str, url: &str) -> Result<Option<CacheEntry>, StoreError> {
        Ok(self
            .buckets
            .read()
            .await
            .get(bucket)
            .and_then(|entries| entries.get(url))
            .cloned())
    }

    async fn entries(&self, bucket: &str) -> Result<Vec<String>, StoreError> {
        let mut urls: Vec<String> = self
            .buckets
            .read()
            .await
            .get(bucket)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default();
        urls.sort();
        Ok(urls)
    }
}

// ==================== Disk Store ====================

/// Store persisted under a root directory.
///
/// Layout: `<root>/<b64(bucket)>/<sha256(url)>.json`. Bucket directories are
/// URL-safe base64 so `keys` can recover the name. Entry files are named by
/// digest so URLs of any length fit, and the URL itself lives in the JSON.
#[derive(Debug, Clone)]
pub struct DiskCacheStore {
    root: PathBuf,
}

const ENTRY_EXT: &str = "json";

impl DiskCacheStore {
    /// Create a store rooted at `root`. The directory is created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_dir(&self, bucket: &str) -> PathBuf {
        self.root.join(encode_name(bucket))
    }

    fn entry_path(&self, bucket: &str, url: &str) -> PathBuf {
        self.bucket_dir(bucket)
            .join(format!("{}.{ENTRY_EXT}", hash_key(url)))
    }

    async fn list_dir(dir: &Path) -> Result<Vec<(String, bool)>, StoreError> {
        let mut names = Vec::new();
        let mut reader = match fs::read_dir(dir).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };

        while let Some(item) = reader.next_entry().await? {
            let is_dir = item.file_type().await?.is_dir();
            if let Some(name) = item.file_name().to_str() {
                names.push((name.to_string(), is_dir));
            }
        }
        Ok(names)
    }
}

#[async_trait]
impl CacheStore for DiskCacheStore {
    async fn open(&self, bucket: &str) -> Result<(), StoreError> {
        fs::create_dir_all(self.bucket_dir(bucket)).await?;
        Ok(())
    }

    async fn has(&self, bucket: &str) -> Result<bool, StoreError> {
        Ok(fs::try_exists(self.bucket_dir(bucket)).await?)
    }

    async fn delete(&self, bucket: &str) -> Result<bool, StoreError> {
        match fs::remove_dir_all(self.bucket_dir(bucket)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        let mut names: Vec<String> = Self::list_dir(&self.root)
            .await?
            .into_iter()
            .filter(|(_, is_dir)| *is_dir)
            .filter_map(|(name, _)| {
                let decoded = decode_name(&name);
                if decoded.is_none() {
                    warn!(dir = %name, "Ignoring unrecognised directory in cache root");
                }
                decoded
            })
            .collect();
        names.sort();
        Ok(names)
    }

    async fn put(&self, bucket: &str, entry: CacheEntry) -> Result<(), StoreError> {
        let dir = self.bucket_dir(bucket);
        fs::create_dir_all(&dir).await?;

        let path = self.entry_path(bucket, &entry.url);
        let contents = serde_json::to_vec(&entry).map_err(|e| StoreError::Corrupt {
            key: entry.url.clone(),
            reason: e.to_string(),
        })?;

        // Write to a unique temp file, then rename over the target.
        static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);
        let tmp = dir.join(format!(
            ".tmp-{}-{}",
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&tmp, contents).await?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        trace!(bucket, url = %entry.url, "Stored entry");
        Ok(())
    }

    async fn get(&self, bucket: &str, url: &str) -> Result<Option<CacheEntry>, StoreError> {
        let contents = match fs::read(self.entry_path(bucket, url)).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&contents)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                key: url.to_string(),
                reason: e.to_string(),
            })
    }

    async fn entries(&self, bucket: &str) -> Result<Vec<String>, StoreError> {
        let dir = self.bucket_dir(bucket);
        let suffix = format!(".{ENTRY_EXT}");
        let mut urls = Vec::new();

        for (name, is_dir) in Self::list_dir(&dir).await? {
            if is_dir || !name.ends_with(&suffix) {
                continue;
            }
            let contents = match fs::read(dir.join(&name)).await {
                Ok(contents) => contents,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            match serde_json::from_slice::<CacheEntry>(&contents) {
                Ok(entry) => urls.push(entry.url),
                Err(e) => warn!(file = %name, error = %e, "Skipping unreadable cache entry"),
            }
        }
        urls.sort();
        debug!(bucket, count = urls.len(), "Listed bucket entries");
        Ok(urls)
    }
}

fn encode_name(name: &str) -> String {
    URL_SAFE_NO_PAD.encode(name.as_bytes())
}

fn hash_key(url: &str) -> String {
    format!("{:x}", Sha256::digest(url.as_bytes()))
}

fn decode_name(encoded: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD.decode(encoded).ok()?;
    String::from_utf8(bytes).ok()
}

/// Serde adapter storing bodies as base64 text instead of number arrays.
pub(crate) mod base64_body {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ResponseKind;
    use std::sync::Arc;

    fn entry(url: &str, body: &str) -> CacheEntry {
        CacheEntry {
            url: url.to_string(),
            method: "GET".to_string(),
            status: 200,
            headers: Vec::new(),
            body: body.as_bytes().to_vec(),
            kind: ResponseKind::Success,
            cached_at: 1,
        }
    }

    async fn exercise_store(store: &dyn CacheStore) {
        assert!(!store.has("lizard-tap-v1").await.unwrap());
        store.open("lizard-tap-v1").await.unwrap();
        assert!(store.has("lizard-tap-v1").await.unwrap());

        store
            .put("lizard-tap-v1", entry("https://lizard.example/style.css", "a"))
            .await
            .unwrap();
        store
            .put("lizard-tap-v1", entry("https://lizard.example/style.css", "b"))
            .await
            .unwrap();
        store
            .put("lizard-tap-v2", entry("https://lizard.example/", "root"))
            .await
            .unwrap();

        let hit = store
            .get("lizard-tap-v1", "https://lizard.example/style.css")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.body, b"b");
        assert!(store
            .get("lizard-tap-v1", "https://lizard.example/other.css")
            .await
            .unwrap()
            .is_none());
        assert!(store
            .get("missing", "https://lizard.example/")
            .await
            .unwrap()
            .is_none());

        assert_eq!(
            store.keys().await.unwrap(),
            vec!["lizard-tap-v1".to_string(), "lizard-tap-v2".to_string()]
        );
        assert_eq!(
            store.entries("lizard-tap-v1").await.unwrap(),
            vec!["https://lizard.example/style.css".to_string()]
        );
        assert!(store.entries("missing").await.unwrap().is_empty());

        assert!(store.delete("lizard-tap-v1").await.unwrap());
        assert!(!store.delete("lizard-tap-v1").await.unwrap());
        assert_eq!(store.keys().await.unwrap(), vec!["lizard-tap-v2".to_string()]);
    }

    #[tokio::test]
    async fn test_memory_store() {
        exercise_store(&MemoryCacheStore::new()).await;
    }

    #[tokio::test]
    async fn test_disk_store() {
        let dir = tempfile::tempdir().unwrap();
        exercise_store(&DiskCacheStore::new(dir.path().join("caches"))).await;
    }

    #[tokio::test]
    async fn test_memory_quota() {
        let store = MemoryCacheStore::with_quota(1);
        store.put("b", entry("https://lizard.example/a", "1")).await.unwrap();
        // Replacing an existing key does not count against the quota.
        store.put("b", entry("https://lizard.example/a", "2")).await.unwrap();

        let err = store
            .put("b", entry("https://lizard.example/b", "3"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::QuotaExceeded { limit: 1, .. }));
    }

    #[tokio::test]
    async fn test_disk_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let body = vec![0u8, 159, 146, 150, 255];
        {
            let store = DiskCacheStore::new(dir.path());
            let mut binary = entry("https://lizard.example/lizard-sound.wav", "");
            binary.body = body.clone();
            store.put("lizard-tap-v1.0.0", binary).await.unwrap();
        }

        let store = DiskCacheStore::new(dir.path());
        let hit = store
            .get("lizard-tap-v1.0.0", "https://lizard.example/lizard-sound.wav")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.body, body);
    }

    #[tokio::test]
    async fn test_disk_store_handles_long_urls() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskCacheStore::new(dir.path());
        let long = format!("https://lizard.example/achievements.json?{}", "q".repeat(300));

        assert!(store.get("v", &long).await.unwrap().is_none());
        store.put("v", entry(&long, "[]")).await.unwrap();

        let hit = store.get("v", &long).await.unwrap().unwrap();
        assert_eq!(hit.url, long);
        assert_eq!(store.entries("v").await.unwrap(), vec![long]);
    }

    #[tokio::test]
    async fn test_disk_store_reports_corrupt_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskCacheStore::new(dir.path());
        store.open("v").await.unwrap();
        std::fs::write(store.entry_path("v", "https://lizard.example/"), b"not json").unwrap();

        let err = store.get("v", "https://lizard.example/").await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_puts_last_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DiskCacheStore::new(dir.path()));

        let writers: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .put("v", entry("https://lizard.example/score", &i.to_string()))
                        .await
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        let hit = store.get("v", "https://lizard.example/score").await.unwrap().unwrap();
        let value: u32 = String::from_utf8(hit.body).unwrap().parse().unwrap();
        assert!(value < 8);
        assert_eq!(store.entries("v").await.unwrap().len(), 1);
    }
}
