//! Content-addressed cache: a namespaced key-value store used
//! to memoize expensive, deterministic `ProcessingFn` steps.
//!
//! A thin typed wrapper over `cacache`, used here for on-disk blob storage.
//! Unlike a content-hash blob store, entries are keyed with a caller-chosen string per
//! namespace rather than a content hash — `cacache::write`/`read` (not
//! `write_hash`/`read_hash`) — because here the key is the semantic cache
//! key (e.g. a source file's content digest plus a processing step name),
//! not the value's own hash. One cache root directory per namespace keeps
//! `Invalidate`/`Cleanup`/`Size` scoped without scanning unrelated entries.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::error::{PipelineError, Result};

/// Aggregate byte counts, as returned by [`CacheStore::size`].
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheSize {
    pub total_bytes: u64,
    pub per_namespace_bytes: HashMap<String, u64>,
}

/// Durable, namespaced content cache.
///
/// Every mutating operation (`store`, `invalidate*`, `cleanup`) is
/// serialized behind a process-local lock to prevent torn writes within
/// this process; reads are lock-free and treat a corrupt or missing entry as a miss.
#[derive(Debug)]
pub struct CacheStore {
    root: PathBuf,
    default_retention_days: i64,
    lock: tokio::sync::Mutex<()>,
}

impl CacheStore {
    pub fn new(root: PathBuf, default_retention_days: i64) -> Self {
        Self {
            root,
            default_retention_days,
            lock: tokio::sync::Mutex::new(()),
        }
    }

    fn namespace_dir(&self, namespace: &str) -> PathBuf {
        self.root.join(namespace)
    }

    /// Stores `value` under `(namespace, key)`, overwriting any prior entry.
    pub async fn store(&self, namespace: &str, key: &str, value: &[u8]) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let dir = self.namespace_dir(namespace);
        cacache::write(&dir, key, value)
            .await
            .map_err(|e| PipelineError::Internal(format!("cache write failed: {e}")))?;
        debug!(namespace, key, bytes = value.len(), "cache entry stored");
        Ok(true)
    }

    /// Reads the value at `(namespace, key)`. A missing or corrupted entry
    /// is a miss (`Ok(None)`), never an error.
    pub async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let dir = self.namespace_dir(namespace);
        match cacache::read(&dir, key).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(cacache::Error::EntryNotFound(_, _)) => Ok(None),
            Err(err @ (cacache::Error::IntegrityError(_) | cacache::Error::SizeMismatch(_, _))) => {
                warn!(namespace, key, error = %err, "cache entry failed integrity check, treating as miss");
                Ok(None)
            }
            Err(err) => {
                warn!(namespace, key, error = %err, "cache read error, treating as miss");
                Ok(None)
            }
        }
    }

    /// Whether `(namespace, key)` exists and, if `max_age_days` is given,
    /// is no older than that many days.
    pub async fn has_valid(&self, namespace: &str, key: &str, max_age_days: Option<i64>) -> bool {
        let dir = self.namespace_dir(namespace);
        let meta = match cacache::metadata(&dir, key).await {
            Ok(Some(meta)) => meta,
            Ok(None) => return false,
            Err(err) => {
                warn!(namespace, key, error = %err, "cache metadata lookup failed, treating as miss");
                return false;
            }
        };

        let Some(max_age_days) = max_age_days else {
            return true;
        };
        let written_at = entry_write_time(meta.time);
        let age = SystemTime::now()
            .duration_since(written_at)
            .unwrap_or(Duration::ZERO);
        age <= Duration::from_secs(max_age_days.max(0) as u64 * 86_400)
    }

    /// Removes one entry, or the whole namespace when `key` is `None`.
    /// Returns the number of entries removed.
    pub async fn invalidate(&self, namespace: &str, key: Option<&str>) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let dir = self.namespace_dir(namespace);

        match key {
            Some(key) => {
                let opts = cacache::index::RemoveOpts::new().remove_fully(true);
                match opts.remove(&dir, key).await {
                    Ok(()) => Ok(1),
                    Err(err) => Err(PipelineError::Internal(format!("cache invalidate failed: {err}"))),
                }
            }
            None => remove_namespace_dir(&dir).await,
        }
    }

    /// Removes every entry across every namespace. Returns the total count
    /// of entries removed.
    pub async fn invalidate_all(&self) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let mut total = 0usize;
        for namespace in self.list_namespaces()? {
            total += remove_namespace_dir(&self.namespace_dir(&namespace)).await?;
        }
        Ok(total)
    }

    /// Removes entries older than `retention_days` (or the store's
    /// configured default) across every namespace. Returns the count
    /// removed.
    pub async fn cleanup(&self, retention_days: Option<i64>) -> Result<usize> {
        let retention_days = retention_days.unwrap_or(self.default_retention_days);
        let cutoff = SystemTime::now()
            .checked_sub(Duration::from_secs(retention_days.max(0) as u64 * 86_400))
            .unwrap_or(UNIX_EPOCH);

        let _guard = self.lock.lock().await;
        let mut removed = 0usize;
        for namespace in self.list_namespaces()? {
            let dir = self.namespace_dir(&namespace);
            let stale: Vec<String> = cacache::list_sync(&dir)
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry_write_time(entry.time) < cutoff)
                .map(|entry| entry.key)
                .collect();

            for key in stale {
                let opts = cacache::index::RemoveOpts::new().remove_fully(true);
                if opts.remove(&dir, &key).await.is_ok() {
                    removed += 1;
                } else {
                    warn!(namespace = %namespace, key = %key, "failed to remove stale cache entry");
                }
            }
        }
        debug!(removed, retention_days, "cache cleanup pass complete");
        Ok(removed)
    }

    /// Total bytes used, broken down per namespace.
    pub fn size(&self) -> Result<CacheSize> {
        let mut per_namespace_bytes = HashMap::new();
        let mut total_bytes = 0u64;

        for namespace in self.list_namespaces()? {
            let dir = self.namespace_dir(&namespace);
            let bytes: u64 = cacache::list_sync(&dir)
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.size as u64)
                .sum();
            total_bytes += bytes;
            per_namespace_bytes.insert(namespace, bytes);
        }

        Ok(CacheSize {
            total_bytes,
            per_namespace_bytes,
        })
    }

    fn list_namespaces(&self) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(PipelineError::Io(err)),
        };

        let mut namespaces = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    namespaces.push(name.to_string());
                }
            }
        }
        Ok(namespaces)
    }
}

fn entry_write_time(time_ms: u128) -> SystemTime {
    let millis = u64::try_from(time_ms).unwrap_or(u64::MAX);
    UNIX_EPOCH + Duration::from_millis(millis)
}

async fn remove_namespace_dir(dir: &Path) -> Result<usize> {
    let count = cacache::list_sync(dir).filter_map(|entry| entry.ok()).count();
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(count),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(err) => Err(PipelineError::Io(err)),
    }
}
