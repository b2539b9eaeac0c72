//! Atomic on-disk persistence of queue contents.
//!
//! Follows the tmp-file-then-rename idiom commonly used for durable blob
//! writes, adapted here for a single mutable JSON document instead of an
//! immutable content-addressed blob.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::work_item::{Status, WorkItem};

const STATE_FILE_NAME: &str = "queue_state.json";

/// On-disk envelope. Field names follow the external wire contract, which
/// differs from `WorkItem`'s in-memory field names (`file_path` vs. `path`,
/// `added_time` vs. `added_at`, ...).
#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    queue: HashMap<String, PersistedItem>,
    saved_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedItem {
    file_path: String,
    status: Status,
    priority: i64,
    added_time: Option<DateTime<Utc>>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    error_count: u32,
    #[serde(default = "default_max_retries")]
    max_retries: u32,
    #[serde(default)]
    last_error: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, Value>,
}

fn default_max_retries() -> u32 {
    3
}

impl From<&WorkItem> for PersistedItem {
    fn from(item: &WorkItem) -> Self {
        Self {
            file_path: item.path.to_string_lossy().into_owned(),
            status: item.status,
            priority: item.priority,
            added_time: Some(item.added_at),
            start_time: item.started_at,
            end_time: item.ended_at,
            error_count: item.error_count,
            max_retries: item.max_retries,
            last_error: item.last_error.clone(),
            metadata: item.metadata.clone(),
        }
    }
}

/// Durable store for a [`crate::queue::Queue`]'s contents.
///
/// Every mutating queue operation calls [`StateStore::save`] with a
/// snapshot of the current items; writes are best-effort (failures are
/// logged, never propagated) since the in-memory map is the source of
/// truth; a failed save just means a crash would replay more work.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn state_file_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE_NAME)
    }

    /// Write protocol: write to `<dir>/queue_state.json.tmp`, flush, then
    /// atomically rename over `<dir>/queue_state.json`. Best-effort: I/O
    /// failures are logged and swallowed.
    pub async fn save(&self, items: &HashMap<PathBuf, WorkItem>) {
        if let Err(err) = self.try_save(items).await {
            warn!(error = %err, "failed to persist queue state");
        }
    }

    async fn try_save(&self, items: &HashMap<PathBuf, WorkItem>) -> crate::error::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let queue = items
            .iter()
            .map(|(path, item)| (path.to_string_lossy().into_owned(), PersistedItem::from(item)))
            .collect();
        let doc = StateFile {
            queue,
            saved_at: Utc::now(),
        };
        let bytes = serde_json::to_vec_pretty(&doc)?;

        let final_path = self.state_file_path();
        let tmp_path = self
            .dir
            .join(format!("{STATE_FILE_NAME}.tmp-{}", Uuid::new_v4().simple()));

        let mut file = tokio::fs::File::create(&tmp_path).await?;
        use tokio::io::AsyncWriteExt;
        file.write_all(&bytes).await?;
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&tmp_path, &final_path).await?;
        debug!(path = %final_path.display(), bytes = bytes.len(), "queue state persisted");
        Ok(())
    }

    /// Load protocol, run once at queue construction.
    ///
    /// - Missing/unreadable file: start empty, log.
    /// - Unparseable/missing top-level key: start empty, log a warning.
    /// - Items whose path no longer exists on disk are skipped with a warning.
    /// - `Processing` items are rewritten to `Pending` (start/end cleared) —
    ///   the prior run's worker is gone, and this is what makes recovery
    ///   safe under the at-least-once contract.
    /// - Terminal and `Error` states are restored verbatim, including
    ///   `error_count`.
    pub async fn load(&self) -> HashMap<PathBuf, WorkItem> {
        let path = self.state_file_path();
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                info!(path = %path.display(), error = %err, "no prior queue state, starting empty");
                return HashMap::new();
            }
        };

        let doc: StateFile = match serde_json::from_slice(&bytes) {
            Ok(doc) => doc,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "queue state unreadable, starting empty");
                return HashMap::new();
            }
        };

        let mut items = HashMap::new();
        for (path_str, persisted) in doc.queue {
            let file_path = PathBuf::from(&path_str);
            if !file_path.exists() {
                warn!(path = %path_str, "skipping persisted item whose file no longer exists");
                continue;
            }

            let (status, started_at, ended_at) = if persisted.status == Status::Processing {
                (Status::Pending, None, None)
            } else {
                (persisted.status, persisted.start_time, persisted.end_time)
            };

            let item = WorkItem {
                path: file_path,
                status,
                priority: persisted.priority,
                added_at: persisted.added_time.unwrap_or_else(Utc::now),
                started_at,
                ended_at,
                error_count: persisted.error_count,
                max_retries: persisted.max_retries,
                last_error: persisted.last_error,
                metadata: persisted.metadata,
            };
            items.insert(item.path.clone(), item);
        }

        info!(count = items.len(), "loaded persisted queue state");
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;
    use std::path::Path;
    use tempfile::TempDir;

    fn item(path: &Path, status: Status, priority: i64) -> WorkItem {
        let mut item = WorkItem::new(path.to_path_buf(), priority, Map::new(), 3);
        item.status = status;
        if status == Status::Processing {
            item.started_at = Some(Utc::now());
        }
        item
    }

    #[tokio::test]
    async fn round_trips_non_processing_items() {
        let dir = TempDir::new().unwrap();
        let watched = TempDir::new().unwrap();
        let file_path = watched.path().join("a.mp4");
        std::fs::write(&file_path, b"data").unwrap();

        let store = StateStore::new(dir.path().to_path_buf());
        let mut items = HashMap::new();
        items.insert(file_path.clone(), item(&file_path, Status::Completed, 5));
        store.save(&items).await;

        let loaded = store.load().await;
        let restored = loaded.get(&file_path).unwrap();
        assert_eq!(restored.status, Status::Completed);
        assert_eq!(restored.priority, 5);
    }

    #[tokio::test]
    async fn processing_items_reload_as_pending() {
        let dir = TempDir::new().unwrap();
        let watched = TempDir::new().unwrap();
        let file_path = watched.path().join("b.mp4");
        std::fs::write(&file_path, b"data").unwrap();

        let store = StateStore::new(dir.path().to_path_buf());
        let mut items = HashMap::new();
        items.insert(file_path.clone(), item(&file_path, Status::Processing, 0));
        store.save(&items).await;

        let loaded = store.load().await;
        let restored = loaded.get(&file_path).unwrap();
        assert_eq!(restored.status, Status::Pending);
        assert!(restored.started_at.is_none());
        assert!(restored.ended_at.is_none());
    }

    #[tokio::test]
    async fn missing_files_are_dropped_on_reload() {
        let dir = TempDir::new().unwrap();
        let missing = PathBuf::from("/nonexistent/path/ghost.mp4");

        let store = StateStore::new(dir.path().to_path_buf());
        let mut items = HashMap::new();
        items.insert(missing.clone(), item(&missing, Status::Pending, 0));
        store.save(&items).await;

        let loaded = store.load().await;
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn unreadable_state_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.path().join(STATE_FILE_NAME), b"not json")
            .await
            .unwrap();

        let store = StateStore::new(dir.path().to_path_buf());
        let loaded = store.load().await;
        assert!(loaded.is_empty());
    }
}
