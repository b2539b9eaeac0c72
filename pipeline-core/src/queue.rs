//! The persistent priority queue.
//!
//! A single [`tokio::sync::Mutex`] guards both the primary `path -> WorkItem`
//! map and the per-status index sets, exactly as `WeightedFairScheduler`
//! guards its library/priority counters with one lock. Registered callbacks
//! fire synchronously while that lock is held; they must not call back into
//! the queue; doing so deadlocks.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::state_store::StateStore;
use crate::work_item::{Status, WorkItem};

/// Aggregate counts by status, as returned by [`Queue::stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub error: usize,
    pub failed: usize,
}

/// Event payload delivered to callbacks registered via [`Queue::register_callback`].
#[derive(Clone, Debug)]
pub enum QueueEvent {
    Added(WorkItem),
    StatusChanged { item: WorkItem, previous: Status },
    Removed(WorkItem),
}

type Callback = Arc<dyn Fn(&QueueEvent) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    added: Vec<Callback>,
    status_changed: Vec<Callback>,
    removed: Vec<Callback>,
}

struct QueueState {
    items: HashMap<PathBuf, WorkItem>,
    by_status: HashMap<Status, HashSet<PathBuf>>,
}

impl QueueState {
    fn new() -> Self {
        let mut by_status = HashMap::new();
        for status in Status::ALL {
            by_status.insert(status, HashSet::new());
        }
        Self {
            items: HashMap::new(),
            by_status,
        }
    }

    fn index_insert(&mut self, status: Status, path: PathBuf) {
        self.by_status.entry(status).or_default().insert(path);
    }

    fn index_remove(&mut self, status: Status, path: &Path) {
        if let Some(set) = self.by_status.get_mut(&status) {
            set.remove(path);
        }
    }

    fn move_status(&mut self, path: &Path, from: Status, to: Status) {
        self.index_remove(from, path);
        self.index_insert(to, path.to_path_buf());
    }
}

/// The persistent priority queue.
pub struct Queue {
    state: tokio::sync::Mutex<QueueState>,
    store: StateStore,
    callbacks: std::sync::Mutex<Callbacks>,
}

impl Queue {
    /// Constructs a queue, loading any persisted state from `persistence_dir`.
    pub async fn new(persistence_dir: PathBuf) -> Self {
        let store = StateStore::new(persistence_dir);
        let items = store.load().await;

        let mut state = QueueState::new();
        for (path, item) in items {
            state.index_insert(item.status, path.clone());
            state.items.insert(path, item);
        }

        Self {
            state: tokio::sync::Mutex::new(state),
            store,
            callbacks: std::sync::Mutex::new(Callbacks::default()),
        }
    }

    pub fn register_callback(&self, event: CallbackEvent, cb: impl Fn(&QueueEvent) + Send + Sync + 'static) {
        let cb: Callback = Arc::new(cb);
        let mut callbacks = self.callbacks.lock().unwrap_or_else(|p| p.into_inner());
        match event {
            CallbackEvent::Added => callbacks.added.push(cb),
            CallbackEvent::StatusChanged => callbacks.status_changed.push(cb),
            CallbackEvent::Removed => callbacks.removed.push(cb),
        }
    }

    fn fire(&self, event: QueueEvent) {
        let callbacks = self.callbacks.lock().unwrap_or_else(|p| p.into_inner());
        let list = match &event {
            QueueEvent::Added(_) => &callbacks.added,
            QueueEvent::StatusChanged { .. } => &callbacks.status_changed,
            QueueEvent::Removed(_) => &callbacks.removed,
        };
        // Clone the handle list so a callback that panics or is slow doesn't
        // hold the callback registry lock; the queue-wide state lock (held by
        // the caller) is the one callbacks must not re-enter.
        let list: Vec<Callback> = list.clone();
        drop(callbacks);
        for cb in list {
            cb(&event);
        }
    }

    async fn persist(&self, state: &QueueState) {
        self.store.save(&state.items).await;
    }

    /// Adds a new file to the queue. Fails with `AlreadyQueued` if `path` is
    /// already present; the existing item is left untouched in that case.
    pub async fn add_file(
        &self,
        path: PathBuf,
        priority: i64,
        metadata: HashMap<String, Value>,
        max_retries: u32,
    ) -> Result<WorkItem> {
        let mut state = self.state.lock().await;
        if state.items.contains_key(&path) {
            return Err(PipelineError::AlreadyQueued(path));
        }

        let item = WorkItem::new(path.clone(), priority, metadata, max_retries);
        state.index_insert(Status::Pending, path.clone());
        state.items.insert(path, item.clone());
        self.fire(QueueEvent::Added(item.clone()));
        self.persist(&state).await;
        debug!(path = %item.path.display(), priority, "item added to queue");
        Ok(item)
    }

    pub async fn remove_file(&self, path: &Path) -> Result<WorkItem> {
        let mut state = self.state.lock().await;
        let item = state
            .items
            .remove(path)
            .ok_or_else(|| PipelineError::NotFound(path.to_path_buf()))?;
        state.index_remove(item.status, path);
        self.fire(QueueEvent::Removed(item.clone()));
        self.persist(&state).await;
        Ok(item)
    }

    pub async fn get_state(&self, path: &Path) -> Result<WorkItem> {
        let state = self.state.lock().await;
        state
            .items
            .get(path)
            .cloned()
            .ok_or_else(|| PipelineError::NotFound(path.to_path_buf()))
    }

    pub async fn list_by_status(&self, status: Status) -> Vec<PathBuf> {
        let state = self.state.lock().await;
        state
            .by_status
            .get(&status)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        QueueStats {
            total: state.items.len(),
            pending: state.by_status.get(&Status::Pending).map_or(0, |s| s.len()),
            processing: state.by_status.get(&Status::Processing).map_or(0, |s| s.len()),
            completed: state.by_status.get(&Status::Completed).map_or(0, |s| s.len()),
            error: state.by_status.get(&Status::Error).map_or(0, |s| s.len()),
            failed: state.by_status.get(&Status::Failed).map_or(0, |s| s.len()),
        }
    }

    /// Resets an `Error` item back to `Pending` if it still has retries left.
    /// Returns `false` if the item is missing, not in `Error`, or exhausted.
    pub async fn retry(&self, path: &Path) -> bool {
        let mut state = self.state.lock().await;
        let Some(item) = state.items.get(path) else {
            return false;
        };
        if item.status != Status::Error || item.error_count >= item.max_retries {
            return false;
        }

        let previous = item.status;
        let mut updated = item.clone();
        updated.status = Status::Pending;
        updated.started_at = None;
        updated.ended_at = None;
        state.items.insert(path.to_path_buf(), updated.clone());
        state.move_status(path, previous, Status::Pending);

        self.fire(QueueEvent::StatusChanged {
            item: updated,
            previous,
        });
        self.persist(&state).await;
        true
    }

    pub async fn retry_all_errors(&self) -> usize {
        let mut state = self.state.lock().await;
        let error_paths: Vec<PathBuf> = state
            .by_status
            .get(&Status::Error)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();

        let mut count = 0usize;
        let mut changed = Vec::new();
        for path in error_paths {
            let Some(item) = state.items.get(&path) else {
                continue;
            };
            if item.error_count >= item.max_retries {
                continue;
            }
            let mut updated = item.clone();
            updated.status = Status::Pending;
            updated.started_at = None;
            updated.ended_at = None;
            state.items.insert(path.clone(), updated.clone());
            state.move_status(&path, Status::Error, Status::Pending);
            changed.push(updated);
            count += 1;
        }

        for updated in changed {
            self.fire(QueueEvent::StatusChanged {
                item: updated,
                previous: Status::Error,
            });
        }
        if count > 0 {
            self.persist(&state).await;
        }
        count
    }

    pub async fn clear_completed(&self) -> usize {
        let mut state = self.state.lock().await;
        let completed_paths: Vec<PathBuf> = state
            .by_status
            .get(&Status::Completed)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();

        let mut removed = Vec::new();
        for path in &completed_paths {
            if let Some(item) = state.items.remove(path) {
                state.index_remove(Status::Completed, path);
                removed.push(item);
            }
        }
        let count = removed.len();
        for item in removed {
            self.fire(QueueEvent::Removed(item));
        }
        if count > 0 {
            self.persist(&state).await;
        }
        count
    }

    /// Scheduling policy used by the worker pool: returns up to `n` pending
    /// items ordered by `(priority desc, added_at asc)`, atomically marking
    /// each `Processing` with `started_at = now` before returning.
    pub async fn claim_next(&self, n: usize) -> Vec<WorkItem> {
        if n == 0 {
            return Vec::new();
        }

        let mut state = self.state.lock().await;
        let pending_paths: Vec<PathBuf> = state
            .by_status
            .get(&Status::Pending)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();

        let mut candidates: Vec<WorkItem> = pending_paths
            .into_iter()
            .filter_map(|p| state.items.get(&p).cloned())
            .collect();
        candidates.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.added_at.cmp(&b.added_at)));
        candidates.truncate(n);

        let now = Utc::now();
        let mut claimed = Vec::with_capacity(candidates.len());
        for mut item in candidates {
            let path = item.path.clone();
            item.status = Status::Processing;
            item.started_at = Some(now);
            state.items.insert(path.clone(), item.clone());
            state.move_status(&path, Status::Pending, Status::Processing);
            self.fire(QueueEvent::StatusChanged {
                item: item.clone(),
                previous: Status::Pending,
            });
            claimed.push(item);
        }

        if !claimed.is_empty() {
            self.persist(&state).await;
        }
        claimed
    }

    /// Applies the outcome of a processing attempt: success -> `Completed`;
    /// failure increments `error_count` and transitions to `Error` or, once
    /// `error_count >= max_retries`, to `Failed`.
    pub async fn record_outcome(&self, path: &Path, ok: bool, error: Option<String>) {
        let mut state = self.state.lock().await;
        let Some(item) = state.items.get(path).cloned() else {
            warn!(path = %path.display(), "record_outcome for unknown item");
            return;
        };

        let previous = item.status;
        let mut updated = item;
        updated.ended_at = Some(Utc::now());

        if ok {
            updated.status = Status::Completed;
        } else {
            updated.error_count += 1;
            updated.last_error = error;
            updated.status = if updated.error_count >= updated.max_retries {
                Status::Failed
            } else {
                Status::Error
            };
        }

        state.items.insert(path.to_path_buf(), updated.clone());
        state.move_status(path, previous, updated.status);
        self.fire(QueueEvent::StatusChanged {
            item: updated,
            previous,
        });
        self.persist(&state).await;
    }
}

/// Selector for [`Queue::register_callback`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CallbackEvent {
    Added,
    StatusChanged,
    Removed,
}
