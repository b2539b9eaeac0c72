use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle status of a [`WorkItem`]. `Completed` and `Failed` are terminal:
/// once reached, every other field is frozen except via `Remove`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Processing,
    Completed,
    Error,
    Failed,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed)
    }

    pub const ALL: [Status; 5] = [
        Status::Pending,
        Status::Processing,
        Status::Completed,
        Status::Error,
        Status::Failed,
    ];
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Pending => "pending",
            Status::Processing => "processing",
            Status::Completed => "completed",
            Status::Error => "error",
            Status::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// The unit of scheduling held by the queue.
///
/// `path` is the primary key within a single queue instance: re-adding an
/// already-present path is rejected with `AlreadyQueued` rather than
/// overwriting the existing item.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkItem {
    pub path: PathBuf,
    pub status: Status,
    pub priority: i64,
    pub added_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub metadata: HashMap<String, Value>,
}

impl WorkItem {
    pub fn new(
        path: PathBuf,
        priority: i64,
        metadata: HashMap<String, Value>,
        max_retries: u32,
    ) -> Self {
        Self {
            path,
            status: Status::Pending,
            priority,
            added_at: Utc::now(),
            started_at: None,
            ended_at: None,
            error_count: 0,
            max_retries,
            last_error: None,
            metadata,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_item_is_pending_with_no_timestamps() {
        let item = WorkItem::new(PathBuf::from("/a.mp4"), 0, HashMap::new(), 3);
        assert_eq!(item.status, Status::Pending);
        assert!(item.started_at.is_none());
        assert!(item.ended_at.is_none());
        assert_eq!(item.error_count, 0);
    }

    #[test]
    fn terminal_statuses() {
        assert!(Status::Completed.is_terminal());
        assert!(Status::Failed.is_terminal());
        assert!(!Status::Pending.is_terminal());
        assert!(!Status::Processing.is_terminal());
        assert!(!Status::Error.is_terminal());
    }
}
