//! The bounded worker pool.
//!
//! Dispatch loop follows the same ticker-plus-shutdown-flag shape used
//! elsewhere in this crate (see the watcher's stability ticker), generalized
//! to spawn up to `max_concurrent - active` tasks per tick.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, warn};

use crate::queue::Queue;

/// The collaborator contract the pool executes against each `Processing`
/// item. Implementations must be idempotent with respect to `path` — safe
/// to retry — and must tolerate arbitrary metadata keys. `Err` and a panic
/// both count as a processing failure; only the message differs (panics are
/// reported with a fixed message since the payload isn't necessarily a
/// string).
#[async_trait]
pub trait ProcessingFn: Send + Sync {
    async fn process(&self, path: &std::path::Path, metadata: &HashMap<String, Value>) -> anyhow::Result<bool>;
}

/// Runs at most `max_concurrent` [`ProcessingFn`] invocations in parallel,
/// reporting outcomes back to the [`Queue`].
pub struct WorkerPool {
    queue: Arc<Queue>,
    processing_fn: Arc<dyn ProcessingFn>,
    max_concurrent: usize,
    processing_interval: Duration,
    active: Arc<AtomicUsize>,
    shutdown: Arc<RwLock<bool>>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<Queue>,
        processing_fn: Arc<dyn ProcessingFn>,
        max_concurrent: usize,
        processing_interval: Duration,
    ) -> Self {
        Self {
            queue,
            processing_fn,
            max_concurrent,
            processing_interval,
            active: Arc::new(AtomicUsize::new(0)),
            shutdown: Arc::new(RwLock::new(false)),
            dispatch_task: Mutex::new(None),
        }
    }

    /// Spawns the dispatch loop. A second `start()` while already running is
    /// a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.dispatch_task.lock().await;
        if task.is_some() {
            return;
        }
        *self.shutdown.write().await = false;

        let pool = self.clone();
        *task = Some(tokio::spawn(async move {
            let mut ticker = interval(pool.processing_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if *pool.shutdown.read().await {
                    break;
                }
                pool.dispatch_tick().await;
            }
        }));
    }

    async fn dispatch_tick(self: &Arc<Self>) {
        let active = self.active.load(Ordering::SeqCst);
        let available = self.max_concurrent.saturating_sub(active);
        if available == 0 {
            return;
        }

        let claimed = self.queue.claim_next(available).await;
        for item in claimed {
            self.active.fetch_add(1, Ordering::SeqCst);
            let pool = self.clone();
            tokio::spawn(async move {
                pool.run_one(item).await;
                pool.active.fetch_sub(1, Ordering::SeqCst);
            });
        }
    }

    async fn run_one(&self, item: crate::work_item::WorkItem) {
        let path = item.path.clone();
        debug!(path = %path.display(), "dispatching processing attempt");

        let outcome = AssertUnwindSafe(self.processing_fn.process(&path, &item.metadata))
            .catch_unwind()
            .await;

        let (ok, error) = match outcome {
            Ok(Ok(true)) => (true, None),
            Ok(Ok(false)) => (false, Some("returned false".to_string())),
            Ok(Err(err)) => (false, Some(err.to_string())),
            Err(_panic) => {
                error!(path = %path.display(), "processing function panicked");
                (false, Some("processing function panicked".to_string()))
            }
        };

        if !ok {
            warn!(path = %path.display(), error = error.as_deref().unwrap_or(""), "processing attempt failed");
        }
        self.queue.record_outcome(&path, ok, error).await;
    }

    /// Signals shutdown and waits up to `timeout` for active work to drain.
    /// Does not abort in-flight tasks: `ProcessingFn` is not preemptible, so
    /// this is a best-effort drain. Returns whether everything finished
    /// within the timeout.
    pub async fn stop(&self, timeout: Duration) -> bool {
        *self.shutdown.write().await = true;
        if let Some(task) = self.dispatch_task.lock().await.take() {
            let _ = tokio::time::timeout(timeout, task).await;
        }
        self.wait_all(timeout).await
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Polls `active_count` until it reaches zero or `timeout` elapses.
    pub async fn wait_all(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.active_count() == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicU32;
    use tempfile::TempDir;

    struct AlwaysOk;
    #[async_trait]
    impl ProcessingFn for AlwaysOk {
        async fn process(&self, _path: &std::path::Path, _metadata: &HashMap<String, Value>) -> anyhow::Result<bool> {
            Ok(true)
        }
    }

    struct AlwaysFalse;
    #[async_trait]
    impl ProcessingFn for AlwaysFalse {
        async fn process(&self, _path: &std::path::Path, _metadata: &HashMap<String, Value>) -> anyhow::Result<bool> {
            Ok(false)
        }
    }

    struct CountingThenOk {
        calls: Arc<AtomicU32>,
        succeed_after: u32,
    }
    #[async_trait]
    impl ProcessingFn for CountingThenOk {
        async fn process(&self, _path: &std::path::Path, _metadata: &HashMap<String, Value>) -> anyhow::Result<bool> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(n > self.succeed_after)
        }
    }

    async fn touch(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        tokio::fs::write(&path, b"data").await.unwrap();
        path
    }

    #[tokio::test]
    async fn successful_item_completes_exactly_once() {
        let persist = TempDir::new().unwrap();
        let watched = TempDir::new().unwrap();
        let queue = Arc::new(Queue::new(persist.path().to_path_buf()).await);
        let path = touch(&watched, "a.mp4").await;
        queue.add_file(path.clone(), 0, HashMap::new(), 3).await.unwrap();

        let pool = Arc::new(WorkerPool::new(
            queue.clone(),
            Arc::new(AlwaysOk),
            1,
            Duration::from_millis(20),
        ));
        pool.start().await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        pool.stop(Duration::from_secs(1)).await;

        let item = queue.get_state(&path).await.unwrap();
        assert_eq!(item.status, crate::work_item::Status::Completed);
    }

    #[tokio::test]
    async fn always_failing_item_ends_failed_after_max_retries() {
        let persist = TempDir::new().unwrap();
        let watched = TempDir::new().unwrap();
        let queue = Arc::new(Queue::new(persist.path().to_path_buf()).await);
        let path = touch(&watched, "a.mp4").await;
        queue.add_file(path.clone(), 0, HashMap::new(), 2).await.unwrap();

        let pool = Arc::new(WorkerPool::new(
            queue.clone(),
            Arc::new(AlwaysFalse),
            1,
            Duration::from_millis(20),
        ));
        pool.start().await;

        for _ in 0..2 {
            tokio::time::sleep(Duration::from_millis(80)).await;
            queue.retry(&path).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        pool.stop(Duration::from_secs(1)).await;

        let item = queue.get_state(&path).await.unwrap();
        assert_eq!(item.status, crate::work_item::Status::Failed);
        assert_eq!(item.error_count, 2);
    }

    #[tokio::test]
    async fn retry_then_succeed() {
        let persist = TempDir::new().unwrap();
        let watched = TempDir::new().unwrap();
        let queue = Arc::new(Queue::new(persist.path().to_path_buf()).await);
        let path = touch(&watched, "a.mp4").await;
        queue.add_file(path.clone(), 0, HashMap::new(), 3).await.unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let pool = Arc::new(WorkerPool::new(
            queue.clone(),
            Arc::new(CountingThenOk {
                calls: calls.clone(),
                succeed_after: 1,
            }),
            1,
            Duration::from_millis(20),
        ));
        pool.start().await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queue.get_state(&path).await.unwrap().status, crate::work_item::Status::Error);
        assert!(queue.retry(&path).await);

        tokio::time::sleep(Duration::from_millis(100)).await;
        pool.stop(Duration::from_secs(1)).await;

        let item = queue.get_state(&path).await.unwrap();
        assert_eq!(item.status, crate::work_item::Status::Completed);
        assert_eq!(item.error_count, 1);
    }

    #[tokio::test]
    async fn priority_item_starts_before_lower_priority_with_single_slot() {
        let persist = TempDir::new().unwrap();
        let watched = TempDir::new().unwrap();
        let queue = Arc::new(Queue::new(persist.path().to_path_buf()).await);

        let low = touch(&watched, "low.mp4").await;
        let mid = touch(&watched, "mid.mp4").await;
        let high = touch(&watched, "high.mp4").await;
        queue.add_file(low.clone(), 0, HashMap::new(), 3).await.unwrap();
        queue.add_file(mid.clone(), 5, HashMap::new(), 3).await.unwrap();
        queue.add_file(high.clone(), 10, HashMap::new(), 3).await.unwrap();

        let order: Arc<Mutex<Vec<PathBuf>>> = Arc::new(Mutex::new(Vec::new()));
        let order_cb = order.clone();
        struct RecordOrder {
            order: Arc<Mutex<Vec<PathBuf>>>,
        }
        #[async_trait]
        impl ProcessingFn for RecordOrder {
            async fn process(&self, path: &std::path::Path, _metadata: &HashMap<String, Value>) -> anyhow::Result<bool> {
                self.order.lock().await.push(path.to_path_buf());
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok(true)
            }
        }

        let pool = Arc::new(WorkerPool::new(
            queue.clone(),
            Arc::new(RecordOrder { order: order_cb }),
            1,
            Duration::from_millis(10),
        ));
        pool.start().await;
        tokio::time::sleep(Duration::from_millis(250)).await;
        pool.stop(Duration::from_secs(1)).await;

        let recorded = order.lock().await.clone();
        assert_eq!(recorded, vec![high, mid, low]);
    }
}
