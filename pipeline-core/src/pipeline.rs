//! Composition root: wires the Watcher, Queue, Worker Pool,
//! and Cache Store together and exposes a single start/stop/status surface.
//!
//! Domain processing itself (audio extraction, transcription, ...) is out of
//! scope here — callers supply their own [`ProcessingFn`]; this module only
//! wraps it with cache-consulting behavior and owns the wiring between
//! the other four components.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use md5::{Digest, Md5};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::cache::CacheStore;
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::queue::{Queue, QueueStats};
use crate::watcher::Watcher;
use crate::worker_pool::{ProcessingFn, WorkerPool};

const CACHE_NAMESPACE: &str = "audio_extraction";
const STATE_DIR_NAME: &str = ".queue_state";

/// Snapshot returned by [`Pipeline::status`].
#[derive(Clone, Debug, serde::Serialize)]
pub struct PipelineStatus {
    pub running: bool,
    pub watch_dir: PathBuf,
    pub output_dir: PathBuf,
    pub stats: PipelineCounters,
    pub monitor: MonitorStatus,
    pub queue: QueueStats,
}

#[derive(Clone, Copy, Debug, Default, serde::Serialize)]
pub struct PipelineCounters {
    pub detected: u64,
    pub processed: u64,
    pub errors: u64,
    pub cache_hits: u64,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct MonitorStatus {
    pub watch_dir: PathBuf,
    pub file_patterns: Vec<String>,
    pub active_workers: usize,
}

/// Wraps a caller-supplied [`ProcessingFn`] with cache-consulting behavior:
/// check the cache first, do the real work only on a miss, and remember
/// success on the way out.
struct CachingProcessingFn {
    inner: Arc<dyn ProcessingFn>,
    cache: Option<Arc<CacheStore>>,
    cache_hits: Arc<AtomicU64>,
}

#[async_trait]
impl ProcessingFn for CachingProcessingFn {
    async fn process(&self, path: &Path, metadata: &HashMap<String, Value>) -> anyhow::Result<bool> {
        let Some(cache) = &self.cache else {
            return self.inner.process(path, metadata).await;
        };

        let key = cache_key(path, metadata);
        if cache.get(CACHE_NAMESPACE, &key).await?.is_some() {
            self.cache_hits.fetch_add(1, Ordering::SeqCst);
            return Ok(true);
        }

        let ok = self.inner.process(path, metadata).await?;
        if ok {
            cache.store(CACHE_NAMESPACE, &key, b"done").await?;
        }
        Ok(ok)
    }
}

/// Builds the semantic cache key `<path>|<mtime>|<quality>|<format>` and
/// reduces it to an MD5 hex digest: a stable, fixed-width entry name where a
/// raw path could exceed filesystem name-length limits. `mtime` falls back
/// to 0 if the file has since disappeared; a miss is then the worst case,
/// not a crash.
fn cache_key(path: &Path, metadata: &HashMap<String, Value>) -> String {
    let mtime = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let quality = metadata.get("quality").and_then(Value::as_str).unwrap_or("standard");
    let format = metadata
        .get("desired_output_format")
        .and_then(Value::as_str)
        .unwrap_or("mp3");
    let semantic_key = format!("{}|{mtime}|{quality}|{format}", path.display());
    format!("{:x}", Md5::digest(semantic_key.as_bytes()))
}

/// Composition root wiring the watcher, queue, and worker pool together and
/// owning their shared lifecycle.
pub struct Pipeline {
    config: PipelineConfig,
    queue: Arc<Queue>,
    watcher: Arc<Watcher>,
    worker_pool: Arc<WorkerPool>,
    running: Arc<RwLock<bool>>,
    detected: Arc<AtomicU64>,
    cache_hits: Arc<AtomicU64>,
}

impl Pipeline {
    /// Builds a pipeline from `config`, wrapping `processing_fn` with
    /// cache-consulting behavior.
    ///
    /// Queue state persists under `<output_directory>/.queue_state` rather
    /// than under `cache_directory`, since the cache directory is subject to
    /// its own TTL cleanup and would otherwise risk the queue state file
    /// being swept during `cleanup`.
    pub async fn new(config: PipelineConfig, processing_fn: Arc<dyn ProcessingFn>) -> Result<Self> {
        config.validate()?;

        let persistence_dir = config.output_directory.join(STATE_DIR_NAME);
        let queue = Arc::new(Queue::new(persistence_dir).await);

        let cache = match &config.cache_directory {
            Some(dir) => Some(Arc::new(CacheStore::new(dir.clone(), config.retention_days))),
            None => None,
        };

        let watcher = Arc::new(Watcher::new(
            config.watch_directory.clone(),
            &config.file_patterns,
            Duration::from_secs(config.min_file_age_seconds),
            Duration::from_secs(config.stability_check_interval_seconds.max(1)),
        )?);

        let cache_hits = Arc::new(AtomicU64::new(0));
        let caching_fn = Arc::new(CachingProcessingFn {
            inner: processing_fn,
            cache,
            cache_hits: cache_hits.clone(),
        });

        let worker_pool = Arc::new(WorkerPool::new(
            queue.clone(),
            caching_fn,
            config.max_concurrent,
            Duration::from_secs_f64(config.processing_interval_seconds),
        ));

        Ok(Self {
            config,
            queue,
            watcher,
            worker_pool,
            running: Arc::new(RwLock::new(false)),
            detected: Arc::new(AtomicU64::new(0)),
            cache_hits,
        })
    }

    /// Start order: queue is already live from construction; bring the
    /// worker pool up first so it's ready to claim the moment the watcher
    /// starts delivering arrivals, then start the watcher.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.worker_pool.start().await;

        let queue = self.queue.clone();
        let detected = self.detected.clone();
        let output_dir = self.config.output_directory.clone();

        self.watcher
            .start(move |path| {
                detected.fetch_add(1, Ordering::SeqCst);
                let queue = queue.clone();
                let output_dir = output_dir.clone();
                tokio::spawn(async move {
                    let metadata = arrival_metadata(&path, &output_dir);
                    match queue.add_file(path.clone(), 0, metadata, 3).await {
                        Ok(_) => info!(path = %path.display(), "file submitted to queue"),
                        Err(crate::error::PipelineError::AlreadyQueued(_)) => {
                            warn!(path = %path.display(), "arrival already queued, ignoring");
                        }
                        Err(err) => warn!(path = %path.display(), error = %err, "failed to submit arrival"),
                    }
                });
            })
            .await?;

        *self.running.write().await = true;
        info!("pipeline started");
        Ok(())
    }

    /// Stop order: watcher first (quiesce input), then the worker pool,
    /// draining up to `timeout`. Returns whether the pool drained cleanly.
    pub async fn stop(&self, timeout: Duration) -> bool {
        self.watcher.stop().await;
        let drained = self.worker_pool.stop(timeout).await;
        *self.running.write().await = false;
        info!(drained, "pipeline stopped");
        drained
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    pub async fn status(&self) -> PipelineStatus {
        let queue_stats = self.queue.stats().await;
        PipelineStatus {
            running: self.is_running().await,
            watch_dir: self.config.watch_directory.clone(),
            output_dir: self.config.output_directory.clone(),
            stats: PipelineCounters {
                detected: self.detected.load(Ordering::SeqCst),
                processed: queue_stats.completed as u64,
                errors: (queue_stats.error + queue_stats.failed) as u64,
                cache_hits: self.cache_hits.load(Ordering::SeqCst),
            },
            monitor: MonitorStatus {
                watch_dir: self.config.watch_directory.clone(),
                file_patterns: self.config.file_patterns.clone(),
                active_workers: self.worker_pool.active_count(),
            },
            queue: queue_stats,
        }
    }

    pub async fn retry_errors(&self) -> usize {
        self.queue.retry_all_errors().await
    }

    pub async fn clear_completed(&self) -> usize {
        self.queue.clear_completed().await
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }
}

fn arrival_metadata(path: &Path, output_dir: &Path) -> HashMap<String, Value> {
    let mut metadata = HashMap::new();
    metadata.insert("source_path".to_string(), json!(path.display().to_string()));
    metadata.insert("desired_output_format".to_string(), json!("mp3"));
    metadata.insert("quality".to_string(), json!("standard"));
    metadata.insert("output_dir".to_string(), json!(output_dir.display().to_string()));
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    struct AlwaysOk(Arc<AtomicUsize>);
    #[async_trait]
    impl ProcessingFn for AlwaysOk {
        async fn process(&self, _path: &Path, _metadata: &HashMap<String, Value>) -> anyhow::Result<bool> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    fn test_config(watch: &TempDir, out: &TempDir, cache: Option<&TempDir>) -> PipelineConfig {
        let mut cfg = PipelineConfig::new(watch.path().to_path_buf(), out.path().to_path_buf());
        cfg.cache_directory = cache.map(|d| d.path().to_path_buf());
        cfg.min_file_age_seconds = 0;
        cfg.stability_check_interval_seconds = 1;
        cfg.processing_interval_seconds = 0.05;
        cfg
    }

    #[tokio::test]
    async fn happy_path_file_completes_and_is_cached() {
        let watch = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let cache_dir = TempDir::new().unwrap();
        let cfg = test_config(&watch, &out, Some(&cache_dir));

        let calls = Arc::new(AtomicUsize::new(0));
        let pipeline = Arc::new(Pipeline::new(cfg, Arc::new(AlwaysOk(calls.clone()))).await.unwrap());
        pipeline.start().await.unwrap();

        tokio::fs::write(watch.path().join("a.mp4"), b"hello world").await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        pipeline.stop(Duration::from_secs(2)).await;

        let status = pipeline.status().await;
        assert_eq!(status.stats.detected, 1);
        assert_eq!(status.stats.processed, 1);
        assert_eq!(status.stats.errors, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cached_key_skips_the_inner_processing_fn() {
        let watch = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let cache_dir = TempDir::new().unwrap();

        let path = watch.path().join("a.mp4");
        tokio::fs::write(&path, b"hello").await.unwrap();
        let metadata = arrival_metadata(&path, out.path());
        let key = cache_key(&path, &metadata);

        let cache = Arc::new(CacheStore::new(cache_dir.path().to_path_buf(), 30));
        cache.store(CACHE_NAMESPACE, &key, b"done").await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let cache_hits = Arc::new(AtomicU64::new(0));
        let caching = CachingProcessingFn {
            inner: Arc::new(AlwaysOk(calls.clone())),
            cache: Some(cache),
            cache_hits: cache_hits.clone(),
        };

        let ok = caching.process(&path, &metadata).await.unwrap();
        assert!(ok);
        assert_eq!(calls.load(Ordering::SeqCst), 0, "inner fn must not run on a cache hit");
        assert_eq!(cache_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn status_reports_idle_before_start() {
        let watch = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let cfg = test_config(&watch, &out, None);
        let pipeline = Arc::new(
            Pipeline::new(cfg, Arc::new(AlwaysOk(Arc::new(AtomicUsize::new(0)))))
                .await
                .unwrap(),
        );
        let status = pipeline.status().await;
        assert!(!status.running);
        assert_eq!(status.queue.total, 0);
    }
}
