//! The stability-aware file watcher.
//!
//! A `notify_debouncer_full` debouncer feeds raw filesystem events into a
//! `tokio::sync::mpsc` channel, and an async task drains that channel. This
//! watcher's job ends at "this path is stable" — the stability bookkeeping
//! itself is a dedicated `PendingEvent` ticker loop using
//! `tokio::time::interval` + `MissedTickBehavior::Skip` + a shutdown flag.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::RecursiveMode;
use notify_debouncer_full::{new_debouncer, DebounceEventResult, Debouncer, RecommendedCache};
use regex::Regex;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, Result};

/// A file seen but not yet confirmed stable. Rebuilt by re-scanning; never
/// persisted to disk.
#[derive(Clone, Debug)]
pub struct PendingEvent {
    pub path: PathBuf,
    pub first_seen: std::time::Instant,
    pub last_modified: std::time::Instant,
    pub last_size: u64,
    pub stable_ticks: u32,
}

impl PendingEvent {
    fn new(path: PathBuf, size: u64) -> Self {
        let now = std::time::Instant::now();
        Self {
            path,
            first_seen: now,
            last_modified: now,
            last_size: size,
            stable_ticks: 0,
        }
    }
}

type Callback = Arc<dyn Fn(PathBuf) + Send + Sync>;

struct RunHandles {
    _debouncer: Debouncer<notify::RecommendedWatcher, RecommendedCache>,
    event_task: JoinHandle<()>,
    ticker_task: JoinHandle<()>,
}

/// Converts raw filesystem events for a single flat directory into stable-file
/// notifications.
///
/// A path delivered once is never delivered again for the lifetime of this
/// `Watcher` instance — per the carried-over open question, re-delivery after
/// a run requires constructing a fresh `Watcher` (restarting the process, or
/// dropping and recreating it), not calling `stop()` then `start()` again.
pub struct Watcher {
    watch_dir: PathBuf,
    patterns: Vec<Regex>,
    min_file_age: Duration,
    stability_check_interval: Duration,
    delivered: Arc<Mutex<HashSet<PathBuf>>>,
    pending: Arc<Mutex<HashMap<PathBuf, PendingEvent>>>,
    shutdown: Arc<RwLock<bool>>,
    handles: Mutex<Option<RunHandles>>,
}

impl Watcher {
    /// Builds a watcher for `watch_dir`, compiling `patterns` (case-insensitive
    /// globs, e.g. `*.mp4`) into matchers. Returns `InvalidConfig` if a
    /// pattern fails to compile.
    pub fn new(
        watch_dir: PathBuf,
        patterns: &[String],
        min_file_age: Duration,
        stability_check_interval: Duration,
    ) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| compile_glob(p))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            watch_dir,
            patterns,
            min_file_age,
            stability_check_interval,
            delivered: Arc::new(Mutex::new(HashSet::new())),
            pending: Arc::new(Mutex::new(HashMap::new())),
            shutdown: Arc::new(RwLock::new(false)),
            handles: Mutex::new(None),
        })
    }

    fn matches(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        self.patterns.iter().any(|re| re.is_match(name))
    }

    /// Begins observation. Fails with `Watch` if `watch_dir` doesn't exist.
    /// `callback` is invoked once per stable arrival from this watcher's
    /// internal task — callers must be reentrancy-safe, as the component
    /// design requires.
    pub async fn start(
        self: &Arc<Self>,
        callback: impl Fn(PathBuf) + Send + Sync + 'static,
    ) -> Result<()> {
        if !self.watch_dir.is_dir() {
            return Err(PipelineError::Watch(format!(
                "watch directory does not exist: {}",
                self.watch_dir.display()
            )));
        }

        *self.shutdown.write().await = false;
        let callback: Callback = Arc::new(callback);

        // Open question carried from the source: the watcher does an initial
        // synchronous scan at start in addition to reacting to live events,
        // so files already sitting in the directory before the process came
        // up are still picked up.
        self.seed_from_existing_entries().await;

        let (event_tx, event_rx) = mpsc::unbounded_channel::<PathBuf>();
        let watch_dir = self.watch_dir.clone();

        let debouncer = new_debouncer(
            Duration::from_millis(200),
            None,
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    for event in events {
                        #[allow(deprecated)]
                        let inner = &event.event;
                        if !matches!(
                            inner.kind,
                            notify::EventKind::Create(_) | notify::EventKind::Modify(_)
                        ) {
                            continue;
                        }
                        for path in &inner.paths {
                            if path.parent() != Some(watch_dir.as_path()) {
                                continue; // non-recursive: ignore nested subdirectories
                            }
                            if event_tx.send(path.clone()).is_err() {
                                break;
                            }
                        }
                    }
                }
                Err(errors) => {
                    for e in errors {
                        warn!(error = %e, "file watcher debounce error");
                    }
                }
            },
        )
        .map_err(|e| PipelineError::Watch(format!("failed to create watcher: {e}")))?;

        let mut debouncer = debouncer;
        debouncer
            .watch(&self.watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| PipelineError::Watch(format!("failed to watch directory: {e}")))?;

        let event_task = self.clone().spawn_event_task(event_rx);
        let ticker_task = self.clone().spawn_ticker_task(callback);

        *self.handles.lock().await = Some(RunHandles {
            _debouncer: debouncer,
            event_task,
            ticker_task,
        });

        info!(dir = %self.watch_dir.display(), "watcher started");
        Ok(())
    }

    /// Ceases observation, joins internal workers, discards in-flight pending
    /// events.
    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
        if let Some(handles) = self.handles.lock().await.take() {
            let RunHandles {
                _debouncer,
                event_task,
                ticker_task,
            } = handles;
            // Dropping `_debouncer` here unwatches the directory so no further
            // events reach `event_task` before we wait for it.
            drop(_debouncer);
            let _ = event_task.await;
            let _ = ticker_task.await;
        }
        self.pending.lock().await.clear();
        info!("watcher stopped");
    }

    async fn seed_from_existing_entries(&self) {
        let mut entries = match tokio::fs::read_dir(&self.watch_dir).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %err, "failed initial directory scan");
                return;
            }
        };

        let mut pending = self.pending.lock().await;
        loop {
            let next = entries.next_entry().await;
            let entry = match next {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "error reading directory entry during initial scan");
                    break;
                }
            };
            let path = entry.path();
            if !path.is_file() || !self.matches(&path) {
                continue;
            }
            let size = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
            pending
                .entry(path.clone())
                .or_insert_with(|| PendingEvent::new(path, size));
        }
    }

    fn spawn_event_task(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<PathBuf>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(path) = rx.recv().await {
                if *self.shutdown.read().await {
                    break;
                }
                if !self.matches(&path) {
                    continue;
                }

                let size = match tokio::fs::metadata(&path).await {
                    Ok(meta) => meta.len(),
                    Err(_) => continue, // retired below by the ticker once it notices the path is gone
                };

                let mut pending = self.pending.lock().await;
                if self.delivered.lock().await.contains(&path) {
                    continue;
                }
                match pending.get_mut(&path) {
                    Some(existing) => {
                        if existing.last_size != size {
                            existing.last_size = size;
                            existing.stable_ticks = 0;
                            existing.last_modified = std::time::Instant::now();
                        }
                    }
                    None => {
                        debug!(path = %path.display(), "new pending file");
                        pending.insert(path.clone(), PendingEvent::new(path, size));
                    }
                }
            }
        })
    }

    fn spawn_ticker_task(self: Arc<Self>, callback: Callback) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.stability_check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                if *self.shutdown.read().await {
                    break;
                }
                self.run_stability_pass(&callback).await;
            }
        })
    }

    async fn run_stability_pass(&self, callback: &Callback) {
        let paths: Vec<PathBuf> = self.pending.lock().await.keys().cloned().collect();
        let mut stable = Vec::new();

        for path in paths {
            let metadata = match tokio::fs::metadata(&path).await {
                Ok(meta) => Some(meta),
                Err(_) => None,
            };

            let mut pending = self.pending.lock().await;
            let Some(entry) = pending.get_mut(&path) else {
                continue;
            };

            let Some(metadata) = metadata else {
                debug!(path = %path.display(), "pending file disappeared, dropping");
                pending.remove(&path);
                continue;
            };

            let size = metadata.len();
            if size == 0 {
                warn!(path = %path.display(), "empty file, dropping without delivery");
                pending.remove(&path);
                continue;
            }

            if size != entry.last_size {
                entry.last_size = size;
                entry.stable_ticks = 0;
                entry.last_modified = std::time::Instant::now();
                continue;
            }

            entry.stable_ticks += 1;
            let age = entry.first_seen.elapsed();
            if entry.stable_ticks >= 2 && age >= self.min_file_age {
                pending.remove(&path);
                stable.push(path);
            }
        }

        for path in stable {
            let mut delivered = self.delivered.lock().await;
            if !delivered.insert(path.clone()) {
                continue;
            }
            drop(delivered);

            info!(path = %path.display(), "file stable, delivering");
            let cb = callback.clone();
            let path_for_panic = path.clone();
            if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| cb(path))) {
                error!(
                    path = %path_for_panic.display(),
                    "watcher callback panicked, continuing"
                );
                drop(panic);
            }
        }
    }
}

/// Compiles a case-insensitive shell glob (`*`, `?`) into an anchored regex.
fn compile_glob(pattern: &str) -> Result<Regex> {
    let mut regex_src = String::from("(?i)^");
    for ch in pattern.chars() {
        match ch {
            '*' => regex_src.push_str(".*"),
            '?' => regex_src.push('.'),
            c => regex_src.push_str(&regex::escape(&c.to_string())),
        }
    }
    regex_src.push('$');
    Regex::new(&regex_src).map_err(|e| PipelineError::InvalidConfig(format!("bad glob {pattern:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;
    use tempfile::TempDir;

    fn default_patterns() -> Vec<String> {
        vec!["*.mp4".into(), "*.mov".into()]
    }

    #[test]
    fn glob_matches_case_insensitively() {
        let re = compile_glob("*.mp4").unwrap();
        assert!(re.is_match("Video.MP4"));
        assert!(re.is_match("video.mp4"));
        assert!(!re.is_match("video.mkv"));
    }

    #[test]
    fn glob_does_not_match_dotfiles_implicitly_but_does_match_suffix() {
        let re = compile_glob("*.mp4").unwrap();
        assert!(re.is_match(".hidden.mp4"));
        assert!(!re.is_match(".hidden"));
    }

    #[tokio::test]
    async fn start_fails_when_directory_missing() {
        let watcher = Arc::new(
            Watcher::new(
                PathBuf::from("/nonexistent/does/not/exist"),
                &default_patterns(),
                StdDuration::from_secs(0),
                StdDuration::from_millis(50),
            )
            .unwrap(),
        );
        let err = watcher.start(|_| {}).await.unwrap_err();
        assert!(matches!(err, PipelineError::Watch(_)));
    }

    #[tokio::test]
    async fn stable_file_is_delivered_exactly_once() {
        let dir = TempDir::new().unwrap();
        let watcher = Arc::new(
            Watcher::new(
                dir.path().to_path_buf(),
                &default_patterns(),
                StdDuration::from_millis(50),
                StdDuration::from_millis(30),
            )
            .unwrap(),
        );

        let count = Arc::new(AtomicUsize::new(0));
        let count_cb = count.clone();
        watcher
            .start(move |_path| {
                count_cb.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();

        tokio::fs::write(dir.path().join("a.mp4"), b"hello world")
            .await
            .unwrap();

        tokio::time::sleep(StdDuration::from_millis(400)).await;
        watcher.stop().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_file_is_never_delivered() {
        let dir = TempDir::new().unwrap();
        let watcher = Arc::new(
            Watcher::new(
                dir.path().to_path_buf(),
                &default_patterns(),
                StdDuration::from_millis(50),
                StdDuration::from_millis(30),
            )
            .unwrap(),
        );

        let count = Arc::new(AtomicUsize::new(0));
        let count_cb = count.clone();
        watcher.start(move |_| { count_cb.fetch_add(1, Ordering::SeqCst); }).await.unwrap();

        tokio::fs::write(dir.path().join("empty.mp4"), b"").await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(400)).await;
        watcher.stop().await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn non_matching_extension_is_ignored() {
        let dir = TempDir::new().unwrap();
        let watcher = Arc::new(
            Watcher::new(
                dir.path().to_path_buf(),
                &default_patterns(),
                StdDuration::from_millis(50),
                StdDuration::from_millis(30),
            )
            .unwrap(),
        );

        let count = Arc::new(AtomicUsize::new(0));
        let count_cb = count.clone();
        watcher.start(move |_| { count_cb.fetch_add(1, Ordering::SeqCst); }).await.unwrap();

        tokio::fs::write(dir.path().join("notes.txt"), b"hello").await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(300)).await;
        watcher.stop().await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
