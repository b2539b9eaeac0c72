//! Media ingestion and execution pipeline: a stability-aware file watcher
//! feeding a persistent priority queue drained by a bounded worker pool,
//! backed by a content-addressed cache and crash-safe on-disk state.
//!
//! At-least-once delivery is the contract, not exactly-once: a `Processing`
//! item found on disk at startup is rewritten to `Pending` and re-attempted,
//! so every [`worker_pool::ProcessingFn`] implementation must be idempotent
//! with respect to its path. A [`watcher::Watcher`] also never redelivers a
//! path it has already delivered during its own lifetime — to intentionally
//! re-process a directory's contents, clear the persistence directory and
//! construct a fresh [`pipeline::Pipeline`] rather than calling `stop`/`start`
//! on an existing one.

pub mod cache;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod queue;
pub mod state_store;
pub mod watcher;
pub mod work_item;
pub mod worker_pool;

pub use cache::CacheStore;
pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use pipeline::{Pipeline, PipelineStatus};
pub use queue::{CallbackEvent, Queue, QueueEvent, QueueStats};
pub use watcher::Watcher;
pub use work_item::{Status, WorkItem};
pub use worker_pool::{ProcessingFn, WorkerPool};
