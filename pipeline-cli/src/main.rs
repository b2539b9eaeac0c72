//! `pipeline-cli`: the ambient entrypoint around `pipeline-core`.
//!
//! Loads a `PipelineConfig` from TOML, lets CLI flags and environment
//! variables override it, wires up a demo `ProcessingFn` that simulates
//! audio track extraction, and runs the pipeline until interrupted.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use pipeline_core::{Pipeline, PipelineConfig, ProcessingFn};
use serde_json::Value;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "pipeline-cli")]
#[command(about = "Watches a directory and runs a processing function over stable arrivals")]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(long, env = "PIPELINE_CONFIG")]
    config: Option<PathBuf>,

    /// Directory to watch for new media (overrides config).
    #[arg(long, env = "PIPELINE_WATCH_DIR")]
    watch_dir: Option<PathBuf>,

    /// Directory processing output is written to (overrides config).
    #[arg(long, env = "PIPELINE_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Content-addressed cache root (overrides config).
    #[arg(long, env = "PIPELINE_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Ceiling on in-flight processing attempts (overrides config).
    #[arg(long, env = "PIPELINE_MAX_CONCURRENT")]
    max_concurrent: Option<usize>,

    /// How long to wait for in-flight work to drain on shutdown.
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    drain_timeout: Duration,
}

/// On-disk shape of `--config`, distinct from [`PipelineConfig`] in that
/// `watch_directory`/`output_directory` are optional here — the CLI flags
/// or environment may supply them instead.
#[derive(Debug, Default, serde::Deserialize)]
struct FileConfig {
    watch_directory: Option<PathBuf>,
    output_directory: Option<PathBuf>,
    cache_directory: Option<PathBuf>,
    file_patterns: Option<Vec<String>>,
    max_concurrent: Option<usize>,
    min_file_age_seconds: Option<u64>,
    stability_check_interval_seconds: Option<u64>,
    processing_interval_seconds: Option<f64>,
    retention_days: Option<i64>,
}

fn load_config(args: &Args) -> anyhow::Result<PipelineConfig> {
    let file_config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("reading config file {}: {e}", path.display()))?;
            toml::from_str::<FileConfig>(&text)
                .map_err(|e| anyhow::anyhow!("parsing config file {}: {e}", path.display()))?
        }
        None => FileConfig::default(),
    };

    let watch_directory = args
        .watch_dir
        .clone()
        .or(file_config.watch_directory)
        .ok_or_else(|| anyhow::anyhow!("watch_directory is required (--watch-dir, PIPELINE_WATCH_DIR, or config file)"))?;
    let output_directory = args
        .output_dir
        .clone()
        .or(file_config.output_directory)
        .ok_or_else(|| anyhow::anyhow!("output_directory is required (--output-dir, PIPELINE_OUTPUT_DIR, or config file)"))?;

    let mut config = PipelineConfig::new(watch_directory, output_directory);
    config.cache_directory = args.cache_dir.clone().or(file_config.cache_directory);
    if let Some(patterns) = file_config.file_patterns {
        config.file_patterns = patterns;
    }
    config.max_concurrent = args
        .max_concurrent
        .or(file_config.max_concurrent)
        .unwrap_or(config.max_concurrent);
    if let Some(v) = file_config.min_file_age_seconds {
        config.min_file_age_seconds = v;
    }
    if let Some(v) = file_config.stability_check_interval_seconds {
        config.stability_check_interval_seconds = v;
    }
    if let Some(v) = file_config.processing_interval_seconds {
        config.processing_interval_seconds = v;
    }
    if let Some(v) = file_config.retention_days {
        config.retention_days = v;
    }

    config.validate()?;
    Ok(config)
}

/// Stands in for a real downstream collaborator (audio track extraction +
/// handoff to transcription). The pipeline doesn't know or care what the
/// real work is — only that it returns success/failure for a given path
/// and metadata, per the `ProcessingFn` contract.
struct AudioExtractionDemo;

#[async_trait]
impl ProcessingFn for AudioExtractionDemo {
    async fn process(&self, path: &Path, metadata: &HashMap<String, Value>) -> anyhow::Result<bool> {
        let output_dir = metadata
            .get("output_dir")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .ok_or_else(|| anyhow::anyhow!("missing output_dir in metadata"))?;

        info!(path = %path.display(), "simulating audio extraction");
        tokio::time::sleep(Duration::from_millis(250)).await;

        tokio::fs::create_dir_all(&output_dir).await?;
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("output");
        let dest = output_dir.join(format!("{stem}.audio.out"));
        tokio::fs::write(&dest, b"simulated audio extraction output").await?;

        info!(path = %path.display(), output = %dest.display(), "audio extraction complete");
        Ok(true)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pipeline_cli=info,pipeline_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&args)?;
    info!(
        watch_dir = %config.watch_directory.display(),
        output_dir = %config.output_directory.display(),
        "configuration loaded"
    );

    tokio::fs::create_dir_all(&config.watch_directory).await?;
    tokio::fs::create_dir_all(&config.output_directory).await?;

    let pipeline = Arc::new(Pipeline::new(config, Arc::new(AudioExtractionDemo)).await?);
    pipeline.start().await?;
    info!("pipeline running, press ctrl-c to stop");

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to install ctrl-c handler, stopping immediately");
    } else {
        warn!("shutdown requested");
    }

    let drained = pipeline.stop(args.drain_timeout).await;
    if !drained {
        warn!("shutdown timed out before all in-flight work finished");
    }

    let status = pipeline.status().await;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
