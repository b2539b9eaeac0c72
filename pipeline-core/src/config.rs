use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Tunables recognized by the pipeline. Every field carries a default so partial
/// configuration payloads (e.g. a TOML file naming only `watch_directory`)
/// still produce a usable [`PipelineConfig`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Directory the watcher observes. Required — no default.
    pub watch_directory: PathBuf,

    /// Directory processing output is written to. Required — no default.
    pub output_directory: PathBuf,

    /// Root directory for the content-addressed cache. When unset, caching
    /// is disabled and the pipeline's `ProcessingFn` always misses.
    #[serde(default)]
    pub cache_directory: Option<PathBuf>,

    /// Case-insensitive glob patterns matched against file names.
    #[serde(default = "PipelineConfig::default_file_patterns")]
    pub file_patterns: Vec<String>,

    /// Ceiling on in-flight `ProcessingFn` invocations.
    #[serde(default = "PipelineConfig::default_max_concurrent")]
    pub max_concurrent: usize,

    /// Minimum age (seconds) a file must reach before it can be considered stable.
    #[serde(default = "PipelineConfig::default_min_file_age_seconds")]
    pub min_file_age_seconds: u64,

    /// Cadence (seconds) of the watcher's stability ticker.
    #[serde(default = "PipelineConfig::default_stability_check_interval_seconds")]
    pub stability_check_interval_seconds: u64,

    /// Cadence (seconds, fractional) of the worker pool's dispatch loop.
    #[serde(default = "PipelineConfig::default_processing_interval_seconds")]
    pub processing_interval_seconds: f64,

    /// Cache TTL in days, used as the default retention window for `Cleanup`.
    #[serde(default = "PipelineConfig::default_retention_days")]
    pub retention_days: i64,
}

impl PipelineConfig {
    pub fn new(watch_directory: PathBuf, output_directory: PathBuf) -> Self {
        Self {
            watch_directory,
            output_directory,
            cache_directory: None,
            file_patterns: Self::default_file_patterns(),
            max_concurrent: Self::default_max_concurrent(),
            min_file_age_seconds: Self::default_min_file_age_seconds(),
            stability_check_interval_seconds: Self::default_stability_check_interval_seconds(),
            processing_interval_seconds: Self::default_processing_interval_seconds(),
            retention_days: Self::default_retention_days(),
        }
    }

    fn default_file_patterns() -> Vec<String> {
        ["*.mp4", "*.mov", "*.webm", "*.mkv"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    const fn default_max_concurrent() -> usize {
        3
    }

    const fn default_min_file_age_seconds() -> u64 {
        5
    }

    const fn default_stability_check_interval_seconds() -> u64 {
        2
    }

    const fn default_processing_interval_seconds() -> f64 {
        1.0
    }

    const fn default_retention_days() -> i64 {
        30
    }

    /// Validates cross-field invariants the `Deserialize` impl can't express.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.max_concurrent == 0 {
            return Err(crate::error::PipelineError::InvalidConfig(
                "max_concurrent must be >= 1".into(),
            ));
        }
        if self.stability_check_interval_seconds == 0 {
            return Err(crate::error::PipelineError::InvalidConfig(
                "stability_check_interval_seconds must be >= 1".into(),
            ));
        }
        if self.processing_interval_seconds <= 0.0 {
            return Err(crate::error::PipelineError::InvalidConfig(
                "processing_interval_seconds must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_populates_expected_defaults() {
        let cfg = PipelineConfig::new(PathBuf::from("/watch"), PathBuf::from("/out"));
        assert_eq!(cfg.max_concurrent, 3);
        assert_eq!(cfg.min_file_age_seconds, 5);
        assert_eq!(cfg.stability_check_interval_seconds, 2);
        assert_eq!(cfg.processing_interval_seconds, 1.0);
        assert_eq!(cfg.retention_days, 30);
        assert_eq!(cfg.file_patterns, vec!["*.mp4", "*.mov", "*.webm", "*.mkv"]);
        assert!(cfg.cache_directory.is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_zero_concurrency() {
        let mut cfg = PipelineConfig::new(PathBuf::from("/watch"), PathBuf::from("/out"));
        cfg.max_concurrent = 0;
        assert!(cfg.validate().is_err());
    }
}
