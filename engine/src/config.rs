//! Engine configuration.
//!
//! Every field has a default, so an empty JSON object is a valid
//! configuration. Files may either hold the fields at top level or nest them
//! under a `"backup"` section next to settings of other components.

use crate::checksums::ChecksumAlgorithm;
use crate::error::{EngineError, Result};
use crate::exclusion::DEFAULT_EXCLUDES;
use crate::fs_ops::{CopyOptions, Verification};
use crate::health::ResourceThresholds;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings shared by every run of one engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Bytes per read/write during a copy
    pub chunk_size: usize,
    pub verify_after_copy: bool,
    /// Digest used for verification; `None` verifies sizes only
    pub checksum_algorithm: Option<ChecksumAlgorithm>,
    /// Keep going after a per-file error instead of waiting for a decision
    pub auto_continue_on_error: bool,
    pub exclude_patterns: Vec<String>,
    pub min_file_size: Option<u64>,
    pub max_file_size: Option<u64>,
    pub checkpoint_interval_secs: u64,
    /// Where the checkpoint lives; the destination root when unset
    pub state_dir: Option<PathBuf>,
    /// Where run reports are written; not written when unset
    pub report_dir: Option<PathBuf>,
    pub thresholds: ResourceThresholds,
    pub health_sample_interval_ms: u64,
    pub throttle_initial_backoff_ms: u64,
    pub throttle_max_backoff_ms: u64,
    pub throttle_max_wait_secs: u64,
    pub cache_capacity: usize,
    pub cache_cleanup_ratio: f64,
    pub cache_ttl_secs: u64,
    /// Abort before copying when the destination disk lacks the space
    pub check_free_space: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            chunk_size: 1024 * 1024,
            verify_after_copy: true,
            checksum_algorithm: Some(ChecksumAlgorithm::Sha256),
            auto_continue_on_error: false,
            exclude_patterns: DEFAULT_EXCLUDES.iter().map(|p| p.to_string()).collect(),
            min_file_size: None,
            max_file_size: None,
            checkpoint_interval_secs: 30,
            state_dir: None,
            report_dir: None,
            thresholds: ResourceThresholds::default(),
            health_sample_interval_ms: 2000,
            throttle_initial_backoff_ms: 250,
            throttle_max_backoff_ms: 5000,
            throttle_max_wait_secs: 60,
            cache_capacity: 10_000,
            cache_cleanup_ratio: 0.2,
            cache_ttl_secs: 30,
            check_free_space: true,
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file, using its `"backup"` section when present.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| EngineError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(content)?;
        let section = value.get("backup").cloned().unwrap_or(value);
        let config: EngineConfig = serde_json::from_value(section)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(EngineError::InvalidConfig(
                "chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.cache_capacity == 0 {
            return Err(EngineError::InvalidConfig(
                "cache_capacity must be greater than zero".to_string(),
            ));
        }
        if !(self.cache_cleanup_ratio > 0.0 && self.cache_cleanup_ratio <= 1.0) {
            return Err(EngineError::InvalidConfig(format!(
                "cache_cleanup_ratio must be in (0, 1], got {}",
                self.cache_cleanup_ratio
            )));
        }
        for (name, value) in [
            ("cpu_percent", self.thresholds.cpu_percent),
            ("memory_percent", self.thresholds.memory_percent),
            ("disk_percent", self.thresholds.disk_percent),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                return Err(EngineError::InvalidConfig(format!(
                    "threshold {} must be in (0, 100], got {}",
                    name, value
                )));
            }
        }
        if let (Some(min), Some(max)) = (self.min_file_size, self.max_file_size) {
            if min > max {
                return Err(EngineError::InvalidConfig(format!(
                    "min_file_size {} is larger than max_file_size {}",
                    min, max
                )));
            }
        }
        Ok(())
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }

    pub fn health_sample_interval(&self) -> Duration {
        Duration::from_millis(self.health_sample_interval_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Per-run overrides of [`EngineConfig`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub verify_after_copy: Option<bool>,
    pub auto_continue_on_error: Option<bool>,
    pub chunk_size: Option<usize>,
}

/// Settings of one run after applying [`RunOptions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveOptions {
    pub copy: CopyOptions,
    pub auto_continue_on_error: bool,
}

impl RunOptions {
    pub fn resolve(&self, config: &EngineConfig) -> EffectiveOptions {
        let verify = self.verify_after_copy.unwrap_or(config.verify_after_copy);
        let verification = match (verify, config.checksum_algorithm) {
            (false, _) => Verification::Off,
            (true, Some(algorithm)) => Verification::Checksum(algorithm),
            (true, None) => Verification::Size,
        };
        EffectiveOptions {
            copy: CopyOptions {
                chunk_size: self.chunk_size.unwrap_or(config.chunk_size).max(1),
                verification,
            },
            auto_continue_on_error: self
                .auto_continue_on_error
                .unwrap_or(config.auto_continue_on_error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.chunk_size, 1024 * 1024);
        assert!(config.verify_after_copy);
        assert!(!config.auto_continue_on_error);
        assert_eq!(config.exclude_patterns, vec!["*.tmp", "~*", "Thumbs.db", ".DS_Store"]);
        assert_eq!(config.thresholds.disk_percent, 90.0);
        assert_eq!(config.cache_capacity, 10_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backup_section_is_used() {
        let json = r#"{
            "theme": "dark",
            "backup": { "chunk_size": 4096, "auto_continue_on_error": true }
        }"#;
        let config = EngineConfig::from_json_str(json).expect("Failed to parse config");
        assert_eq!(config.chunk_size, 4096);
        assert!(config.auto_continue_on_error);
        // Unset fields fall back to defaults
        assert_eq!(config.checkpoint_interval_secs, 30);
    }

    #[test]
    fn test_top_level_fields_and_null_algorithm() {
        let json = r#"{ "checksum_algorithm": null, "thresholds": { "cpu_percent": 75.0 } }"#;
        let config = EngineConfig::from_json_str(json).expect("Failed to parse config");
        assert_eq!(config.checksum_algorithm, None);
        assert_eq!(config.thresholds.cpu_percent, 75.0);
        assert_eq!(config.thresholds.memory_percent, 90.0);
    }

    #[test]
    fn test_from_json_file() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("config.json");
        fs::write(&path, r#"{"backup": {"checksum_algorithm": "blake3"}}"#)
            .expect("Failed to write config");
        let config = EngineConfig::from_json_file(&path).expect("Failed to load config");
        assert_eq!(config.checksum_algorithm, Some(ChecksumAlgorithm::Blake3));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.chunk_size = 0;
        assert!(matches!(config.validate(), Err(EngineError::InvalidConfig(_))));

        let mut config = EngineConfig::default();
        config.cache_cleanup_ratio = 1.5;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.thresholds.disk_percent = 0.0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.min_file_size = Some(10);
        config.max_file_size = Some(5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_run_options_override() {
        let config = EngineConfig::default();
        let effective = RunOptions {
            verify_after_copy: Some(false),
            auto_continue_on_error: Some(true),
            chunk_size: Some(512),
        }
        .resolve(&config);
        assert_eq!(effective.copy.verification, Verification::Off);
        assert_eq!(effective.copy.chunk_size, 512);
        assert!(effective.auto_continue_on_error);

        let defaults = RunOptions::default().resolve(&config);
        assert_eq!(
            defaults.copy.verification,
            Verification::Checksum(ChecksumAlgorithm::Sha256)
        );
    }
}
