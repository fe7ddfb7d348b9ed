//! Run reports.
//!
//! A [`ReportGenerator`] collects what happened during one run. Calling
//! [`ReportGenerator::finish`] freezes it into a [`Report`], which can be
//! written to disk as JSON.

use crate::error::{EngineError, FileError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use uuid::Uuid;

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every plan entry was attempted
    Completed,
    /// Stopped on request; a checkpoint was kept
    Stopped,
    /// Ended by a fatal error
    Aborted { reason: String },
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Completed => write!(f, "completed"),
            RunOutcome::Stopped => write!(f, "stopped"),
            RunOutcome::Aborted { reason } => write!(f, "aborted ({})", reason),
        }
    }
}

/// A transferred or deleted file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
}

/// Final, immutable account of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub run_id: Uuid,
    pub source_root: PathBuf,
    pub dest_root: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: RunOutcome,
    /// True when the run picked up a checkpoint
    pub resumed: bool,
    pub copied: Vec<FileEntry>,
    pub updated: Vec<FileEntry>,
    pub deleted: Vec<FileEntry>,
    pub errors: Vec<FileError>,
    /// Plan entries skipped because a checkpoint showed them committed
    pub skipped_resumed: usize,
    pub bytes_transferred: u64,
    /// Paths whose copy failed verification and was kept aside
    pub verification_flagged: Vec<String>,
    pub throttle_events: u64,
}

impl Report {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn is_completed(&self) -> bool {
        self.outcome == RunOutcome::Completed
    }

    /// One-line summary for logs and terminals.
    pub fn summary_line(&self) -> String {
        format!(
            "{}: {} copied, {} updated, {} deleted, {} errors, {} bytes in {:.1}s",
            self.outcome,
            self.copied.len(),
            self.updated.len(),
            self.deleted.len(),
            self.errors.len(),
            self.bytes_transferred,
            self.duration_ms as f64 / 1000.0
        )
    }

    /// Write the report as `report-<run-id>.json` in `dir`.
    pub fn write_json(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir).map_err(|e| EngineError::DirectoryCreationFailed {
            path: dir.to_path_buf(),
            source: e,
        })?;
        let path = dir.join(format!("report-{}.json", self.run_id));
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json).map_err(|e| EngineError::WriteError {
            path: path.clone(),
            source: e,
        })?;
        Ok(path)
    }
}

/// Accumulates the events of a run.
#[derive(Debug)]
pub struct ReportGenerator {
    run_id: Uuid,
    source_root: PathBuf,
    dest_root: PathBuf,
    started_at: DateTime<Utc>,
    started: Instant,
    resumed: bool,
    copied: Vec<FileEntry>,
    updated: Vec<FileEntry>,
    deleted: Vec<FileEntry>,
    errors: Vec<FileError>,
    skipped_resumed: usize,
    bytes_transferred: u64,
    verification_flagged: Vec<String>,
    throttle_events: u64,
}

impl ReportGenerator {
    pub fn new(source_root: &Path, dest_root: &Path) -> Self {
        ReportGenerator {
            run_id: Uuid::new_v4(),
            source_root: source_root.to_path_buf(),
            dest_root: dest_root.to_path_buf(),
            started_at: Utc::now(),
            started: Instant::now(),
            resumed: false,
            copied: Vec::new(),
            updated: Vec::new(),
            deleted: Vec::new(),
            errors: Vec::new(),
            skipped_resumed: 0,
            bytes_transferred: 0,
            verification_flagged: Vec::new(),
            throttle_events: 0,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn record_copied(&mut self, path: &str, size: u64) {
        self.bytes_transferred += size;
        self.copied.push(FileEntry {
            path: path.to_string(),
            size,
        });
    }

    pub fn record_updated(&mut self, path: &str, size: u64) {
        self.bytes_transferred += size;
        self.updated.push(FileEntry {
            path: path.to_string(),
            size,
        });
    }

    pub fn record_deleted(&mut self, path: &str, size: u64) {
        self.deleted.push(FileEntry {
            path: path.to_string(),
            size,
        });
    }

    pub fn record_error(&mut self, error: FileError) {
        self.errors.push(error);
    }

    pub fn record_errors(&mut self, errors: &[FileError]) {
        self.errors.extend_from_slice(errors);
    }

    pub fn record_flagged(&mut self, path: &str) {
        self.verification_flagged.push(path.to_string());
    }

    pub fn record_throttled(&mut self) {
        self.throttle_events += 1;
    }

    pub fn record_resumed(&mut self, skipped: usize) {
        self.resumed = true;
        self.skipped_resumed = skipped;
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    pub fn finish(self, outcome: RunOutcome) -> Report {
        Report {
            run_id: self.run_id,
            source_root: self.source_root,
            dest_root: self.dest_root,
            started_at: self.started_at,
            finished_at: Utc::now(),
            duration_ms: self.started.elapsed().as_millis() as u64,
            outcome,
            resumed: self.resumed,
            copied: self.copied,
            updated: self.updated,
            deleted: self.deleted,
            errors: self.errors,
            skipped_resumed: self.skipped_resumed,
            bytes_transferred: self.bytes_transferred,
            verification_flagged: self.verification_flagged,
            throttle_events: self.throttle_events,
        }
    }
}
