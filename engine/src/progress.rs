//! Messages exchanged with the engine, and progress statistics.
//!
//! The caller sends [`Command`]s to the worker and receives [`Event`]s back.
//! Neither side shares mutable state with the other; a [`Progress`] event is
//! a snapshot produced by the worker's [`ProgressTracker`].

use crate::config::RunOptions;
use crate::error::FileError;
use crate::report::Report;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Requests from the caller to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Mirror `source` into `destination`. `exclusions`, when given,
    /// replaces the engine's current patterns for this and later runs.
    StartBackup {
        source: PathBuf,
        destination: PathBuf,
        exclusions: Option<Vec<String>>,
        options: RunOptions,
    },
    /// Stop the current run after the current chunk
    StopBackup,
    /// Replace the exclusion patterns, also for the run in progress
    UpdateExclusions(Vec<String>),
    /// Resume after an [`Event::AwaitingDecision`]
    Continue,
    /// End the worker thread
    Shutdown,
}

/// Notifications from the engine to the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Progress(Progress),
    /// Transfers are paused because a resource threshold is exceeded
    Throttled(String),
    FileError(FileError),
    /// The run is paused on the error just reported and waits for
    /// [`Command::Continue`] or [`Command::StopBackup`]
    AwaitingDecision { path: String },
    RunCompleted(Report),
    /// The run was stopped or aborted; the report outcome tells which
    RunStopped(Report),
}

/// Progress snapshot of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub files_done: usize,
    pub total_files: usize,
    pub bytes_done: u64,
    pub total_bytes: u64,
    pub current_path: Option<String>,
    /// Smoothed transfer rate
    pub bytes_per_sec: f64,
    /// Smoothed estimate of the remaining time, once a rate is known
    pub eta_secs: Option<f64>,
}

impl Progress {
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            if self.total_files == 0 {
                100.0
            } else {
                self.files_done as f64 / self.total_files as f64 * 100.0
            }
        } else {
            self.bytes_done as f64 / self.total_bytes as f64 * 100.0
        }
    }
}

const SPEED_WINDOW: usize = 20;
const SPEED_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
const ETA_SMOOTHING: f64 = 0.2;
const MID_FILE_EMIT_INTERVAL: Duration = Duration::from_millis(200);

/// Counts files and bytes of a run and derives speed and ETA.
///
/// Speed is a recency-weighted average of per-interval rates over the last
/// few samples; the ETA is exponentially smoothed so it does not jump with
/// every small file.
#[derive(Debug)]
pub struct ProgressTracker {
    total_files: usize,
    total_bytes: u64,
    files_done: usize,
    completed_bytes: u64,
    bytes_done: u64,
    current_path: Option<String>,
    samples: VecDeque<(Instant, f64)>,
    last_sample_at: Instant,
    last_sample_bytes: u64,
    bytes_per_sec: f64,
    eta_secs: Option<f64>,
    last_emit: Option<Instant>,
}

impl ProgressTracker {
    pub fn new(total_files: usize, total_bytes: u64) -> Self {
        ProgressTracker {
            total_files,
            total_bytes,
            files_done: 0,
            completed_bytes: 0,
            bytes_done: 0,
            current_path: None,
            samples: VecDeque::with_capacity(SPEED_WINDOW),
            last_sample_at: Instant::now(),
            last_sample_bytes: 0,
            bytes_per_sec: 0.0,
            eta_secs: None,
            last_emit: None,
        }
    }

    pub fn start_file(&mut self, path: &str) {
        self.current_path = Some(path.to_string());
        self.bytes_done = self.completed_bytes;
    }

    /// Bytes written so far for the current file.
    pub fn file_progress(&mut self, bytes_in_file: u64) {
        self.bytes_done = self.completed_bytes + bytes_in_file;
        self.update_at(Instant::now());
    }

    /// The current file is done, whatever its outcome. `planned_bytes` is
    /// the size it was counted with in the totals.
    pub fn finish_file(&mut self, planned_bytes: u64) {
        self.files_done += 1;
        self.completed_bytes += planned_bytes;
        self.bytes_done = self.completed_bytes;
        self.current_path = None;
        self.update_at(Instant::now());
    }

    /// Shrink the totals after entries were dropped from the plan.
    pub fn remove_planned(&mut self, files: usize, bytes: u64) {
        self.total_files = self.total_files.saturating_sub(files);
        self.total_bytes = self.total_bytes.saturating_sub(bytes);
    }

    /// True at most once per emit interval; used for mid-file updates.
    pub fn should_emit(&mut self) -> bool {
        let now = Instant::now();
        match self.last_emit {
            Some(last) if now.duration_since(last) < MID_FILE_EMIT_INTERVAL => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }

    pub fn snapshot(&self) -> Progress {
        Progress {
            files_done: self.files_done,
            total_files: self.total_files,
            bytes_done: self.bytes_done,
            total_bytes: self.total_bytes,
            current_path: self.current_path.clone(),
            bytes_per_sec: self.bytes_per_sec,
            eta_secs: self.eta_secs,
        }
    }

    fn update_at(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_sample_at);
        if elapsed < SPEED_SAMPLE_INTERVAL || elapsed.is_zero() {
            return;
        }

        let delta = self.bytes_done.saturating_sub(self.last_sample_bytes);
        let rate = delta as f64 / elapsed.as_secs_f64();
        self.samples.push_back((now, rate));
        while self.samples.len() > SPEED_WINDOW {
            self.samples.pop_front();
        }

        let mut weighted = 0.0;
        let mut total_weight = 0.0;
        for (at, sample_rate) in &self.samples {
            let age = now.saturating_duration_since(*at).as_secs_f64();
            let weight = 1.0 / (age + 1.0);
            weighted += sample_rate * weight;
            total_weight += weight;
        }
        self.bytes_per_sec = if total_weight > 0.0 {
            weighted / total_weight
        } else {
            0.0
        };

        if self.bytes_per_sec > 0.0 {
            let remaining = self.total_bytes.saturating_sub(self.bytes_done) as f64;
            let fresh = remaining / self.bytes_per_sec;
            self.eta_secs = Some(match self.eta_secs {
                Some(previous) if previous > 0.0 => {
                    previous * (1.0 - ETA_SMOOTHING) + fresh * ETA_SMOOTHING
                }
                _ => fresh,
            });
        }

        self.last_sample_at = now;
        self.last_sample_bytes = self.bytes_done;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_files_and_bytes() {
        let mut tracker = ProgressTracker::new(2, 300);
        tracker.start_file("a");
        tracker.file_progress(50);
        let mid = tracker.snapshot();
        assert_eq!(mid.bytes_done, 50);
        assert_eq!(mid.current_path.as_deref(), Some("a"));

        tracker.finish_file(100);
        tracker.start_file("b");
        tracker.finish_file(200);
        let done = tracker.snapshot();
        assert_eq!(done.files_done, 2);
        assert_eq!(done.bytes_done, 300);
        assert_eq!(done.percent(), 100.0);
        assert_eq!(done.current_path, None);
    }

    #[test]
    fn test_speed_and_eta_from_samples() {
        let mut tracker = ProgressTracker::new(1, 10_000);
        let start = tracker.last_sample_at;

        tracker.bytes_done = 1_000;
        tracker.update_at(start + Duration::from_secs(1));
        assert!((tracker.bytes_per_sec - 1_000.0).abs() < 1e-6);
        let first_eta = tracker.eta_secs.expect("eta");
        assert!((first_eta - 9.0).abs() < 1e-6);

        // Rate doubles; the ETA moves only part of the way
        tracker.bytes_done = 3_000;
        tracker.update_at(start + Duration::from_secs(2));
        assert!(tracker.bytes_per_sec > 1_000.0 && tracker.bytes_per_sec < 2_000.0);
        let second_eta = tracker.eta_secs.expect("eta");
        assert!(second_eta < first_eta);
    }

    #[test]
    fn test_samples_inside_interval_are_ignored() {
        let mut tracker = ProgressTracker::new(1, 100);
        let start = tracker.last_sample_at;
        tracker.bytes_done = 50;
        tracker.update_at(start + Duration::from_millis(10));
        assert_eq!(tracker.bytes_per_sec, 0.0);
        assert_eq!(tracker.eta_secs, None);
    }

    #[test]
    fn test_remove_planned_shrinks_totals() {
        let mut tracker = ProgressTracker::new(5, 500);
        tracker.remove_planned(2, 150);
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.total_files, 3);
        assert_eq!(snapshot.total_bytes, 350);
    }

    #[test]
    fn test_should_emit_is_rate_limited() {
        let mut tracker = ProgressTracker::new(1, 1);
        assert!(tracker.should_emit());
        assert!(!tracker.should_emit());
    }

    #[test]
    fn test_empty_run_is_complete() {
        let tracker = ProgressTracker::new(0, 0);
        assert_eq!(tracker.snapshot().percent(), 100.0);
    }
}
