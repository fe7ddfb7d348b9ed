//! Crash recovery.
//!
//! The [`RecoveryManager`] keeps a durable record of which plan entries a run
//! has committed. The checkpoint is rewritten in full (temporary file plus
//! rename) after every committed file, periodically while a long file is in
//! flight, and when a run stops or aborts. A completed run deletes it.
//!
//! On the next start the checkpoint is only trusted when it was written for
//! the same source/destination pair and its processed set is a subset of the
//! live plan. Anything else is discarded: commits are atomic, so the fresh
//! diff already reflects every file that made it across.

use crate::diff::Plan;
use crate::error::{EngineError, ErrorKind, FileError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use sysinfo::{Pid, System};
use tracing::{debug, info, warn};

/// File name of the checkpoint.
pub const CHECKPOINT_FILE_NAME: &str = ".mirror-checkpoint.json";

/// Name the checkpoint is written under before being renamed into place.
pub const CHECKPOINT_TEMP_NAME: &str = ".mirror-checkpoint.json.tmp";

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    /// Running, having picked up a checkpoint
    Resuming,
    Completed,
    Stopped,
    Aborted,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Stopped | RunState::Aborted
        )
    }

    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (Idle, Running) | (Idle, Resuming) | (Idle, Aborted) => true,
            (Running, Completed) | (Running, Stopped) | (Running, Aborted) => true,
            (Running, Resuming) => true,
            (Resuming, Completed) | (Resuming, Stopped) | (Resuming, Aborted) => true,
            (from, Idle) => from.is_terminal(),
            _ => false,
        }
    }

    /// Move to `next`, or fail if the state machine forbids it.
    pub fn transition(self, next: RunState) -> Result<RunState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(EngineError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::Resuming => "resuming",
            RunState::Completed => "completed",
            RunState::Stopped => "stopped",
            RunState::Aborted => "aborted",
        };
        write!(f, "{}", name)
    }
}

/// What is persisted in the checkpoint file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointState {
    /// Identity of the source/destination pair, see [`plan_identity`]
    pub plan_id: String,
    pub source_root: PathBuf,
    pub dest_root: PathBuf,
    /// Relative paths committed so far
    pub processed: BTreeSet<String>,
    /// Entries in the plan this checkpoint belongs to
    pub total: usize,
    pub updated_at: DateTime<Utc>,
    /// Process that wrote the checkpoint
    pub pid: u32,
}

/// Identity of a plan: stable for the same source and destination roots.
pub fn plan_identity(source: &Path, dest: &Path) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(source.to_string_lossy().as_bytes());
    hasher.update(&[0]);
    hasher.update(dest.to_string_lossy().as_bytes());
    hasher.finalize().to_hex().as_str()[..32].to_string()
}

/// Result of reconciling a loaded checkpoint with the live plan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Paths to skip because they were committed before the interruption
    pub skip: BTreeSet<String>,
    /// True when the checkpoint was honoured
    pub resumed: bool,
}

/// Owner of the checkpoint file for one run.
#[derive(Debug)]
pub struct RecoveryManager {
    path: PathBuf,
    temp_path: PathBuf,
    interval: Duration,
    state: Option<CheckpointState>,
    last_write: Instant,
    writes: u64,
}

impl RecoveryManager {
    /// A manager writing `.mirror-checkpoint.json` into `dir`.
    pub fn new(dir: &Path, interval: Duration) -> Self {
        Self::at(dir.join(CHECKPOINT_FILE_NAME), interval)
    }

    /// A manager writing its checkpoint to `path`.
    pub fn at(path: PathBuf, interval: Duration) -> Self {
        let mut temp_name = path.file_name().unwrap_or_default().to_os_string();
        temp_name.push(".tmp");
        RecoveryManager {
            temp_path: path.with_file_name(temp_name),
            path,
            interval,
            state: None,
            last_write: Instant::now(),
            writes: 0,
        }
    }

    /// Where the checkpoint of `plan_id` lives: in the destination root,
    /// or under a per-plan name when a shared state directory is configured.
    pub fn location(state_dir: Option<&Path>, dest_root: &Path, plan_id: &str) -> PathBuf {
        match state_dir {
            Some(dir) => dir.join(format!("checkpoint-{}.json", plan_id)),
            None => dest_root.join(CHECKPOINT_FILE_NAME),
        }
    }

    pub fn checkpoint_path(&self) -> &Path {
        &self.path
    }

    /// Read the checkpoint for `plan_id`.
    ///
    /// `Ok(None)` when there is no checkpoint. A checkpoint that cannot be
    /// read, does not parse, belongs to another plan or is held by another
    /// live process is returned as a recovery error and must be ignored.
    pub fn load(&self, plan_id: &str) -> std::result::Result<Option<CheckpointState>, FileError> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(FileError::from_io(&self.path, ErrorKind::Recovery, &e)),
        };

        let state: CheckpointState = serde_json::from_slice(&data).map_err(|e| {
            FileError::new(
                self.path.to_string_lossy(),
                ErrorKind::Recovery,
                format!("corrupt checkpoint: {}", e),
            )
        })?;

        if state.plan_id != plan_id {
            return Err(FileError::new(
                self.path.to_string_lossy(),
                ErrorKind::Recovery,
                format!(
                    "checkpoint belongs to another plan ({} -> {})",
                    state.source_root.display(),
                    state.dest_root.display()
                ),
            ));
        }

        if state.pid != std::process::id() && process_is_alive(state.pid) {
            return Err(FileError::new(
                self.path.to_string_lossy(),
                ErrorKind::Recovery,
                format!("checkpoint is held by running process {}", state.pid),
            ));
        }

        debug!(
            path = %self.path.display(),
            processed = state.processed.len(),
            total = state.total,
            "Loaded checkpoint"
        );
        Ok(Some(state))
    }

    /// Decide what a loaded checkpoint means for the live plan and start
    /// tracking the new run.
    pub fn reconcile(
        &mut self,
        checkpoint: Option<CheckpointState>,
        plan: &Plan,
        plan_id: &str,
        source_root: &Path,
        dest_root: &Path,
    ) -> Reconciliation {
        let live_paths = plan.paths();

        let reconciliation = match checkpoint {
            Some(previous)
                if !previous.processed.is_empty() && previous.processed.is_subset(&live_paths) =>
            {
                info!(
                    skipped = previous.processed.len(),
                    "Resuming from checkpoint"
                );
                Reconciliation {
                    skip: previous.processed,
                    resumed: true,
                }
            }
            Some(previous) if previous.processed.is_empty() => Reconciliation::default(),
            Some(previous) => {
                warn!(
                    processed = previous.processed.len(),
                    "Checkpoint does not match the current plan, discarded"
                );
                Reconciliation::default()
            }
            None => Reconciliation::default(),
        };

        self.state = Some(CheckpointState {
            plan_id: plan_id.to_string(),
            source_root: source_root.to_path_buf(),
            dest_root: dest_root.to_path_buf(),
            processed: reconciliation.skip.clone(),
            total: plan.len(),
            updated_at: Utc::now(),
            pid: std::process::id(),
        });

        reconciliation
    }

    /// Mark `path` committed and persist the checkpoint.
    pub fn record_processed(&mut self, path: &str) -> Result<()> {
        if let Some(state) = self.state.as_mut() {
            state.processed.insert(path.to_string());
        }
        self.checkpoint()
    }

    /// Checkpoint writes performed so far.
    pub fn writes(&self) -> u64 {
        self.writes
    }

    pub fn processed_count(&self) -> usize {
        self.state.as_ref().map_or(0, |s| s.processed.len())
    }

    /// Persist the checkpoint if the interval has elapsed since the last
    /// write. Returns whether a write happened.
    pub fn maybe_checkpoint(&mut self) -> Result<bool> {
        if self.state.is_none() || self.last_write.elapsed() < self.interval {
            return Ok(false);
        }
        self.checkpoint()?;
        Ok(true)
    }

    /// Overwrite the checkpoint file with the current state.
    pub fn checkpoint(&mut self) -> Result<()> {
        let state = match self.state.as_mut() {
            Some(state) => state,
            None => return Ok(()),
        };
        state.updated_at = Utc::now();
        let json = serde_json::to_vec_pretty(state)?;

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| self.checkpoint_error(&e))?;
        }

        let mut file = File::create(&self.temp_path).map_err(|e| self.checkpoint_error(&e))?;
        file.write_all(&json)
            .and_then(|_| file.sync_all())
            .map_err(|e| self.checkpoint_error(&e))?;
        drop(file);
        fs::rename(&self.temp_path, &self.path).map_err(|e| self.checkpoint_error(&e))?;

        self.last_write = Instant::now();
        self.writes += 1;
        Ok(())
    }

    /// Delete the checkpoint after a completed run.
    pub fn clear(&mut self) -> Result<()> {
        for path in [&self.path, &self.temp_path] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(self.checkpoint_error(&e)),
            }
        }
        self.state = None;
        debug!(path = %self.path.display(), "Checkpoint cleared");
        Ok(())
    }

    fn checkpoint_error(&self, e: &io::Error) -> EngineError {
        EngineError::Checkpoint {
            path: self.path.clone(),
            reason: e.to_string(),
        }
    }
}

fn process_is_alive(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_process(Pid::from_u32(pid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FileRecord, MetadataIndex};

    fn plan_of(paths: &[&str]) -> Plan {
        let records = paths
            .iter()
            .map(|p| FileRecord::new(*p, 1, 1))
            .collect::<Vec<_>>();
        crate::diff::diff(
            &MetadataIndex::from_records("/s", records),
            &MetadataIndex::from_records("/d", vec![]),
        )
    }

    fn set_of(paths: &[&str]) -> BTreeSet<String> {
        paths.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_state_transitions() {
        assert_eq!(RunState::Idle.transition(RunState::Running).ok(), Some(RunState::Running));
        assert!(RunState::Running.can_transition_to(RunState::Stopped));
        assert!(RunState::Resuming.can_transition_to(RunState::Completed));
        assert!(RunState::Completed.can_transition_to(RunState::Idle));
        assert!(RunState::Idle.transition(RunState::Completed).is_err());
        assert!(RunState::Stopped.transition(RunState::Running).is_err());
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let plan = plan_of(&["a", "b", "c"]);
        let id = plan_identity(Path::new("/s"), Path::new("/d"));

        let mut manager = RecoveryManager::new(temp_dir.path(), Duration::from_secs(30));
        manager.reconcile(None, &plan, &id, Path::new("/s"), Path::new("/d"));
        manager.record_processed("a").expect("Failed to record");
        manager.record_processed("b").expect("Failed to record");

        let loaded = RecoveryManager::new(temp_dir.path(), Duration::from_secs(30))
            .load(&id)
            .expect("Failed to load")
            .expect("checkpoint missing");
        assert_eq!(loaded.processed, set_of(&["a", "b"]));
        assert_eq!(loaded.total, 3);
        assert_eq!(loaded.pid, std::process::id());
        assert!(!temp_dir.path().join(CHECKPOINT_TEMP_NAME).exists());
    }

    #[test]
    fn test_missing_checkpoint_is_none() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let manager = RecoveryManager::new(temp_dir.path(), Duration::from_secs(30));
        assert_eq!(manager.load("any"), Ok(None));
    }

    #[test]
    fn test_corrupt_checkpoint_is_recovery_error() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        fs::write(temp_dir.path().join(CHECKPOINT_FILE_NAME), b"{ not json")
            .expect("Failed to write");
        let manager = RecoveryManager::new(temp_dir.path(), Duration::from_secs(30));
        let err = manager.load("any").expect_err("corrupt checkpoint accepted");
        assert_eq!(err.kind, ErrorKind::Recovery);
    }

    #[test]
    fn test_checkpoint_for_other_plan_is_rejected() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let plan = plan_of(&["a"]);
        let mut manager = RecoveryManager::new(temp_dir.path(), Duration::from_secs(30));
        manager.reconcile(None, &plan, "plan-one", Path::new("/s"), Path::new("/d"));
        manager.checkpoint().expect("Failed to write");

        assert!(manager.load("plan-two").is_err());
        assert!(manager.load("plan-one").expect("load").is_some());
    }

    #[test]
    fn test_reconcile_honours_subset() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let plan = plan_of(&["a", "b", "c"]);
        let previous = CheckpointState {
            plan_id: "p".to_string(),
            source_root: PathBuf::from("/s"),
            dest_root: PathBuf::from("/d"),
            processed: set_of(&["a"]),
            total: 3,
            updated_at: Utc::now(),
            pid: std::process::id(),
        };

        let mut manager = RecoveryManager::new(temp_dir.path(), Duration::from_secs(30));
        let result = manager.reconcile(Some(previous), &plan, "p", Path::new("/s"), Path::new("/d"));
        assert!(result.resumed);
        assert_eq!(result.skip, set_of(&["a"]));
        assert_eq!(manager.processed_count(), 1);
    }

    #[test]
    fn test_reconcile_discards_non_subset() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let plan = plan_of(&["b", "c"]);
        let previous = CheckpointState {
            plan_id: "p".to_string(),
            source_root: PathBuf::from("/s"),
            dest_root: PathBuf::from("/d"),
            processed: set_of(&["a", "b"]),
            total: 3,
            updated_at: Utc::now(),
            pid: std::process::id(),
        };

        let mut manager = RecoveryManager::new(temp_dir.path(), Duration::from_secs(30));
        let result = manager.reconcile(Some(previous), &plan, "p", Path::new("/s"), Path::new("/d"));
        assert!(!result.resumed);
        assert!(result.skip.is_empty());
        assert_eq!(manager.processed_count(), 0);
    }

    #[test]
    fn test_maybe_checkpoint_respects_interval() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let plan = plan_of(&["a"]);
        let mut manager = RecoveryManager::new(temp_dir.path(), Duration::from_secs(3600));
        manager.reconcile(None, &plan, "p", Path::new("/s"), Path::new("/d"));
        assert!(!manager.maybe_checkpoint().expect("maybe_checkpoint"));

        let mut eager = RecoveryManager::new(temp_dir.path(), Duration::ZERO);
        eager.reconcile(None, &plan, "p", Path::new("/s"), Path::new("/d"));
        assert!(eager.maybe_checkpoint().expect("maybe_checkpoint"));
        assert!(temp_dir.path().join(CHECKPOINT_FILE_NAME).exists());
    }

    #[test]
    fn test_clear_removes_checkpoint() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let plan = plan_of(&["a"]);
        let mut manager = RecoveryManager::new(temp_dir.path(), Duration::from_secs(30));
        manager.reconcile(None, &plan, "p", Path::new("/s"), Path::new("/d"));
        manager.checkpoint().expect("Failed to write");
        manager.clear().expect("Failed to clear");
        assert!(!manager.checkpoint_path().exists());
    }

    #[test]
    fn test_location() {
        let dest = Path::new("/mirror");
        assert_eq!(
            RecoveryManager::location(None, dest, "abc"),
            dest.join(CHECKPOINT_FILE_NAME)
        );
        assert_eq!(
            RecoveryManager::location(Some(Path::new("/state")), dest, "abc"),
            Path::new("/state").join("checkpoint-abc.json")
        );
        let manager = RecoveryManager::new(dest, Duration::from_secs(1));
        assert_eq!(manager.temp_path, dest.join(CHECKPOINT_TEMP_NAME));
    }

    #[test]
    fn test_plan_identity_depends_on_both_roots() {
        let a = plan_identity(Path::new("/s"), Path::new("/d"));
        assert_eq!(a, plan_identity(Path::new("/s"), Path::new("/d")));
        assert_ne!(a, plan_identity(Path::new("/s"), Path::new("/e")));
        assert_ne!(a, plan_identity(Path::new("/t"), Path::new("/d")));
    }
}
