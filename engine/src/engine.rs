//! The engine worker and the handle used to drive it.
//!
//! [`Engine::spawn`] starts one worker thread that owns the metadata cache
//! and the exclusion set. Callers talk to it only through channels: they send
//! [`Command`]s with an [`EngineHandle`] and read [`Event`]s back from it.
//! The worker executes at most one run at a time.

use crate::cache::MetadataCache;
use crate::config::{EngineConfig, RunOptions};
use crate::error::{EngineError, Result};
use crate::exclusion::ExclusionSet;
use crate::health::{ResourceSampler, SamplerFactory, SystemSampler};
use crate::job::{run_backup, RunEnvironment};
use crate::progress::{Command, Event};
use crate::report::{ReportGenerator, RunOutcome};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Entry point for starting engine workers.
pub struct Engine;

impl Engine {
    /// Start a worker that samples the real machine for health checks.
    pub fn spawn(config: EngineConfig) -> Result<EngineHandle> {
        let factory: SamplerFactory = Box::new(|target: &Path| -> Box<dyn ResourceSampler> {
            Box::new(SystemSampler::new(target))
        });
        Self::spawn_with_sampler(config, factory)
    }

    /// Start a worker whose runs get their resource readings from `sampler_for`.
    pub fn spawn_with_sampler(
        config: EngineConfig,
        sampler_for: SamplerFactory,
    ) -> Result<EngineHandle> {
        config.validate()?;
        let exclusions = ExclusionSet::from_patterns(config.exclude_patterns.as_slice())?
            .with_size_limits(config.min_file_size, config.max_file_size);

        let (command_tx, command_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();

        let worker = Worker {
            cache: MetadataCache::new(
                config.cache_capacity,
                config.cache_cleanup_ratio,
                config.cache_ttl(),
            ),
            config,
            exclusions,
            sampler_for,
            commands: command_rx,
            events: event_tx,
        };

        let handle = thread::Builder::new()
            .name("backup-engine".to_string())
            .spawn(move || worker.run())?;

        Ok(EngineHandle {
            commands: command_tx,
            events: event_rx,
            worker: Some(handle),
        })
    }
}

struct Worker {
    config: EngineConfig,
    cache: MetadataCache,
    exclusions: ExclusionSet,
    sampler_for: SamplerFactory,
    commands: Receiver<Command>,
    events: Sender<Event>,
}

impl Worker {
    fn run(mut self) {
        debug!("Engine worker started");
        while let Ok(command) = self.commands.recv() {
            match command {
                Command::StartBackup {
                    source,
                    destination,
                    exclusions,
                    options,
                } => {
                    if self.start(&source, &destination, exclusions, &options) {
                        break;
                    }
                }
                Command::UpdateExclusions(patterns) => self.replace_exclusions(&patterns),
                Command::Shutdown => break,
                other @ (Command::StopBackup | Command::Continue) => {
                    debug!(command = ?other, "No run in progress, ignored")
                }
            }
        }
        info!("Engine worker stopped");
    }

    /// Execute one run. Returns true when the worker should exit.
    fn start(
        &mut self,
        source: &Path,
        destination: &Path,
        exclusions: Option<Vec<String>>,
        options: &RunOptions,
    ) -> bool {
        if let Some(patterns) = exclusions {
            if let Err(e) = self.compile_exclusions(&patterns) {
                warn!(error = %e, "Run refused, invalid exclusions");
                let report = ReportGenerator::new(source, destination).finish(RunOutcome::Aborted {
                    reason: e.to_string(),
                });
                self.emit(Event::RunStopped(report));
                return false;
            }
        }

        let env = RunEnvironment {
            config: &self.config,
            exclusions: &mut self.exclusions,
            cache: &mut self.cache,
            commands: &self.commands,
            events: &self.events,
        };
        let result = run_backup(env, &*self.sampler_for, source, destination, options);

        let event = if result.report.is_completed() {
            Event::RunCompleted(result.report)
        } else {
            Event::RunStopped(result.report)
        };
        self.emit(event);
        result.shutdown
    }

    fn replace_exclusions(&mut self, patterns: &[String]) {
        match self.compile_exclusions(patterns) {
            Ok(()) => info!(patterns = patterns.len(), "Exclusions updated"),
            Err(e) => warn!(error = %e, "Exclusion update rejected"),
        }
    }

    fn compile_exclusions(&mut self, patterns: &[String]) -> Result<()> {
        self.exclusions = ExclusionSet::from_patterns(patterns)?
            .with_size_limits(self.config.min_file_size, self.config.max_file_size);
        Ok(())
    }

    fn emit(&self, event: Event) {
        if self.events.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }
}

/// Caller side of a running engine.
///
/// Dropping the handle shuts the worker down and waits for it.
pub struct EngineHandle {
    commands: Sender<Command>,
    events: Receiver<Event>,
    worker: Option<JoinHandle<()>>,
}

impl EngineHandle {
    /// Ask the worker to mirror `source` into `destination`.
    pub fn start(
        &self,
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        exclusions: Option<Vec<String>>,
        options: RunOptions,
    ) -> Result<()> {
        self.send(Command::StartBackup {
            source: source.into(),
            destination: destination.into(),
            exclusions,
            options,
        })
    }

    pub fn stop(&self) -> Result<()> {
        self.send(Command::StopBackup)
    }

    pub fn update_exclusions(&self, patterns: Vec<String>) -> Result<()> {
        self.send(Command::UpdateExclusions(patterns))
    }

    /// Answer an [`Event::AwaitingDecision`] by skipping the failed file.
    pub fn continue_run(&self) -> Result<()> {
        self.send(Command::Continue)
    }

    pub fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| EngineError::Disconnected)
    }

    pub fn events(&self) -> &Receiver<Event> {
        &self.events
    }

    /// Next event, or `None` after `timeout` or once the worker is gone.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Event> {
        match self.events.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Stop any active run and wait for the worker to exit.
    pub fn shutdown(mut self) -> Result<()> {
        self.join()
    }

    fn join(&mut self) -> Result<()> {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                return Err(EngineError::Disconnected);
            }
        }
        Ok(())
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        if let Err(e) = self.join() {
            warn!(error = %e, "Engine worker panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::health::{FixedSampler, ResourceSample};
    use crate::recovery::{plan_identity, CheckpointState, CHECKPOINT_FILE_NAME};
    use crate::report::Report;
    use std::fs;
    use tempfile::TempDir;

    const WAIT: Duration = Duration::from_secs(20);

    fn test_config() -> EngineConfig {
        EngineConfig {
            chunk_size: 4,
            check_free_space: false,
            ..EngineConfig::default()
        }
    }

    fn healthy() -> SamplerFactory {
        Box::new(|_: &Path| -> Box<dyn ResourceSampler> { Box::new(FixedSampler::healthy()) })
    }

    fn spawn(config: EngineConfig) -> EngineHandle {
        Engine::spawn_with_sampler(config, healthy()).expect("Failed to spawn engine")
    }

    fn write(root: &Path, relative: &str, content: &str) {
        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create dir");
        }
        fs::write(path, content).expect("Failed to write file");
    }

    fn dirs() -> (TempDir, PathBuf, PathBuf) {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        let dst = temp_dir.path().join("dst");
        fs::create_dir(&src).expect("Failed to create src");
        (temp_dir, src, dst)
    }

    /// Collect events until the run ends.
    fn finish(handle: &EngineHandle) -> (Vec<Event>, Report) {
        let mut seen = Vec::new();
        loop {
            match handle.recv_timeout(WAIT) {
                Some(Event::RunCompleted(report)) | Some(Event::RunStopped(report)) => {
                    return (seen, report)
                }
                Some(event) => seen.push(event),
                None => panic!("run did not finish, events: {:?}", seen),
            }
        }
    }

    fn run_once(handle: &EngineHandle, src: &Path, dst: &Path, options: RunOptions) -> Report {
        handle
            .start(src, dst, None, options)
            .expect("Failed to start");
        finish(handle).1
    }

    fn copied_paths(report: &Report) -> Vec<String> {
        report.copied.iter().map(|e| e.path.clone()).collect()
    }

    #[test]
    fn test_mirror_then_idempotent() {
        let (_temp, src, dst) = dirs();
        write(&src, "a.txt", "alpha");
        write(&src, "nested/b.txt", "bravo bravo");
        let handle = spawn(test_config());

        let first = run_once(&handle, &src, &dst, RunOptions::default());
        assert!(first.is_completed(), "{:?}", first.outcome);
        assert_eq!(copied_paths(&first), vec!["a.txt", "nested/b.txt"]);
        assert_eq!(first.bytes_transferred, 16);
        assert_eq!(fs::read_to_string(dst.join("nested/b.txt")).unwrap(), "bravo bravo");
        assert!(!dst.join(CHECKPOINT_FILE_NAME).exists());

        let second = run_once(&handle, &src, &dst, RunOptions::default());
        assert!(second.is_completed());
        assert!(second.copied.is_empty());
        assert!(second.updated.is_empty());
        assert!(second.deleted.is_empty());

        handle.shutdown().expect("Failed to shut down");
    }

    #[test]
    fn test_updates_and_deletes() {
        let (_temp, src, dst) = dirs();
        write(&src, "keep.txt", "new content");
        write(&dst, "keep.txt", "old");
        write(&dst, "gone/stale.txt", "stale");
        let handle = spawn(test_config());

        let report = run_once(&handle, &src, &dst, RunOptions::default());
        assert!(report.is_completed());
        assert_eq!(report.updated.len(), 1);
        assert_eq!(report.deleted.len(), 1);
        assert_eq!(report.deleted[0].path, "gone/stale.txt");
        assert_eq!(fs::read_to_string(dst.join("keep.txt")).unwrap(), "new content");
        assert!(!dst.join("gone").exists());
    }

    #[test]
    fn test_stopped_run_resumes_remaining_files() {
        let (_temp, src, dst) = dirs();
        for name in ["a.txt", "b.txt", "c.txt", "d.txt"] {
            write(&src, name, name);
        }
        // A directory in the way makes the commit of c.txt fail
        fs::create_dir_all(dst.join("c.txt")).expect("Failed to create obstacle");
        let handle = spawn(test_config());

        handle
            .start(&src, &dst, None, RunOptions::default())
            .expect("Failed to start");
        loop {
            match handle.recv_timeout(WAIT) {
                Some(Event::FileError(error)) => assert_eq!(error.path, "c.txt"),
                Some(Event::AwaitingDecision { path }) => {
                    assert_eq!(path, "c.txt");
                    handle.stop().expect("Failed to stop");
                    break;
                }
                Some(_) => {}
                None => panic!("no decision requested"),
            }
        }
        let (_, first) = finish(&handle);
        assert_eq!(first.outcome, RunOutcome::Stopped);
        assert_eq!(copied_paths(&first), vec!["a.txt", "b.txt"]);
        assert_eq!(first.errors.len(), 1);
        assert_eq!(first.errors[0].kind, ErrorKind::Copy);
        assert!(dst.join(CHECKPOINT_FILE_NAME).exists());

        fs::remove_dir(dst.join("c.txt")).expect("Failed to remove obstacle");
        let second = run_once(&handle, &src, &dst, RunOptions::default());
        assert!(second.is_completed());
        assert_eq!(copied_paths(&second), vec!["c.txt", "d.txt"]);
        assert!(!dst.join(CHECKPOINT_FILE_NAME).exists());
    }

    #[test]
    fn test_auto_continue_records_error_and_completes() {
        let (_temp, src, dst) = dirs();
        write(&src, "a.txt", "a");
        write(&src, "b.txt", "b");
        fs::create_dir_all(dst.join("a.txt")).expect("Failed to create obstacle");
        let handle = spawn(test_config());

        let options = RunOptions {
            auto_continue_on_error: Some(true),
            ..RunOptions::default()
        };
        handle.start(&src, &dst, None, options).expect("Failed to start");
        let (events, report) = finish(&handle);

        assert!(report.is_completed());
        assert!(report.has_errors());
        assert_eq!(copied_paths(&report), vec!["b.txt"]);
        assert!(!events
            .iter()
            .any(|e| matches!(e, Event::AwaitingDecision { .. })));
    }

    #[test]
    fn test_throttled_event_precedes_file_progress() {
        let (_temp, src, dst) = dirs();
        write(&src, "a.txt", "a");
        let config = EngineConfig {
            throttle_max_wait_secs: 0,
            ..test_config()
        };
        let busy_disk: SamplerFactory = Box::new(|_: &Path| -> Box<dyn ResourceSampler> {
            Box::new(FixedSampler {
                sample: ResourceSample {
                    cpu_percent: 10.0,
                    memory_percent: 10.0,
                    disk_percent: Some(95.0),
                },
                available: None,
            })
        });
        let handle = Engine::spawn_with_sampler(config, busy_disk).expect("Failed to spawn");

        handle
            .start(&src, &dst, None, RunOptions::default())
            .expect("Failed to start");
        let (events, report) = finish(&handle);

        let throttled = events
            .iter()
            .position(|e| matches!(e, Event::Throttled(reason) if reason.contains("disk")))
            .expect("no throttle event");
        let file_progress = events
            .iter()
            .position(|e| matches!(e, Event::Progress(p) if p.current_path.as_deref() == Some("a.txt")))
            .expect("no progress for a.txt");
        assert!(throttled < file_progress);
        assert_eq!(report.throttle_events, 1);
        // Throttling is advisory
        assert!(report.is_completed());
        assert_eq!(report.copied.len(), 1);
    }

    #[test]
    fn test_run_exclusions_replace_engine_patterns() {
        let (_temp, src, dst) = dirs();
        write(&src, "keep.txt", "k");
        write(&src, "skip.log", "s");
        write(&src, "logs/inner.txt", "i");
        let handle = spawn(test_config());

        handle
            .start(
                &src,
                &dst,
                Some(vec!["*.log".to_string(), "logs".to_string()]),
                RunOptions::default(),
            )
            .expect("Failed to start");
        let (_, report) = finish(&handle);

        assert_eq!(copied_paths(&report), vec!["keep.txt"]);
        assert!(!dst.join("skip.log").exists());
        assert!(!dst.join("logs").exists());
    }

    #[test]
    fn test_invalid_run_exclusions_abort() {
        let (_temp, src, dst) = dirs();
        let handle = spawn(test_config());
        handle
            .start(&src, &dst, Some(vec!["[broken".to_string()]), RunOptions::default())
            .expect("Failed to start");
        let (_, report) = finish(&handle);
        assert!(matches!(report.outcome, RunOutcome::Aborted { .. }));
    }

    #[test]
    fn test_stop_right_after_start() {
        let (_temp, src, dst) = dirs();
        for i in 0..20 {
            write(&src, &format!("file-{:02}.txt", i), "some content here");
        }
        let handle = spawn(test_config());

        handle
            .start(&src, &dst, None, RunOptions::default())
            .expect("Failed to start");
        handle.stop().expect("Failed to stop");
        let (_, report) = finish(&handle);

        // The stop is picked up before the first file or mid-copy
        assert_eq!(report.outcome, RunOutcome::Stopped);
        assert!(report.copied.len() < 20);
    }

    #[test]
    fn test_destination_inside_source_is_rejected() {
        let (_temp, src, _dst) = dirs();
        write(&src, "a.txt", "a");
        let handle = spawn(test_config());

        let report = run_once(&handle, &src, &src.join("backup"), RunOptions::default());
        assert!(matches!(report.outcome, RunOutcome::Aborted { .. }));
        assert!(!src.join("backup").exists());
    }

    #[test]
    fn test_insufficient_space_aborts_before_copying() {
        let (_temp, src, dst) = dirs();
        write(&src, "big.bin", "0123456789");
        let config = EngineConfig {
            check_free_space: true,
            ..test_config()
        };
        let tiny_disk: SamplerFactory = Box::new(|_: &Path| -> Box<dyn ResourceSampler> {
            Box::new(FixedSampler {
                available: Some(3),
                ..FixedSampler::healthy()
            })
        });
        let handle = Engine::spawn_with_sampler(config, tiny_disk).expect("Failed to spawn");

        let report = run_once(&handle, &src, &dst, RunOptions::default());
        assert!(matches!(report.outcome, RunOutcome::Aborted { .. }));
        assert!(report.errors.iter().any(|e| e.kind == ErrorKind::Resource));
        assert!(!dst.join("big.bin").exists());
    }

    #[test]
    fn test_report_written_to_report_dir() {
        let (temp, src, dst) = dirs();
        write(&src, "a.txt", "a");
        let reports = temp.path().join("reports");
        let config = EngineConfig {
            report_dir: Some(reports.clone()),
            ..test_config()
        };
        let handle = spawn(config);

        let report = run_once(&handle, &src, &dst, RunOptions::default());
        let path = reports.join(format!("report-{}.json", report.run_id));
        let saved: Report =
            serde_json::from_str(&fs::read_to_string(path).expect("report missing"))
                .expect("Failed to parse report");
        assert_eq!(saved.run_id, report.run_id);
    }

    #[test]
    fn test_state_dir_holds_checkpoint() {
        let (temp, src, dst) = dirs();
        write(&src, "a.txt", "a");
        write(&src, "b.txt", "b");
        fs::create_dir_all(dst.join("b.txt")).expect("Failed to create obstacle");
        let state_dir = temp.path().join("state");
        let config = EngineConfig {
            state_dir: Some(state_dir.clone()),
            ..test_config()
        };
        let handle = spawn(config);

        handle
            .start(&src, &dst, None, RunOptions::default())
            .expect("Failed to start");
        loop {
            match handle.recv_timeout(WAIT) {
                Some(Event::AwaitingDecision { .. }) => {
                    handle.stop().expect("Failed to stop");
                    break;
                }
                Some(_) => {}
                None => panic!("no decision requested"),
            }
        }
        let (_, report) = finish(&handle);
        assert_eq!(report.outcome, RunOutcome::Stopped);

        let checkpoints: Vec<_> = fs::read_dir(&state_dir)
            .expect("state dir missing")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(checkpoints.len(), 1);
        assert!(checkpoints[0].starts_with("checkpoint-"));
        assert!(!dst.join(CHECKPOINT_FILE_NAME).exists());
    }

    #[test]
    fn test_spawn_rejects_invalid_config() {
        let config = EngineConfig {
            chunk_size: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(
            Engine::spawn_with_sampler(config, healthy()),
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_commands_after_shutdown_fail() {
        let handle = spawn(test_config());
        let commands = handle.commands.clone();
        handle.shutdown().expect("Failed to shut down");
        assert!(commands.send(Command::StopBackup).is_err());
    }

    #[test]
    fn test_edit_within_cache_ttl_is_backed_up() {
        let (_temp, src, dst) = dirs();
        write(&src, "a.txt", "first");
        let handle = spawn(test_config());

        let first = run_once(&handle, &src, &dst, RunOptions::default());
        assert_eq!(copied_paths(&first), vec!["a.txt"]);

        std::thread::sleep(Duration::from_millis(50));
        write(&src, "a.txt", "second version, longer");
        let second = run_once(&handle, &src, &dst, RunOptions::default());

        assert!(second.is_completed());
        assert_eq!(second.updated.len(), 1);
        assert_eq!(second.updated[0].path, "a.txt");
        assert_eq!(
            fs::read_to_string(dst.join("a.txt")).unwrap(),
            "second version, longer"
        );
    }

    #[test]
    fn test_exclusion_update_while_awaiting_decision_drops_queued_entries() {
        let (_temp, src, dst) = dirs();
        write(&src, "a.txt", "a");
        write(&src, "b.log", "bb");
        write(&src, "c.txt", "ccc");
        fs::create_dir_all(dst.join("a.txt")).expect("Failed to create obstacle");
        let handle = spawn(test_config());

        handle
            .start(&src, &dst, None, RunOptions::default())
            .expect("Failed to start");
        loop {
            match handle.recv_timeout(WAIT) {
                Some(Event::AwaitingDecision { path }) => {
                    assert_eq!(path, "a.txt");
                    handle
                        .update_exclusions(vec!["*.log".to_string()])
                        .expect("Failed to update exclusions");
                    handle.continue_run().expect("Failed to continue");
                    break;
                }
                Some(_) => {}
                None => panic!("no decision requested"),
            }
        }
        let (events, report) = finish(&handle);

        assert!(report.is_completed());
        assert_eq!(copied_paths(&report), vec!["c.txt"]);
        assert!(!dst.join("b.log").exists());
        let last = events
            .iter()
            .rev()
            .find_map(|e| match e {
                Event::Progress(p) => Some(p.clone()),
                _ => None,
            })
            .expect("no progress");
        assert_eq!(last.total_files, 2);
        assert_eq!(last.files_done, 2);
        assert_eq!(last.total_bytes, 4);
    }

    #[test]
    fn test_exclusion_update_while_throttled_skips_waiting_entry() {
        let (_temp, src, dst) = dirs();
        write(&src, "a.txt", "a");
        write(&src, "b.txt", "b");
        let config = EngineConfig {
            throttle_max_wait_secs: 1,
            ..test_config()
        };
        let busy_disk: SamplerFactory = Box::new(|_: &Path| -> Box<dyn ResourceSampler> {
            Box::new(FixedSampler {
                sample: ResourceSample {
                    cpu_percent: 10.0,
                    memory_percent: 10.0,
                    disk_percent: Some(95.0),
                },
                available: None,
            })
        });
        let handle = Engine::spawn_with_sampler(config, busy_disk).expect("Failed to spawn");

        handle
            .start(&src, &dst, None, RunOptions::default())
            .expect("Failed to start");
        loop {
            match handle.recv_timeout(WAIT) {
                Some(Event::Throttled(_)) => {
                    handle
                        .update_exclusions(vec!["a.txt".to_string()])
                        .expect("Failed to update exclusions");
                    break;
                }
                Some(_) => {}
                None => panic!("no throttle event"),
            }
        }
        let (_, report) = finish(&handle);

        assert!(report.is_completed());
        assert_eq!(copied_paths(&report), vec!["b.txt"]);
        assert!(!dst.join("a.txt").exists());
    }

    #[test]
    fn test_corrupt_checkpoint_falls_back_to_full_run() {
        let (_temp, src, dst) = dirs();
        write(&src, "a.txt", "a");
        write(&src, "b.txt", "b");
        write(&dst, CHECKPOINT_FILE_NAME, "{not json");
        let handle = spawn(test_config());

        let report = run_once(&handle, &src, &dst, RunOptions::default());

        assert!(report.is_completed());
        assert!(!report.resumed);
        assert_eq!(copied_paths(&report), vec!["a.txt", "b.txt"]);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].kind, ErrorKind::Recovery);
        assert!(!dst.join(CHECKPOINT_FILE_NAME).exists());
    }

    #[test]
    fn test_matching_checkpoint_skips_processed_entries() {
        let (_temp, src, dst) = dirs();
        for name in ["a.txt", "b.txt", "c.txt"] {
            write(&src, name, name);
        }
        fs::create_dir_all(&dst).expect("Failed to create dst");
        let src_root = src.canonicalize().expect("Failed to resolve src");
        let dst_root = dst.canonicalize().expect("Failed to resolve dst");
        let checkpoint = CheckpointState {
            plan_id: plan_identity(&src_root, &dst_root),
            source_root: src_root,
            dest_root: dst_root,
            processed: ["b.txt".to_string()].into_iter().collect(),
            total: 3,
            updated_at: chrono::Utc::now(),
            pid: std::process::id(),
        };
        fs::write(
            dst.join(CHECKPOINT_FILE_NAME),
            serde_json::to_vec_pretty(&checkpoint).expect("Failed to encode checkpoint"),
        )
        .expect("Failed to write checkpoint");
        let handle = spawn(test_config());

        let report = run_once(&handle, &src, &dst, RunOptions::default());

        assert!(report.is_completed());
        assert!(report.resumed);
        assert_eq!(report.skipped_resumed, 1);
        assert_eq!(copied_paths(&report), vec!["a.txt", "c.txt"]);
        assert!(!dst.join("b.txt").exists());
        assert!(!dst.join(CHECKPOINT_FILE_NAME).exists());
    }
}
