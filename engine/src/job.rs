//! Backup run orchestration.
//!
//! One run goes through these steps:
//! - Validate the source and destination roots
//! - Index both trees and diff them into a plan
//! - Sweep leftovers of an interrupted run and reconcile its checkpoint
//! - Check free space, then work through the plan one entry at a time,
//!   backing off while the machine is over its resource thresholds
//! - Finish with a report, clearing or keeping the checkpoint
//!
//! Per-file failures are recorded and never unwind the run. Only resource
//! errors (destination gone, not enough space) end it early.

use crate::cache::MetadataCache;
use crate::config::{EngineConfig, RunOptions};
use crate::diff::{diff, Plan, PlanAction, PlanEntry};
use crate::error::{EngineError, ErrorKind, FileError, Result};
use crate::exclusion::ExclusionSet;
use crate::fs_ops::{self, CopyOptions, CopyOutcome};
use crate::health::{HealthMonitor, ResourceSampler};
use crate::model::FileRecord;
use crate::progress::{Command, Event, ProgressTracker};
use crate::recovery::{plan_identity, RecoveryManager, RunState};
use crate::report::{Report, ReportGenerator, RunOutcome};
use crate::scan::scan_tree;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::collections::VecDeque;
use std::fs;
use std::io;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// What the run loop should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Proceed,
    Stop,
    /// Stop, and end the worker afterwards
    Shutdown,
}

/// Result of processing one plan entry.
enum EntryResult {
    Done,
    Failed(FileError),
    Interrupted(Flow),
}

/// Engine state a run borrows from the worker.
pub(crate) struct RunEnvironment<'a> {
    pub config: &'a EngineConfig,
    pub exclusions: &'a mut ExclusionSet,
    pub cache: &'a mut MetadataCache,
    pub commands: &'a Receiver<Command>,
    pub events: &'a Sender<Event>,
}

pub(crate) struct RunResult {
    pub report: Report,
    /// A shutdown was requested while the run was active
    pub shutdown: bool,
}

/// Execute one backup run of `source` into `destination`.
pub(crate) fn run_backup(
    env: RunEnvironment<'_>,
    sampler_for: &dyn Fn(&Path) -> Box<dyn ResourceSampler>,
    source: &Path,
    destination: &Path,
    options: &RunOptions,
) -> RunResult {
    let mut run = Run {
        config: env.config,
        exclusions: env.exclusions,
        cache: env.cache,
        commands: env.commands,
        events: env.events,
        generator: ReportGenerator::new(source, destination),
        state: RunState::Idle,
        queue: VecDeque::new(),
        tracker: ProgressTracker::new(0, 0),
        shutdown: false,
    };

    let outcome = run.execute(sampler_for, source, destination, options);
    let shutdown = run.shutdown;
    let report = run.generator.finish(outcome);
    info!(run_id = %report.run_id, "{}", report.summary_line());

    if let Some(dir) = &env.config.report_dir {
        match report.write_json(dir) {
            Ok(path) => info!(path = %path.display(), "Report written"),
            Err(e) => warn!(error = %e, "Could not write report"),
        }
    }

    RunResult { report, shutdown }
}

struct Run<'a> {
    config: &'a EngineConfig,
    exclusions: &'a mut ExclusionSet,
    cache: &'a mut MetadataCache,
    commands: &'a Receiver<Command>,
    events: &'a Sender<Event>,
    generator: ReportGenerator,
    state: RunState,
    /// Plan entries not yet processed, in processing order
    queue: VecDeque<PlanEntry>,
    tracker: ProgressTracker,
    shutdown: bool,
}

impl<'a> Run<'a> {
    fn execute(
        &mut self,
        sampler_for: &dyn Fn(&Path) -> Box<dyn ResourceSampler>,
        source: &Path,
        destination: &Path,
        options: &RunOptions,
    ) -> RunOutcome {
        let (source_root, dest_root) = match validate_paths(source, destination) {
            Ok(roots) => roots,
            Err(e) => return self.abort(None, e),
        };
        let effective = options.resolve(self.config);
        self.set_state(RunState::Running);
        info!(
            source = %source_root.display(),
            destination = %dest_root.display(),
            "Backup run started"
        );

        let source_index = scan_tree(&source_root, self.exclusions, self.cache);
        let dest_index = scan_tree(&dest_root, self.exclusions, self.cache);
        for scan_error in source_index.errors().iter().chain(dest_index.errors()) {
            self.generator.record_error(scan_error.clone());
            emit(self.events, Event::FileError(scan_error.clone()));
        }
        if source_index.symlinks_skipped() > 0 {
            info!(count = source_index.symlinks_skipped(), "Symbolic links skipped");
        }
        fs_ops::sweep_partials(dest_index.stale_partials());

        let mut plan = diff(&source_index, &dest_index);

        let plan_id = plan_identity(&source_root, &dest_root);
        let mut recovery = RecoveryManager::at(
            RecoveryManager::location(self.config.state_dir.as_deref(), &dest_root, &plan_id),
            self.config.checkpoint_interval(),
        );
        let previous = match recovery.load(&plan_id) {
            Ok(previous) => previous,
            Err(recovery_error) => {
                warn!(error = %recovery_error, "Ignoring unusable checkpoint");
                self.generator.record_error(recovery_error.clone());
                emit(self.events, Event::FileError(recovery_error));
                None
            }
        };
        let reconciliation =
            recovery.reconcile(previous, &plan, &plan_id, &source_root, &dest_root);
        if reconciliation.resumed {
            plan = plan.without(&reconciliation.skip);
            self.generator.record_resumed(reconciliation.skip.len());
            self.set_state(RunState::Resuming);
        }

        let summary = plan.summary();
        info!(
            copies = summary.copies,
            updates = summary.updates,
            deletes = summary.deletes,
            bytes = summary.bytes_to_transfer,
            "Plan ready"
        );

        let mut sampler = sampler_for(&dest_root);
        if self.config.check_free_space {
            if let Err(e) = check_free_space(&plan, sampler.as_mut()) {
                return self.abort(Some(&mut recovery), e);
            }
        }
        let monitor = HealthMonitor::start(
            sampler,
            self.config.thresholds,
            self.config.health_sample_interval(),
        );

        self.tracker = ProgressTracker::new(plan.len(), summary.bytes_to_transfer);
        self.queue = plan.entries().cloned().collect();
        emit(self.events, Event::Progress(self.tracker.snapshot()));

        while let Some(entry) = self.queue.pop_front() {
            let flow = self.drain_commands();
            if flow != Flow::Proceed {
                self.queue.push_front(entry);
                return self.stop(&mut recovery, flow);
            }
            let flow = self.wait_while_throttled(&monitor);
            if flow != Flow::Proceed {
                self.queue.push_front(entry);
                return self.stop(&mut recovery, flow);
            }
            // An exclusion update may have arrived after this entry was popped
            if self.exclusions.is_excluded(&entry.path) {
                self.tracker.remove_planned(1, progress_bytes(&entry));
                continue;
            }

            self.tracker.start_file(&entry.path);
            emit(self.events, Event::Progress(self.tracker.snapshot()));

            let result = match entry.action {
                PlanAction::Delete => self.delete_entry(&entry, &dest_root, &mut recovery),
                PlanAction::Copy | PlanAction::Update => self.copy_entry(
                    &entry,
                    &source_root,
                    &dest_root,
                    &effective.copy,
                    &mut recovery,
                ),
            };

            match result {
                EntryResult::Done => {}
                EntryResult::Interrupted(flow) => return self.stop(&mut recovery, flow),
                EntryResult::Failed(file_error) => {
                    match self.handle_file_error(
                        file_error,
                        &dest_root,
                        effective.auto_continue_on_error,
                    ) {
                        Ok(Flow::Proceed) => {}
                        Ok(flow) => {
                            self.tracker.finish_file(progress_bytes(&entry));
                            return self.stop(&mut recovery, flow);
                        }
                        Err(fatal) => return self.abort(Some(&mut recovery), fatal),
                    }
                }
            }

            self.tracker.finish_file(progress_bytes(&entry));
            emit(self.events, Event::Progress(self.tracker.snapshot()));

            if let Err(e) = recovery.maybe_checkpoint() {
                self.checkpoint_failed(e);
            }
        }

        if let Err(e) = recovery.clear() {
            self.checkpoint_failed(e);
        }
        self.set_state(RunState::Completed);
        RunOutcome::Completed
    }

    fn copy_entry(
        &mut self,
        entry: &PlanEntry,
        source_root: &Path,
        dest_root: &Path,
        copy_options: &CopyOptions,
        recovery: &mut RecoveryManager,
    ) -> EntryResult {
        let src = join_relative(source_root, &entry.path);
        let dst = join_relative(dest_root, &entry.path);

        let mut interrupt: Option<Flow> = None;
        let mut pending_exclusions: Option<Vec<String>> = None;
        let result = {
            let tracker = &mut self.tracker;
            let events = self.events;
            let commands = self.commands;
            let checkpoints = &mut *recovery;
            let mut on_chunk = |bytes: u64| -> ControlFlow<()> {
                tracker.file_progress(bytes);
                if tracker.should_emit() {
                    emit(events, Event::Progress(tracker.snapshot()));
                }
                if let Err(e) = checkpoints.maybe_checkpoint() {
                    warn!(error = %e, "Periodic checkpoint failed");
                }
                loop {
                    match commands.try_recv() {
                        Ok(Command::StopBackup) => {
                            interrupt = Some(Flow::Stop);
                            return ControlFlow::Break(());
                        }
                        Ok(Command::Shutdown) | Err(TryRecvError::Disconnected) => {
                            interrupt = Some(Flow::Shutdown);
                            return ControlFlow::Break(());
                        }
                        Ok(Command::UpdateExclusions(patterns)) => {
                            pending_exclusions = Some(patterns)
                        }
                        Ok(other) => debug!(command = ?other, "Ignored while copying"),
                        Err(TryRecvError::Empty) => return ControlFlow::Continue(()),
                    }
                }
            };
            fs_ops::copy_file(&src, &dst, copy_options, &mut on_chunk)
        };

        if let Some(patterns) = pending_exclusions {
            self.apply_exclusions(patterns);
        }

        match result {
            Ok(CopyOutcome::Committed { bytes }) => {
                if entry.action == PlanAction::Update {
                    self.generator.record_updated(&entry.path, bytes);
                } else {
                    self.generator.record_copied(&entry.path, bytes);
                }
                match fs::metadata(&dst) {
                    Ok(metadata) => self.cache.insert(
                        dst.clone(),
                        FileRecord::from_metadata(entry.path.clone(), &metadata),
                    ),
                    Err(_) => self.cache.invalidate(&dst),
                }
                if let Err(e) = recovery.record_processed(&entry.path) {
                    self.checkpoint_failed(e);
                }
                debug!(path = %entry.path, action = %entry.action, bytes, "Committed");
                EntryResult::Done
            }
            Ok(CopyOutcome::Cancelled { bytes_written }) => {
                debug!(path = %entry.path, bytes_written, "Copy abandoned");
                EntryResult::Interrupted(interrupt.unwrap_or(Flow::Stop))
            }
            Ok(CopyOutcome::VerificationFailed {
                unverified_path,
                reason,
            }) => {
                self.generator.record_flagged(&entry.path);
                EntryResult::Failed(FileError::new(
                    entry.path.clone(),
                    ErrorKind::Copy,
                    format!(
                        "verification failed: {}; copy kept at {}",
                        reason,
                        unverified_path.display()
                    ),
                ))
            }
            Err(e) => EntryResult::Failed(FileError::from_engine(&entry.path, ErrorKind::Copy, &e)),
        }
    }

    fn delete_entry(
        &mut self,
        entry: &PlanEntry,
        dest_root: &Path,
        recovery: &mut RecoveryManager,
    ) -> EntryResult {
        let dst = join_relative(dest_root, &entry.path);
        match fs_ops::remove_file(dest_root, &dst) {
            Ok(()) => {
                self.cache.invalidate(&dst);
                self.generator.record_deleted(&entry.path, entry.size);
                if let Err(e) = recovery.record_processed(&entry.path) {
                    self.checkpoint_failed(e);
                }
                debug!(path = %entry.path, "Deleted");
                EntryResult::Done
            }
            Err(e) => EntryResult::Failed(FileError::from_engine(&entry.path, ErrorKind::Delete, &e)),
        }
    }

    /// Record a per-file error, check that the destination is still there
    /// and, unless auto-continue is on, wait for the caller's decision.
    fn handle_file_error(
        &mut self,
        file_error: FileError,
        dest_root: &Path,
        auto_continue: bool,
    ) -> Result<Flow> {
        warn!(error = %file_error, "File failed");
        self.generator.record_error(file_error.clone());
        emit(self.events, Event::FileError(file_error.clone()));

        probe_destination(dest_root)?;

        if auto_continue {
            return Ok(Flow::Proceed);
        }

        emit(
            self.events,
            Event::AwaitingDecision {
                path: file_error.path,
            },
        );
        loop {
            match self.commands.recv() {
                Ok(Command::Continue) => return Ok(Flow::Proceed),
                Ok(Command::StopBackup) => return Ok(Flow::Stop),
                Ok(Command::Shutdown) | Err(_) => return Ok(Flow::Shutdown),
                Ok(Command::UpdateExclusions(patterns)) => self.apply_exclusions(patterns),
                Ok(Command::StartBackup { .. }) => {
                    warn!("Run already in progress, start request ignored")
                }
            }
        }
    }

    /// Back off while any resource is over its threshold.
    ///
    /// The wait is advisory: after `throttle_max_wait_secs` the run carries
    /// on regardless. Commands are served while waiting.
    fn wait_while_throttled(&mut self, monitor: &HealthMonitor) -> Flow {
        let reason = match monitor.throttle_reason() {
            Some(reason) => reason,
            None => return Flow::Proceed,
        };

        warn!(%reason, "Resources over threshold, throttling");
        self.generator.record_throttled();
        emit(self.events, Event::Throttled(reason));

        let max_wait = Duration::from_secs(self.config.throttle_max_wait_secs);
        let max_backoff = Duration::from_millis(self.config.throttle_max_backoff_ms);
        let mut backoff = Duration::from_millis(self.config.throttle_initial_backoff_ms);
        let started = Instant::now();

        loop {
            let waited = started.elapsed();
            if waited >= max_wait {
                warn!(waited_secs = waited.as_secs(), "Still throttled, continuing anyway");
                return Flow::Proceed;
            }

            match self.commands.recv_timeout(backoff.min(max_wait - waited)) {
                Ok(command) => {
                    let flow = self.handle_command(command);
                    if flow != Flow::Proceed {
                        return flow;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Flow::Shutdown,
            }

            if !monitor.should_throttle() {
                info!("Resources back under threshold");
                return Flow::Proceed;
            }
            backoff = (backoff * 2).min(max_backoff);
        }
    }

    fn drain_commands(&mut self) -> Flow {
        loop {
            match self.commands.try_recv() {
                Ok(command) => {
                    let flow = self.handle_command(command);
                    if flow != Flow::Proceed {
                        return flow;
                    }
                }
                Err(TryRecvError::Empty) => return Flow::Proceed,
                Err(TryRecvError::Disconnected) => return Flow::Shutdown,
            }
        }
    }

    fn handle_command(&mut self, command: Command) -> Flow {
        match command {
            Command::StopBackup => Flow::Stop,
            Command::Shutdown => Flow::Shutdown,
            Command::UpdateExclusions(patterns) => {
                self.apply_exclusions(patterns);
                Flow::Proceed
            }
            Command::Continue => {
                debug!("Continue received with no pending decision");
                Flow::Proceed
            }
            Command::StartBackup { .. } => {
                warn!("Run already in progress, start request ignored");
                Flow::Proceed
            }
        }
    }

    /// Replace the engine's exclusions and drop queued entries they match.
    fn apply_exclusions(&mut self, patterns: Vec<String>) {
        let set = match ExclusionSet::from_patterns(patterns.as_slice()) {
            Ok(set) => set,
            Err(e) => {
                warn!(error = %e, "Exclusion update rejected");
                return;
            }
        };
        *self.exclusions = set.with_size_limits(self.config.min_file_size, self.config.max_file_size);

        let mut remaining: Plan = self.queue.drain(..).collect();
        let bytes_before: u64 = remaining.entries().map(progress_bytes).sum();
        let dropped = remaining.retain_not_excluded(&*self.exclusions);
        let bytes_after: u64 = remaining.entries().map(progress_bytes).sum();
        self.queue = remaining.entries().cloned().collect();
        self.tracker.remove_planned(dropped, bytes_before - bytes_after);
        info!(patterns = patterns.len(), dropped, "Exclusions updated");
    }

    /// Graceful stop: keep the checkpoint so the next run can resume.
    fn stop(&mut self, recovery: &mut RecoveryManager, flow: Flow) -> RunOutcome {
        if flow == Flow::Shutdown {
            self.shutdown = true;
        }
        if let Err(e) = recovery.checkpoint() {
            self.checkpoint_failed(e);
        }
        self.set_state(RunState::Stopped);
        info!(
            processed = recovery.processed_count(),
            remaining = self.queue.len(),
            "Backup run stopped"
        );
        RunOutcome::Stopped
    }

    /// Fatal end of the run. The checkpoint is kept when a plan exists.
    fn abort(&mut self, recovery: Option<&mut RecoveryManager>, cause: EngineError) -> RunOutcome {
        error!(error = %cause, "Backup run aborted");
        if cause.kind().is_fatal() {
            let path = match &cause {
                EngineError::DestinationUnavailable { path, .. } => {
                    path.to_string_lossy().into_owned()
                }
                _ => String::new(),
            };
            let resource_error = FileError::from_engine(&path, ErrorKind::Resource, &cause);
            self.generator.record_error(resource_error.clone());
            emit(self.events, Event::FileError(resource_error));
        }
        if let Some(recovery) = recovery {
            if let Err(e) = recovery.checkpoint() {
                self.checkpoint_failed(e);
            }
        }
        self.set_state(RunState::Aborted);
        RunOutcome::Aborted {
            reason: cause.to_string(),
        }
    }

    fn checkpoint_failed(&mut self, e: EngineError) {
        warn!(error = %e, "Checkpoint write failed");
        let path = match &e {
            EngineError::Checkpoint { path, .. } => path.to_string_lossy().into_owned(),
            _ => String::new(),
        };
        self.generator
            .record_error(FileError::from_engine(&path, ErrorKind::Recovery, &e));
    }

    fn set_state(&mut self, next: RunState) {
        match self.state.transition(next) {
            Ok(state) => {
                debug!(from = %self.state, to = %state, "Run state changed");
                self.state = state;
            }
            Err(e) => warn!(error = %e, "Ignoring invalid state change"),
        }
    }
}

/// Check the roots of a run and resolve them to absolute paths.
///
/// The source must be an existing directory. The destination may be
/// missing, but must not be a file, the source itself, inside the source
/// or a parent of it.
pub fn validate_paths(source: &Path, destination: &Path) -> Result<(PathBuf, PathBuf)> {
    let metadata = match fs::metadata(source) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(EngineError::SourceNotFound {
                path: source.to_path_buf(),
            })
        }
        Err(e) => {
            return Err(EngineError::SourceAccessDenied {
                path: source.to_path_buf(),
                source: e,
            })
        }
    };
    if !metadata.is_dir() {
        return Err(EngineError::InvalidPath {
            path: source.to_path_buf(),
            reason: "Source must be a directory".to_string(),
        });
    }
    let source_root = source
        .canonicalize()
        .map_err(|e| EngineError::SourceAccessDenied {
            path: source.to_path_buf(),
            source: e,
        })?;

    if destination.as_os_str().is_empty() {
        return Err(EngineError::InvalidPath {
            path: destination.to_path_buf(),
            reason: "Destination path is empty".to_string(),
        });
    }
    if let Ok(metadata) = fs::metadata(destination) {
        if !metadata.is_dir() {
            return Err(EngineError::InvalidPath {
                path: destination.to_path_buf(),
                reason: "Destination exists and is not a directory".to_string(),
            });
        }
    }
    let dest_root = resolve_path(destination);

    let reason = if dest_root == source_root {
        Some("Source and destination are the same directory")
    } else if dest_root.starts_with(&source_root) {
        Some("Destination is inside the source")
    } else if source_root.starts_with(&dest_root) {
        Some("Source is inside the destination")
    } else {
        None
    };
    if let Some(reason) = reason {
        return Err(EngineError::InvalidPath {
            path: destination.to_path_buf(),
            reason: reason.to_string(),
        });
    }

    Ok((source_root, dest_root))
}

/// Absolute form of `path`, canonical up to its deepest existing ancestor.
fn resolve_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path.to_path_buf(),
        }
    };

    let mut missing = Vec::new();
    let mut current = absolute.as_path();
    loop {
        if let Ok(mut resolved) = current.canonicalize() {
            for part in missing.iter().rev() {
                resolved.push(part);
            }
            return resolved;
        }
        match (current.parent(), current.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                current = parent;
            }
            _ => return absolute,
        }
    }
}

/// Fail when the destination disk cannot hold the planned transfers.
///
/// Deletes run first, so the space they free is counted.
fn check_free_space(plan: &Plan, sampler: &mut dyn ResourceSampler) -> Result<()> {
    let freed: u64 = plan.to_delete.iter().map(|e| e.size).sum();
    let required = plan.summary().bytes_to_transfer.saturating_sub(freed);
    match sampler.available_bytes() {
        Some(available) if required > available => {
            Err(EngineError::InsufficientSpace { required, available })
        }
        Some(_) => Ok(()),
        None => {
            debug!("Free space on destination unknown, not checked");
            Ok(())
        }
    }
}

/// Fail with a resource error when the destination root is gone.
fn probe_destination(dest_root: &Path) -> Result<()> {
    match fs::metadata(dest_root) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(EngineError::DestinationUnavailable {
            path: dest_root.to_path_buf(),
            source: io::Error::new(io::ErrorKind::Other, "destination is no longer a directory"),
        }),
        Err(e) => Err(EngineError::DestinationUnavailable {
            path: dest_root.to_path_buf(),
            source: e,
        }),
    }
}

fn join_relative(root: &Path, relative: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    for part in relative.split('/').filter(|p| !p.is_empty()) {
        path.push(part);
    }
    path
}

/// Bytes an entry contributes to progress totals.
fn progress_bytes(entry: &PlanEntry) -> u64 {
    match entry.action {
        PlanAction::Delete => 0,
        PlanAction::Copy | PlanAction::Update => entry.size,
    }
}

fn emit(events: &Sender<Event>, event: Event) {
    if events.send(event).is_err() {
        debug!("Event receiver dropped");
    }
}
