//! # Backup Engine - Mirror Backup Library
//!
//! A headless engine that keeps a destination directory an exact mirror of a
//! source directory. Designed as the foundation for multiple front ends
//! (CLI, scheduled jobs, automation).
//!
//! ## Overview
//!
//! Each run indexes both trees, diffs them into a plan of copies, updates and
//! deletes, and executes that plan one file at a time. It features:
//! - Atomic per-file commits (write to a temporary, verify, rename)
//! - Checkpoints that let an interrupted run resume where it stopped
//! - Resource-aware throttling between files
//! - Per-file error isolation with a final JSON-serializable report
//! - A command/event channel decoupled from any UI technology
//!
//! ## Basic Usage
//!
//! ```no_run
//! use backup_engine::{Engine, EngineConfig, Event, RunOptions};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Engine::spawn(EngineConfig::default())?;
//! engine.start("/data/photos", "/mnt/backup/photos", None, RunOptions::default())?;
//!
//! for event in engine.events() {
//!     match event {
//!         Event::Progress(p) => println!("{:.1}%", p.percent()),
//!         Event::AwaitingDecision { .. } => engine.continue_run()?,
//!         Event::RunCompleted(report) | Event::RunStopped(report) => {
//!             println!("{}", report.summary_line());
//!             break;
//!         }
//!         _ => {}
//!     }
//! }
//! engine.shutdown()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **model**: File records and the metadata index
//! - **scan**: Directory walking into a metadata index
//! - **cache**: Bounded metadata cache with TTL
//! - **exclusion**: Glob exclusions and size limits
//! - **diff**: Plan computation
//! - **fs_ops**: Atomic copy, delete and cleanup
//! - **checksums**: Digests for copy verification
//! - **health**: Resource sampling and throttling
//! - **recovery**: Run states and checkpoints
//! - **report**: Run reports
//! - **progress**: Commands, events and progress statistics
//! - **job**: Execution of one run
//! - **engine**: Worker thread and its handle
//! - **config**: Engine configuration
//! - **error**: Error types and handling

pub mod cache;
pub mod checksums;
pub mod config;
pub mod diff;
pub mod engine;
pub mod error;
pub mod exclusion;
pub mod fs_ops;
pub mod health;
pub mod job;
pub mod model;
pub mod progress;
pub mod recovery;
pub mod report;
pub mod scan;

// Re-export main types and functions
pub use cache::MetadataCache;
pub use checksums::{compute_file_checksum, ChecksumAlgorithm, ChecksumValue};
pub use config::{EngineConfig, RunOptions};
pub use diff::{diff, Plan, PlanAction, PlanEntry, PlanSummary};
pub use engine::{Engine, EngineHandle};
pub use error::{EngineError, ErrorKind, FileError};
pub use exclusion::{ExclusionSet, DEFAULT_EXCLUDES};
pub use health::{HealthMonitor, ResourceSample, ResourceThresholds};
pub use job::validate_paths;
pub use model::{FileRecord, MetadataIndex};
pub use progress::{Command, Event, Progress};
pub use recovery::{CheckpointState, RecoveryManager, RunState};
pub use report::{Report, RunOutcome};
pub use scan::scan_tree;
