//! Error types for the backup engine.
//!
//! `EngineError` represents run-level failures: conditions that prevent a
//! backup run from starting or force it to abort. Per-file problems (a file
//! that could not be read, a delete that failed) are not `EngineError`s at the
//! run level; they are captured as [`FileError`] records, classified by
//! [`ErrorKind`], and accumulate into the run report.

use crate::recovery::RunState;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that stop a run (or prevent it from starting).
#[derive(Debug, Error)]
pub enum EngineError {
    /// Source directory does not exist
    #[error("Source directory not found: {}", path.display())]
    SourceNotFound { path: PathBuf },

    /// Source directory is not accessible (permissions)
    #[error("Source directory access denied: {}", path.display())]
    SourceAccessDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Destination root vanished or cannot be reached (e.g. unplugged drive)
    #[error("Destination unavailable: {}", path.display())]
    DestinationUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Not enough free space on the destination for the planned transfers
    #[error("Insufficient space on destination: need {required} bytes, {available} available")]
    InsufficientSpace { required: u64, available: u64 },

    /// Failed to read from a source file
    #[error("Failed to read file: {}", path.display())]
    ReadError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to write to a destination file
    #[error("Failed to write file: {}", path.display())]
    WriteError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to remove a destination file
    #[error("Failed to remove file: {}", path.display())]
    RemoveError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to create a directory
    #[error("Failed to create directory: {}", path.display())]
    DirectoryCreationFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Path rejected by validation
    #[error("Invalid path: {} ({reason})", path.display())]
    InvalidPath { path: PathBuf, reason: String },

    /// A glob pattern failed to compile
    #[error("Invalid exclusion pattern '{pattern}'")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    /// Configuration value out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Checkpoint could not be written or removed
    #[error("Checkpoint error at {}: {reason}", path.display())]
    Checkpoint { path: PathBuf, reason: String },

    /// A run state change that the state machine does not allow
    #[error("Invalid run state transition: {from} -> {to}")]
    InvalidTransition { from: RunState, to: RunState },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The worker thread is gone
    #[error("Engine worker is not running")]
    Disconnected,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl EngineError {
    /// Extract the OS error code from this error, if available.
    pub fn raw_os_error(&self) -> Option<u32> {
        match self {
            Self::SourceAccessDenied { source, .. }
            | Self::DestinationUnavailable { source, .. }
            | Self::ReadError { source, .. }
            | Self::WriteError { source, .. }
            | Self::RemoveError { source, .. }
            | Self::DirectoryCreationFailed { source, .. } => {
                source.raw_os_error().map(|e| e as u32)
            }
            Self::Io(source) => source.raw_os_error().map(|e| e as u32),
            _ => None,
        }
    }

    /// The error category this failure falls into when recorded against a file.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DestinationUnavailable { .. } | Self::InsufficientSpace { .. } => {
                ErrorKind::Resource
            }
            Self::Checkpoint { .. }
            | Self::Serialization(_)
            | Self::InvalidTransition { .. } => ErrorKind::Recovery,
            Self::RemoveError { .. } => ErrorKind::Delete,
            _ => ErrorKind::Copy,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Classification of a recorded error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Listing or stating one entry failed; the entry was left out of the index
    Scan,
    /// Reading, writing or verifying one file failed
    Copy,
    /// Removing a destination file failed
    Delete,
    /// A checkpoint was unreadable or corrupt and was ignored
    Recovery,
    /// The destination as a whole is unusable; fatal for the run
    Resource,
}

impl ErrorKind {
    /// Only resource errors end a run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorKind::Resource)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Scan => write!(f, "scan"),
            ErrorKind::Copy => write!(f, "copy"),
            ErrorKind::Delete => write!(f, "delete"),
            ErrorKind::Recovery => write!(f, "recovery"),
            ErrorKind::Resource => write!(f, "resource"),
        }
    }
}

/// A non-fatal error recorded against a single path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileError {
    /// Relative path where possible, absolute when the failure happened
    /// outside any indexed tree
    pub path: String,
    pub kind: ErrorKind,
    pub message: String,
    /// OS error code, when the failure came from the OS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_code: Option<u32>,
}

impl FileError {
    pub fn new(path: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        FileError {
            path: path.into(),
            kind,
            message: message.into(),
            os_code: None,
        }
    }

    /// Build a record from an I/O failure on `path`.
    pub fn from_io(path: &Path, kind: ErrorKind, err: &io::Error) -> Self {
        FileError {
            path: path.to_string_lossy().into_owned(),
            kind,
            message: err.to_string(),
            os_code: err.raw_os_error().map(|e| e as u32),
        }
    }

    /// Build a record from an engine failure while processing `path`.
    pub fn from_engine(path: &str, kind: ErrorKind, err: &EngineError) -> Self {
        FileError {
            path: path.to_string(),
            kind,
            message: err.to_string(),
            os_code: err.raw_os_error(),
        }
    }
}

impl fmt::Display for FileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.kind, self.path, self.message)
    }
}
