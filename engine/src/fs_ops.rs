//! Filesystem operations module.
//!
//! This module provides the per-file operations of a run:
//! - Copying one file through a temporary name with optional verification
//! - Removing destination files and pruning emptied directories
//! - Sweeping temporaries left behind by an interrupted run
//!
//! A copy never writes the final path directly. Bytes go to a hidden
//! `*.mirror-partial` file next to it, which is renamed over the final path
//! only after it has been flushed, stamped and verified. Readers therefore
//! see either the previous version or the complete new one.

use crate::checksums::{compute_file_checksum, ChecksumAlgorithm};
use crate::error::{EngineError, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Suffix of in-flight copies.
pub const PARTIAL_SUFFIX: &str = ".mirror-partial";

/// Suffix given to a copy that failed verification.
pub const UNVERIFIED_SUFFIX: &str = ".mirror-unverified";

/// How a finished copy is checked before it replaces the final path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// Trust the write
    Off,
    /// Re-stat the copy and compare sizes
    Size,
    /// Hash source and copy and compare size and digest
    Checksum(ChecksumAlgorithm),
}

/// Options for [`copy_file`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyOptions {
    /// Bytes read and written per chunk
    pub chunk_size: usize,
    pub verification: Verification,
}

/// Result of one copy attempt that did not hit an I/O error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyOutcome {
    /// The final path now holds the new content
    Committed { bytes: u64 },
    /// The chunk callback asked to stop; the final path is untouched
    Cancelled { bytes_written: u64 },
    /// Verification failed; the final path is untouched and the copy was
    /// kept at `unverified_path`
    VerificationFailed {
        unverified_path: PathBuf,
        reason: String,
    },
}

/// Removes the temporary file on drop unless disarmed.
struct PartialGuard {
    path: PathBuf,
    armed: bool,
}

impl PartialGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PartialGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = fs::remove_file(&self.path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "Failed to remove partial copy");
                }
            }
        }
    }
}

/// Name of the temporary written beside `dst` while it is copied.
pub fn partial_path_for(dst: &Path) -> PathBuf {
    let name = dst
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dst.with_file_name(format!(
        ".{}.{}{}",
        name,
        Uuid::new_v4().simple(),
        PARTIAL_SUFFIX
    ))
}

/// Name under which a copy that failed verification is kept.
pub fn unverified_path_for(dst: &Path) -> PathBuf {
    let name = dst
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dst.with_file_name(format!("{}{}", name, UNVERIFIED_SUFFIX))
}

/// Copy `src` to `dst` in chunks, then verify and atomically commit.
///
/// `on_chunk` is called with the running byte count after every chunk.
/// Returning [`ControlFlow::Break`] abandons the copy: the temporary is
/// deleted and [`CopyOutcome::Cancelled`] is returned.
///
/// The source modification time is stamped onto the copy so the next scan
/// sees equal records.
///
/// # Errors
/// Read, write and directory creation failures. The temporary is removed in
/// every error case.
pub fn copy_file(
    src: &Path,
    dst: &Path,
    options: &CopyOptions,
    on_chunk: &mut dyn FnMut(u64) -> ControlFlow<()>,
) -> Result<CopyOutcome> {
    ensure_parent_dir_exists(dst)?;

    let mut src_file = File::open(src).map_err(|e| EngineError::ReadError {
        path: src.to_path_buf(),
        source: e,
    })?;
    let src_metadata = src_file.metadata().map_err(|e| EngineError::ReadError {
        path: src.to_path_buf(),
        source: e,
    })?;
    let src_mtime = src_metadata.modified().ok();

    let partial = partial_path_for(dst);
    // Declared before the file so the handle is closed before removal
    let mut guard = PartialGuard {
        path: partial.clone(),
        armed: true,
    };
    let mut dst_file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&partial)
        .map_err(|e| EngineError::WriteError {
            path: partial.clone(),
            source: e,
        })?;

    let mut buffer = vec![0u8; options.chunk_size.max(1)];
    let mut bytes_written = 0u64;

    loop {
        let n = match src_file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(EngineError::ReadError {
                    path: src.to_path_buf(),
                    source: e,
                })
            }
        };

        dst_file
            .write_all(&buffer[..n])
            .map_err(|e| EngineError::WriteError {
                path: partial.clone(),
                source: e,
            })?;
        bytes_written += n as u64;

        if on_chunk(bytes_written).is_break() {
            debug!(path = %dst.display(), bytes_written, "Copy cancelled mid-file");
            return Ok(CopyOutcome::Cancelled { bytes_written });
        }
    }

    dst_file.sync_all().map_err(|e| EngineError::WriteError {
        path: partial.clone(),
        source: e,
    })?;
    drop(dst_file);

    if let Some(mtime) = src_mtime {
        filetime::set_file_mtime(&partial, filetime::FileTime::from_system_time(mtime)).map_err(
            |e| EngineError::WriteError {
                path: partial.clone(),
                source: e,
            },
        )?;
    }

    if let Some(reason) = verify_copy(src, &partial, options)? {
        let unverified_path = unverified_path_for(dst);
        fs::rename(&partial, &unverified_path).map_err(|e| EngineError::WriteError {
            path: unverified_path.clone(),
            source: e,
        })?;
        guard.disarm();
        warn!(
            path = %dst.display(),
            kept_as = %unverified_path.display(),
            %reason,
            "Copy failed verification"
        );
        return Ok(CopyOutcome::VerificationFailed {
            unverified_path,
            reason,
        });
    }

    fs::rename(&partial, dst).map_err(|e| EngineError::WriteError {
        path: dst.to_path_buf(),
        source: e,
    })?;
    guard.disarm();

    Ok(CopyOutcome::Committed {
        bytes: bytes_written,
    })
}

/// Check a finished copy against its source.
///
/// Returns `Some(reason)` on mismatch.
fn verify_copy(src: &Path, copy: &Path, options: &CopyOptions) -> Result<Option<String>> {
    if options.verification == Verification::Off {
        return Ok(None);
    }

    let src_len = fs::metadata(src)
        .map_err(|e| EngineError::ReadError {
            path: src.to_path_buf(),
            source: e,
        })?
        .len();
    let copy_len = fs::metadata(copy)
        .map_err(|e| EngineError::ReadError {
            path: copy.to_path_buf(),
            source: e,
        })?
        .len();

    if src_len != copy_len {
        return Ok(Some(format!(
            "size mismatch: source {} bytes, copy {} bytes",
            src_len, copy_len
        )));
    }

    if let Verification::Checksum(algorithm) = options.verification {
        let src_sum = compute_file_checksum(src, algorithm, options.chunk_size)?;
        let copy_sum = compute_file_checksum(copy, algorithm, options.chunk_size)?;
        if src_sum != copy_sum {
            return Ok(Some(format!(
                "{} mismatch: source {}, copy {}",
                algorithm,
                src_sum.hex(),
                copy_sum.hex()
            )));
        }
    }

    Ok(None)
}

/// Remove a destination file, then prune parent directories left empty, up
/// to but not including `root`.
///
/// A file that is already gone counts as removed.
pub fn remove_file(root: &Path, path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "Already removed");
        }
        Err(e) => {
            return Err(EngineError::RemoveError {
                path: path.to_path_buf(),
                source: e,
            })
        }
    }

    let mut dir = path.parent();
    while let Some(current) = dir {
        if current == root || !current.starts_with(root) {
            break;
        }
        // Fails on non-empty directories, which ends the pruning
        if fs::remove_dir(current).is_err() {
            break;
        }
        dir = current.parent();
    }

    Ok(())
}

/// Delete temporaries left by an interrupted run. Returns how many went.
pub fn sweep_partials(paths: &[PathBuf]) -> usize {
    let mut removed = 0;
    for path in paths {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Could not remove stale partial"),
        }
    }
    if removed > 0 {
        debug!(removed, "Swept stale partial copies");
    }
    removed
}

/// Ensure the parent directory of a path exists, creating it if necessary.
///
/// # Errors
/// Returns EngineError if directory creation fails or the parent exists
/// but is not a directory.
pub fn ensure_parent_dir_exists(path: &Path) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => return Ok(()),
    };

    match fs::metadata(parent) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(EngineError::DirectoryCreationFailed {
            path: parent.to_path_buf(),
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                "Parent path exists but is not a directory",
            ),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(parent).map_err(|e| EngineError::DirectoryCreationFailed {
                path: parent.to_path_buf(),
                source: e,
            })
        }
        Err(e) => Err(EngineError::DirectoryCreationFailed {
            path: parent.to_path_buf(),
            source: e,
        }),
    }
}
