//! Directory scanner.
//!
//! Walks one tree and produces a [`MetadataIndex`]. Exclusions are tested on
//! the relative path before anything is stat'ed, and an excluded directory
//! is pruned with its whole subtree. Failures on individual entries are
//! recorded on the index and never abort the walk.

use crate::cache::{MetadataCache, Validation};
use crate::error::{ErrorKind, FileError};
use crate::exclusion::ExclusionSet;
use crate::fs_ops::{PARTIAL_SUFFIX, UNVERIFIED_SUFFIX};
use crate::model::{normalize_relative, FileRecord, MetadataIndex};
use crate::recovery::{CHECKPOINT_FILE_NAME, CHECKPOINT_TEMP_NAME};
use std::fs;
use std::io;
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Files the engine itself leaves in a destination tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Artifact {
    Checkpoint,
    Partial,
    Unverified,
}

fn classify_artifact(file_name: &str) -> Option<Artifact> {
    if file_name == CHECKPOINT_FILE_NAME || file_name == CHECKPOINT_TEMP_NAME {
        Some(Artifact::Checkpoint)
    } else if file_name.ends_with(PARTIAL_SUFFIX) {
        Some(Artifact::Partial)
    } else if file_name.ends_with(UNVERIFIED_SUFFIX) {
        Some(Artifact::Unverified)
    } else {
        None
    }
}

/// Build the index of `root`.
///
/// A missing root yields an empty index; this is the normal case for a
/// destination that has never been written. Every file is stat'ed; `cache`
/// only learns the result and reports whether it changed.
pub fn scan_tree(
    root: &Path,
    exclusions: &ExclusionSet,
    cache: &mut MetadataCache,
) -> MetadataIndex {
    let mut builder = MetadataIndex::builder(root);

    match fs::metadata(root) {
        Ok(metadata) if metadata.is_dir() => {}
        Ok(_) => {
            builder.record_error(FileError::new(
                root.to_string_lossy(),
                ErrorKind::Scan,
                "not a directory",
            ));
            return builder.build();
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(root = %root.display(), "Scan root does not exist, index is empty");
            return builder.build();
        }
        Err(e) => {
            builder.record_error(FileError::from_io(root, ErrorKind::Scan, &e));
            return builder.build();
        }
    }

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| {
            let relative = relative_of(root, entry.path());
            let excluded = exclusions.is_excluded(&relative);
            if excluded {
                debug!(path = %relative, "Excluded");
            }
            !excluded
        });

    let mut changed = 0usize;
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e
                    .path()
                    .map(|p| relative_of(root, p))
                    .unwrap_or_else(|| root.to_string_lossy().into_owned());
                let os_code = e
                    .io_error()
                    .and_then(|io| io.raw_os_error())
                    .map(|c| c as u32);
                warn!(path = %path, error = %e, "Scan error, entry skipped");
                let mut error = FileError::new(path, ErrorKind::Scan, e.to_string());
                error.os_code = os_code;
                builder.record_error(error);
                continue;
            }
        };

        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }
        if file_type.is_symlink() {
            debug!(path = %entry.path().display(), "Symlink not followed");
            builder.record_symlink();
            continue;
        }

        match classify_artifact(&entry.file_name().to_string_lossy()) {
            Some(Artifact::Partial) => {
                builder.record_stale_partial(entry.path().to_path_buf());
                continue;
            }
            Some(_) => continue,
            None => {}
        }

        let relative = relative_of(root, entry.path());

        let record = match entry.metadata() {
            Ok(metadata) => FileRecord::from_metadata(relative.clone(), &metadata),
            Err(e) => {
                let os_code = e
                    .io_error()
                    .and_then(|io| io.raw_os_error())
                    .map(|c| c as u32);
                warn!(path = %relative, error = %e, "Could not stat entry, skipped");
                let mut error = FileError::new(relative, ErrorKind::Scan, e.to_string());
                error.os_code = os_code;
                builder.record_error(error);
                continue;
            }
        };
        if cache.validate(entry.path(), &record) == Validation::Changed {
            debug!(path = %relative, "Changed since last scan");
            changed += 1;
        }

        if exclusions.excludes_size(record.size) {
            debug!(path = %relative, size = record.size, "Excluded by size limit");
            continue;
        }

        builder.insert(record);
    }

    let index = builder.build();
    debug!(
        root = %root.display(),
        files = index.len(),
        bytes = index.total_bytes(),
        errors = index.errors().len(),
        changed,
        "Scan finished"
    );
    index
}

fn relative_of(root: &Path, path: &Path) -> String {
    normalize_relative(path.strip_prefix(root).unwrap_or(path))
}
