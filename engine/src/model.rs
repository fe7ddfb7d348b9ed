//! Core data model for backup runs.
//!
//! - FileRecord: the metadata of one file that the diff compares
//! - MetadataIndex: an immutable snapshot of one directory tree

use crate::error::FileError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Metadata of one file, keyed by its path relative to the tree root.
///
/// Paths always use `/` separators so that indexes built on different
/// platforms compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Relative path from the tree root
    pub path: String,

    /// File size in bytes
    pub size: u64,

    /// Modification time in nanoseconds since the Unix epoch
    pub modified: i64,
}

impl FileRecord {
    pub fn new(path: impl Into<String>, size: u64, modified: i64) -> Self {
        FileRecord {
            path: path.into(),
            size,
            modified,
        }
    }

    /// Build a record from filesystem metadata.
    pub fn from_metadata(path: impl Into<String>, metadata: &Metadata) -> Self {
        let modified = metadata.modified().map(system_time_to_nanos).unwrap_or(0);
        FileRecord {
            path: path.into(),
            size: metadata.len(),
            modified,
        }
    }

    /// True if size and modification time match exactly.
    ///
    /// There is no tolerance window: a one nanosecond difference counts as a
    /// change. Filesystems with coarse timestamps will therefore report some
    /// files as changed when only their clock precision differs.
    pub fn same_content_as(&self, other: &FileRecord) -> bool {
        self.size == other.size && self.modified == other.modified
    }
}

/// Convert a `SystemTime` to signed nanoseconds since the Unix epoch.
pub fn system_time_to_nanos(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => after.as_nanos().min(i64::MAX as u128) as i64,
        Err(before) => -(before.duration().as_nanos().min(i64::MAX as u128) as i64),
    }
}

/// Convert a relative filesystem path to the index's `/`-separated form.
pub fn normalize_relative(path: &Path) -> String {
    let mut out = String::new();
    for component in path.components() {
        if let std::path::Component::Normal(part) = component {
            if !out.is_empty() {
                out.push('/');
            }
            out.push_str(&part.to_string_lossy());
        }
    }
    out
}

/// Immutable snapshot of one directory tree: relative path → FileRecord.
///
/// Records keep the order in which the walk produced them; that order is the
/// processing order of any plan derived from this index.
#[derive(Debug, Clone, Default)]
pub struct MetadataIndex {
    root: PathBuf,
    records: Vec<FileRecord>,
    positions: HashMap<String, usize>,
    errors: Vec<FileError>,
    stale_partials: Vec<PathBuf>,
    symlinks_skipped: usize,
}

impl MetadataIndex {
    /// Start building an index for `root`.
    pub fn builder(root: impl Into<PathBuf>) -> IndexBuilder {
        IndexBuilder {
            index: MetadataIndex {
                root: root.into(),
                ..Default::default()
            },
        }
    }

    /// Build an index directly from records (duplicates keep the first one).
    pub fn from_records(root: impl Into<PathBuf>, records: Vec<FileRecord>) -> Self {
        let mut builder = Self::builder(root);
        for record in records {
            builder.insert(record);
        }
        builder.build()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn get(&self, path: &str) -> Option<&FileRecord> {
        self.positions.get(path).map(|&i| &self.records[i])
    }

    pub fn contains(&self, path: &str) -> bool {
        self.positions.contains_key(path)
    }

    /// Records in walk order.
    pub fn iter(&self) -> impl Iterator<Item = &FileRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.records.iter().map(|r| r.size).sum()
    }

    /// Per-entry failures met while walking; those entries are not indexed.
    pub fn errors(&self) -> &[FileError] {
        &self.errors
    }

    /// Leftover in-flight copies from an interrupted run.
    pub fn stale_partials(&self) -> &[PathBuf] {
        &self.stale_partials
    }

    pub fn symlinks_skipped(&self) -> usize {
        self.symlinks_skipped
    }

    /// Absolute path of a relative index path.
    pub fn absolute(&self, relative: &str) -> PathBuf {
        let mut path = self.root.clone();
        for part in relative.split('/').filter(|p| !p.is_empty()) {
            path.push(part);
        }
        path
    }
}

/// Accumulates records while a tree is walked.
#[derive(Debug)]
pub struct IndexBuilder {
    index: MetadataIndex,
}

impl IndexBuilder {
    /// Add a record; returns false if the path was already present.
    pub fn insert(&mut self, record: FileRecord) -> bool {
        if self.index.positions.contains_key(&record.path) {
            return false;
        }
        self.index
            .positions
            .insert(record.path.clone(), self.index.records.len());
        self.index.records.push(record);
        true
    }

    pub fn record_error(&mut self, error: FileError) {
        self.index.errors.push(error);
    }

    pub fn record_stale_partial(&mut self, path: PathBuf) {
        self.index.stale_partials.push(path);
    }

    pub fn record_symlink(&mut self) {
        self.index.symlinks_skipped += 1;
    }

    pub fn build(self) -> MetadataIndex {
        self.index
    }
}
