//! Metadata cache.
//!
//! Keeps the last known [`FileRecord`] for absolute paths across runs of the
//! same engine. The cache never stands in for a stat: the scanner always reads
//! live metadata and [`MetadataCache::validate`] compares it with the cached
//! record. A hit means the file is unchanged since it was last validated
//! within the configured time-to-live; anything else refreshes the entry.
//!
//! The map is bounded. When it grows past its capacity an eviction pass drops
//! the least-recently-validated entries, reclaiming `cleanup_ratio` of the
//! capacity at once so eviction does not run on every insert.

use crate::model::FileRecord;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

/// One cached record.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub path: PathBuf,
    pub record: FileRecord,
    pub validated_at: Instant,
    /// Monotonic counter giving a total order on validations
    tick: u64,
}

/// Hit/miss counters, mostly for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evicted: u64,
}

/// What [`MetadataCache::validate`] found for a live record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    /// Cached within the TTL and identical to the live record
    Unchanged,
    /// Cached within the TTL but the live record differs
    Changed,
    /// Not cached, or cached too long ago to compare
    Unknown,
}

/// Bounded absolute-path → metadata cache.
#[derive(Debug)]
pub struct MetadataCache {
    entries: HashMap<PathBuf, CacheEntry>,
    capacity: usize,
    cleanup_ratio: f64,
    ttl: Duration,
    next_tick: u64,
    stats: CacheStats,
}

impl MetadataCache {
    pub fn new(capacity: usize, cleanup_ratio: f64, ttl: Duration) -> Self {
        MetadataCache {
            entries: HashMap::new(),
            capacity: capacity.max(1),
            cleanup_ratio: cleanup_ratio.clamp(f64::MIN_POSITIVE, 1.0),
            ttl,
            next_tick: 0,
            stats: CacheStats::default(),
        }
    }

    /// Return the cached record if it was validated less than `ttl` ago.
    pub fn lookup(&mut self, path: &Path) -> Option<FileRecord> {
        let fresh = self
            .entries
            .get(path)
            .filter(|entry| entry.validated_at.elapsed() < self.ttl)
            .map(|entry| entry.record.clone());

        match fresh {
            Some(record) => {
                self.stats.hits += 1;
                Some(record)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Compare the live record of `path` with the cached one and store the
    /// live record. The live record always wins.
    pub fn validate(&mut self, path: &Path, live: &FileRecord) -> Validation {
        let validation = match self.entries.get(path) {
            Some(entry) if entry.validated_at.elapsed() < self.ttl => {
                if entry.record == *live {
                    Validation::Unchanged
                } else {
                    Validation::Changed
                }
            }
            _ => Validation::Unknown,
        };

        if validation == Validation::Unchanged {
            self.stats.hits += 1;
        } else {
            self.stats.misses += 1;
        }
        self.insert(path.to_path_buf(), live.clone());
        validation
    }

    /// Store a freshly validated record, evicting if over capacity.
    pub fn insert(&mut self, path: PathBuf, record: FileRecord) {
        let tick = self.next_tick;
        self.next_tick += 1;
        self.entries.insert(
            path.clone(),
            CacheEntry {
                path,
                record,
                validated_at: Instant::now(),
                tick,
            },
        );

        if self.entries.len() > self.capacity {
            self.evict();
        }
    }

    /// Forget a path (after the engine deleted or replaced it).
    pub fn invalidate(&mut self, path: &Path) {
        self.entries.remove(path);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Drop the least-recently-validated entries.
    ///
    /// Removes `ceil(capacity * cleanup_ratio)` entries, or more if that is
    /// not enough to get back under capacity.
    fn evict(&mut self) {
        let batch = (self.capacity as f64 * self.cleanup_ratio).ceil() as usize;
        let overflow = self.entries.len().saturating_sub(self.capacity);
        let remove_count = batch.max(overflow).min(self.entries.len());

        let mut by_age: Vec<(u64, PathBuf)> = self
            .entries
            .values()
            .map(|entry| (entry.tick, entry.path.clone()))
            .collect();
        by_age.sort_unstable_by_key(|(tick, _)| *tick);

        for (_, path) in by_age.into_iter().take(remove_count) {
            self.entries.remove(&path);
        }

        self.stats.evicted += remove_count as u64;
        debug!(
            removed = remove_count,
            remaining = self.entries.len(),
            "Metadata cache eviction pass"
        );
    }
}
