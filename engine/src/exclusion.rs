//! Exclusion rules applied while indexing a tree.
//!
//! A relative path is excluded when any glob matches the path itself, one of
//! its ancestor prefixes (`a`, `a/b` for `a/b/c.txt`), or any single segment
//! (so `node_modules` or `*.tmp` match at every depth). Size limits are
//! checked separately because they need the file's metadata.

use crate::error::{EngineError, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};

/// Patterns excluded when no configuration says otherwise.
pub const DEFAULT_EXCLUDES: &[&str] = &["*.tmp", "~*", "Thumbs.db", ".DS_Store"];

/// Compiled set of exclusion patterns plus optional size limits.
#[derive(Debug, Clone)]
pub struct ExclusionSet {
    glob_set: GlobSet,
    patterns: Vec<String>,
    min_size: Option<u64>,
    max_size: Option<u64>,
}

impl Default for ExclusionSet {
    fn default() -> Self {
        Self::empty()
    }
}

impl ExclusionSet {
    /// A set that excludes nothing.
    pub fn empty() -> Self {
        Self {
            glob_set: GlobSet::empty(),
            patterns: Vec::new(),
            min_size: None,
            max_size: None,
        }
    }

    /// Compile a list of patterns. Blank entries and duplicates are ignored.
    pub fn from_patterns<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        let mut pattern_list: Vec<String> = Vec::new();

        for pattern in patterns {
            let pattern = pattern.as_ref().trim();
            if pattern.is_empty() || pattern_list.iter().any(|p| p == pattern) {
                continue;
            }
            let glob = Glob::new(pattern).map_err(|e| EngineError::InvalidPattern {
                pattern: pattern.to_string(),
                source: e,
            })?;
            builder.add(glob);
            pattern_list.push(pattern.to_string());
        }

        let glob_set = builder.build().map_err(|e| EngineError::InvalidPattern {
            pattern: pattern_list.join(", "),
            source: e,
        })?;

        Ok(Self {
            glob_set,
            patterns: pattern_list,
            min_size: None,
            max_size: None,
        })
    }

    /// Files smaller than `min` or larger than `max` are excluded.
    pub fn with_size_limits(mut self, min: Option<u64>, max: Option<u64>) -> Self {
        self.min_size = min;
        self.max_size = max;
        self
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Check a `/`-separated relative path against the patterns.
    pub fn is_excluded(&self, relative: &str) -> bool {
        if self.patterns.is_empty() {
            return false;
        }

        let mut end = 0;
        for segment in relative.split('/') {
            if segment.is_empty() {
                end += 1;
                continue;
            }
            end += segment.len();
            let prefix = &relative[..end];
            if self.glob_set.is_match(segment) || self.glob_set.is_match(prefix) {
                return true;
            }
            end += 1;
        }

        false
    }

    /// Check a file size against the configured limits.
    pub fn excludes_size(&self, size: u64) -> bool {
        if let Some(min) = self.min_size {
            if size < min {
                return true;
            }
        }
        if let Some(max) = self.max_size {
            if size > max {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_patterns() {
        let excludes = ExclusionSet::from_patterns(DEFAULT_EXCLUDES).unwrap();

        assert!(excludes.is_excluded("build.tmp"));
        assert!(excludes.is_excluded("docs/~lock.docx"));
        assert!(excludes.is_excluded("photos/Thumbs.db"));
        assert!(excludes.is_excluded(".DS_Store"));

        assert!(!excludes.is_excluded("src/main.rs"));
        assert!(!excludes.is_excluded("README.md"));
    }

    #[test]
    fn test_ancestor_segment_excludes_descendants() {
        let excludes = ExclusionSet::from_patterns(&["node_modules", "cache"]).unwrap();

        assert!(excludes.is_excluded("node_modules"));
        assert!(excludes.is_excluded("web/node_modules/pkg/index.js"));
        assert!(excludes.is_excluded("cache/a/b/c"));
        assert!(!excludes.is_excluded("web/src/index.js"));
        assert!(!excludes.is_excluded("caches/file"));
    }

    #[test]
    fn test_ancestor_prefix_pattern() {
        let excludes = ExclusionSet::from_patterns(&["build/out"]).unwrap();

        assert!(excludes.is_excluded("build/out"));
        assert!(excludes.is_excluded("build/out/app.bin"));
        assert!(!excludes.is_excluded("build/src/app.rs"));
    }

    #[test]
    fn test_empty_set_excludes_nothing() {
        let excludes = ExclusionSet::empty();
        assert!(!excludes.is_excluded("anything/at/all.tmp"));
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let result = ExclusionSet::from_patterns(&["[unclosed"]);
        assert!(matches!(result, Err(EngineError::InvalidPattern { .. })));
    }

    #[test]
    fn test_blank_and_duplicate_patterns_ignored() {
        let excludes = ExclusionSet::from_patterns(&["*.log", "  ", "*.log"]).unwrap();
        assert_eq!(excludes.patterns(), &["*.log".to_string()]);
    }

    #[test]
    fn test_size_limits() {
        let excludes = ExclusionSet::empty().with_size_limits(Some(10), Some(100));
        assert!(excludes.excludes_size(9));
        assert!(!excludes.excludes_size(10));
        assert!(!excludes.excludes_size(100));
        assert!(excludes.excludes_size(101));
    }
}
