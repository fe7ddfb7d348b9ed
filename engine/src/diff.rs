//! Metadata diff.
//!
//! [`diff`] compares two indexes and produces the [`Plan`] for one run. It is
//! a pure function of its inputs: no filesystem access, no clock.

use crate::exclusion::ExclusionSet;
use crate::model::MetadataIndex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;

/// What to do with one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    /// Present in source, absent in destination
    Copy,
    /// Present in both, size or modification time differ
    Update,
    /// Present in destination only
    Delete,
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanAction::Copy => write!(f, "copy"),
            PlanAction::Update => write!(f, "update"),
            PlanAction::Delete => write!(f, "delete"),
        }
    }
}

/// One planned action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanEntry {
    pub action: PlanAction,
    /// Relative path, `/` separated
    pub path: String,
    /// Source size for copy/update, destination size for delete
    pub size: u64,
}

/// Counts and byte totals of a plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanSummary {
    pub copies: usize,
    pub updates: usize,
    pub deletes: usize,
    /// Bytes that will be written to the destination
    pub bytes_to_transfer: u64,
}

impl PlanSummary {
    pub fn total_entries(&self) -> usize {
        self.copies + self.updates + self.deletes
    }
}

/// The per-file actions of one run. The three categories are disjoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    pub to_copy: Vec<PlanEntry>,
    pub to_update: Vec<PlanEntry>,
    pub to_delete: Vec<PlanEntry>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.to_copy.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }

    pub fn len(&self) -> usize {
        self.to_copy.len() + self.to_update.len() + self.to_delete.len()
    }

    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            copies: self.to_copy.len(),
            updates: self.to_update.len(),
            deletes: self.to_delete.len(),
            bytes_to_transfer: self
                .to_copy
                .iter()
                .chain(self.to_update.iter())
                .map(|e| e.size)
                .sum(),
        }
    }

    /// Every path in the plan.
    pub fn paths(&self) -> BTreeSet<String> {
        self.entries().map(|e| e.path.clone()).collect()
    }

    /// Entries in processing order: deletes first to free space, then
    /// copies, then updates. Walk order is kept within each category.
    pub fn entries(&self) -> impl Iterator<Item = &PlanEntry> {
        self.to_delete
            .iter()
            .chain(self.to_copy.iter())
            .chain(self.to_update.iter())
    }

    /// A copy of the plan without the given paths, order preserved.
    pub fn without(&self, processed: &BTreeSet<String>) -> Plan {
        let keep = |e: &&PlanEntry| !processed.contains(&e.path);
        Plan {
            to_copy: self.to_copy.iter().filter(keep).cloned().collect(),
            to_update: self.to_update.iter().filter(keep).cloned().collect(),
            to_delete: self.to_delete.iter().filter(keep).cloned().collect(),
        }
    }

    /// Drop entries whose path is now excluded. Returns how many were dropped.
    pub fn retain_not_excluded(&mut self, exclusions: &ExclusionSet) -> usize {
        let before = self.len();
        self.to_copy.retain(|e| !exclusions.is_excluded(&e.path));
        self.to_update.retain(|e| !exclusions.is_excluded(&e.path));
        self.to_delete.retain(|e| !exclusions.is_excluded(&e.path));
        before - self.len()
    }
}

/// Regroups entries by action, keeping their relative order.
impl FromIterator<PlanEntry> for Plan {
    fn from_iter<I: IntoIterator<Item = PlanEntry>>(entries: I) -> Self {
        let mut plan = Plan::default();
        for entry in entries {
            match entry.action {
                PlanAction::Copy => plan.to_copy.push(entry),
                PlanAction::Update => plan.to_update.push(entry),
                PlanAction::Delete => plan.to_delete.push(entry),
            }
        }
        plan
    }
}

/// Compare `source` against `dest`.
///
/// A shared path whose size and modification time match exactly produces no
/// entry. There is no tolerance: a one nanosecond difference is an update.
pub fn diff(source: &MetadataIndex, dest: &MetadataIndex) -> Plan {
    let mut plan = Plan::default();

    for record in source.iter() {
        match dest.get(&record.path) {
            None => plan.to_copy.push(PlanEntry {
                action: PlanAction::Copy,
                path: record.path.clone(),
                size: record.size,
            }),
            Some(existing) if !existing.same_content_as(record) => {
                plan.to_update.push(PlanEntry {
                    action: PlanAction::Update,
                    path: record.path.clone(),
                    size: record.size,
                })
            }
            Some(_) => {}
        }
    }

    let source_paths: HashSet<&str> = source.iter().map(|r| r.path.as_str()).collect();
    for record in dest.iter() {
        if !source_paths.contains(record.path.as_str()) {
            plan.to_delete.push(PlanEntry {
                action: PlanAction::Delete,
                path: record.path.clone(),
                size: record.size,
            });
        }
    }

    plan
}
