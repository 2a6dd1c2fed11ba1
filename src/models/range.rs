// src/models/range.rs

//! Identifier ranges, scanned-interval bookkeeping and the scan cursor.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Half-open identifier range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRange {
    pub start: u64,
    pub end: u64,
}

impl IdRange {
    /// Validate raw bounds: both non-negative and `start < end`.
    pub fn new(start: i64, end: i64) -> Result<Self> {
        if start < 0 || end < 0 || start >= end {
            return Err(AppError::InvalidRange { start, end });
        }
        Ok(Self {
            start: start as u64,
            end: end as u64,
        })
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, id: u64) -> bool {
        self.start <= id && id < self.end
    }
}

/// Set of closed intervals, kept sorted, merged and non-overlapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CoverageSet(Vec<[u64; 2]>);

impl CoverageSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intervals(&self) -> &[[u64; 2]] {
        &self.0
    }

    pub fn insert(&mut self, id: u64) {
        self.insert_range(id, id);
    }

    /// Insert the closed interval `[start, end]`, merging with overlapping or adjacent ones.
    pub fn insert_range(&mut self, start: u64, end: u64) {
        if start > end {
            return;
        }
        let mut merged = [start, end];
        let mut kept = Vec::with_capacity(self.0.len() + 1);
        for &[s, e] in &self.0 {
            if e.saturating_add(1) < merged[0] || s > merged[1].saturating_add(1) {
                kept.push([s, e]);
            } else {
                merged = [merged[0].min(s), merged[1].max(e)];
            }
        }
        let at = kept.partition_point(|[s, _]| *s < merged[0]);
        kept.insert(at, merged);
        self.0 = kept;
    }

    pub fn contains(&self, id: u64) -> bool {
        let at = self.0.partition_point(|[_, e]| *e < id);
        self.0.get(at).is_some_and(|[s, _]| *s <= id)
    }

    /// Number of identifiers covered.
    pub fn count(&self) -> u64 {
        self.0.iter().map(|[s, e]| e - s + 1).sum()
    }

    /// Lowest id in `range` that is not covered.
    pub fn first_gap(&self, range: IdRange) -> Option<u64> {
        let mut id = range.start;
        for &[s, e] in &self.0 {
            if e < id {
                continue;
            }
            if s > id {
                break;
            }
            id = e.saturating_add(1);
        }
        (id < range.end).then_some(id)
    }

    /// Whether every id in `range` is covered.
    pub fn covers(&self, range: IdRange) -> bool {
        if range.is_empty() {
            return true;
        }
        let at = self.0.partition_point(|[_, e]| *e < range.start);
        self.0
            .get(at)
            .is_some_and(|[s, e]| *s <= range.start && *e >= range.end - 1)
    }
}

/// Persisted scan progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanCursor {
    /// First identifier not yet processed
    pub next_id: u64,
    pub updated_at: DateTime<Utc>,
    /// Number of scan runs that have started from this cursor file
    pub attempt: u32,
    #[serde(default)]
    pub covered: CoverageSet,
    /// Ids whose lookup never resolved, kept for a later retry pass
    #[serde(default)]
    pub unresolved: BTreeSet<u64>,
}

impl Default for ScanCursor {
    fn default() -> Self {
        Self {
            next_id: 0,
            updated_at: Utc::now(),
            attempt: 0,
            covered: CoverageSet::new(),
            unresolved: BTreeSet::new(),
        }
    }
}

impl ScanCursor {
    /// Where a scan over `range` starts: its lowest id not covered by an
    /// earlier run. `None` when the whole range is covered.
    pub fn resume_point(&self, range: IdRange) -> Option<u64> {
        self.covered.first_gap(range)
    }

    /// Record a processed id. Resolved ids drop out of the unresolved list.
    pub fn mark(&mut self, id: u64, unresolved: bool) {
        self.covered.insert(id);
        if unresolved {
            self.unresolved.insert(id);
        } else {
            self.unresolved.remove(&id);
        }
    }

    pub fn mark_range(&mut self, start: u64, end: u64) {
        self.covered.insert_range(start, end);
        if start <= end {
            let ids: Vec<u64> = self.unresolved.range(start..=end).copied().collect();
            for id in ids {
                self.unresolved.remove(&id);
            }
        }
    }

    /// Move `next_id` forward; never backwards.
    pub fn advance_to(&mut self, next_id: u64) {
        if next_id > self.next_id {
            self.next_id = next_id;
        }
    }
}
