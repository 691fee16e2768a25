//! Accuracy ranges: time spans known to be fully synchronized.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::DateRange;

/// A half-open span `[start, end)` whose message set was complete as of
/// `last_synced_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccuracyRange {
    /// Inclusive start.
    pub start: DateTime<Utc>,
    /// Exclusive end.
    pub end: DateTime<Utc>,
    /// When the span was last synchronized.
    pub last_synced_at: DateTime<Utc>,
}

impl AccuracyRange {
    /// How long ago the span was synchronized.
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_synced_at).to_std().unwrap_or_default()
    }
}

/// Sorted, non-overlapping accuracy ranges of one folder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccuracyRanges {
    ranges: Vec<AccuracyRange>,
}

impl AccuracyRanges {
    /// Rebuilds the list from possibly overlapping ranges; where they
    /// overlap the most recently synced one wins.
    #[must_use]
    pub fn from_ranges(mut ranges: Vec<AccuracyRange>) -> Self {
        ranges.sort_by_key(|r| r.last_synced_at);
        let mut list = Self::default();
        for range in ranges {
            list.note_synced(DateRange::new(range.start, range.end), range.last_synced_at);
        }
        list
    }

    /// The ranges, oldest span first.
    #[must_use]
    pub fn as_slice(&self) -> &[AccuracyRange] {
        &self.ranges
    }

    /// Records that `range` was fully synchronized at `at`, replacing any
    /// older coverage of the same span.
    pub fn note_synced(&mut self, range: DateRange, at: DateTime<Utc>) {
        if range.is_empty() {
            return;
        }
        self.clip(range);
        let idx = self.ranges.partition_point(|r| r.start < range.start);
        self.ranges.insert(
            idx,
            AccuracyRange {
                start: range.start,
                end: range.end,
                last_synced_at: at,
            },
        );
        self.merge_around(idx);
    }

    /// Forgets any coverage of `range`.
    pub fn clip(&mut self, range: DateRange) {
        if range.is_empty() {
            return;
        }
        let mut kept = Vec::with_capacity(self.ranges.len() + 1);
        for r in self.ranges.drain(..) {
            if r.end <= range.start || r.start >= range.end {
                kept.push(r);
                continue;
            }
            if r.start < range.start {
                kept.push(AccuracyRange {
                    end: range.start,
                    ..r.clone()
                });
            }
            if r.end > range.end {
                kept.push(AccuracyRange {
                    start: range.end,
                    ..r
                });
            }
        }
        self.ranges = kept;
    }

    /// Whether every instant of `range` is covered by ranges satisfying
    /// `accept`. An empty range is trivially covered.
    pub fn covers(&self, range: DateRange, mut accept: impl FnMut(&AccuracyRange) -> bool) -> bool {
        let mut cursor = range.start;
        for r in &self.ranges {
            if cursor >= range.end {
                break;
            }
            if r.end <= cursor {
                continue;
            }
            if r.start > cursor || !accept(r) {
                return false;
            }
            cursor = r.end;
        }
        cursor >= range.end
    }

    /// Whether `range` has to be synchronized again: some part of it is
    /// uncovered or was last synced more than `refresh_thresh` ago.
    #[must_use]
    pub fn needs_refresh(&self, range: DateRange, now: DateTime<Utc>, refresh_thresh: Duration) -> bool {
        !self.covers(range, |r| r.age(now) <= refresh_thresh)
    }

    /// Drops everything.
    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    fn merge_around(&mut self, idx: usize) {
        if idx + 1 < self.ranges.len() && self.mergeable(idx, idx + 1) {
            let next = self.ranges.remove(idx + 1);
            self.ranges[idx].end = next.end;
        }
        if idx > 0 && self.mergeable(idx - 1, idx) {
            let current = self.ranges.remove(idx);
            self.ranges[idx - 1].end = current.end;
        }
    }

    fn mergeable(&self, a: usize, b: usize) -> bool {
        self.ranges[a].end == self.ranges[b].start
            && self.ranges[a].last_synced_at == self.ranges[b].last_synced_at
    }
}
