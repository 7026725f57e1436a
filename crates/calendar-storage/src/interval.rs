//! Mutually-exclusive interval set.
//!
//! Intervals live in an ordered set keyed by `(start, end, id)`. Because no
//! two stored intervals overlap, ends are non-decreasing in that order, so the
//! intervals overlapping any range form one contiguous run found by walking
//! backwards from the first key past the range.

use std::collections::BTreeSet;

use calendar_core::Interval;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Default, Clone)]
pub struct IntervalIndex {
    intervals: BTreeSet<Interval>,
}

impl IntervalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Interval> {
        self.intervals.iter()
    }

    /// True iff nothing stored overlaps `candidate` (half-open test).
    pub fn can_add(&self, candidate: &Interval) -> bool {
        // every key below this one has start < candidate.end
        let bound = Interval::new(Uuid::nil(), candidate.end, DateTime::<Utc>::MIN_UTC);
        !self
            .intervals
            .range(..bound)
            .rev()
            .take_while(|iv| iv.end > candidate.start)
            .any(|iv| iv.overlaps(candidate))
    }

    /// Add `candidate` if it is free. Returns whether it was added.
    pub fn add_if_free(&mut self, candidate: Interval) -> bool {
        if self.can_add(&candidate) {
            self.intervals.insert(candidate)
        } else {
            false
        }
    }

    /// Remove the exact interval. Returns whether it was present.
    pub fn remove(&mut self, target: &Interval) -> bool {
        self.intervals.remove(target)
    }

    /// Swap `old` for `new`, or leave `old` in place if `new` conflicts.
    ///
    /// Returns false when `old` is absent or `new` is taken; in both cases
    /// the set is unchanged.
    pub fn replace(&mut self, new: Interval, old: &Interval) -> bool {
        if !self.intervals.remove(old) {
            return false;
        }
        if self.can_add(&new) {
            self.intervals.insert(new);
            true
        } else {
            self.intervals.insert(*old);
            false
        }
    }

    /// Intervals touching `window`, inclusive at both ends, ascending.
    pub fn query_overlapping(&self, window: &Interval) -> Vec<Interval> {
        let bound = Interval::new(Uuid::from_u128(u128::MAX), window.end, DateTime::<Utc>::MAX_UTC);
        let mut found: Vec<Interval> = self
            .intervals
            .range(..=bound)
            .rev()
            .take_while(|iv| iv.end >= window.start)
            .copied()
            .collect();
        found.reverse();
        found
    }
}
