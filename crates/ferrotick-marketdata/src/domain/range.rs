use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::{UtcDateTime, ValidationError};

/// Half-open time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeRange {
    start: UtcDateTime,
    end: UtcDateTime,
}

impl TimeRange {
    pub fn new(start: UtcDateTime, end: UtcDateTime) -> Result<Self, ValidationError> {
        if end <= start {
            return Err(ValidationError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// Returns `None` for empty or inverted bounds.
    pub fn spanning(start: UtcDateTime, end: UtcDateTime) -> Option<Self> {
        (end > start).then_some(Self { start, end })
    }

    pub const fn start(&self) -> UtcDateTime {
        self.start
    }

    pub const fn end(&self) -> UtcDateTime {
        self.end
    }

    pub fn contains(&self, ts: UtcDateTime) -> bool {
        self.start <= ts && ts < self.end
    }

    pub fn intersect(&self, other: &Self) -> Option<Self> {
        Self::spanning(self.start.max(other.start), self.end.min(other.end))
    }

    /// Sorts and coalesces overlapping or adjacent ranges.
    pub fn merge(ranges: impl IntoIterator<Item = Self>) -> Vec<Self> {
        let mut sorted = ranges.into_iter().collect::<Vec<_>>();
        sorted.sort();

        let mut merged: Vec<Self> = Vec::with_capacity(sorted.len());
        for range in sorted {
            match merged.last_mut() {
                Some(last) if range.start <= last.end => {
                    last.end = last.end.max(range.end);
                }
                _ => merged.push(range),
            }
        }
        merged
    }

    /// Parts of `self` not covered by any of `covered`, in ascending order.
    pub fn subtract(&self, covered: &[Self]) -> Vec<Self> {
        let mut missing = Vec::new();
        let mut cursor = self.start;

        for range in Self::merge(covered.iter().filter_map(|range| range.intersect(self))) {
            if let Some(gap) = Self::spanning(cursor, range.start) {
                missing.push(gap);
            }
            cursor = cursor.max(range.end);
        }

        if let Some(tail) = Self::spanning(cursor, self.end) {
            missing.push(tail);
        }
        missing
    }
}

impl Display for TimeRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}
