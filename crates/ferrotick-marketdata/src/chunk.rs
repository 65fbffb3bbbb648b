//! Chunk alignment and planning.
//!
//! A chunk is a calendar-aligned slice of one series. Boundaries only depend
//! on the series timeframe and the [`ChunkSizePolicy`], never on the range a
//! caller asked for, so overlapping requests always land on the same chunks
//! and share cache entries.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::{Bar, SeriesKey, TimeFrame, TimeFrameBucket, TimeRange, UtcDateTime};
use crate::ValidationError;

/// Calendar span of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkSpan {
    Day,
    Month,
    Year,
}

impl ChunkSpan {
    /// Start of the chunk containing `ts`.
    pub fn floor(self, ts: UtcDateTime) -> UtcDateTime {
        match self {
            Self::Day => ts.floor_to_day(),
            Self::Month => UtcDateTime::from_month_index(ts.month_index()),
            Self::Year => {
                let index = ts.month_index();
                UtcDateTime::from_month_index(index - index.rem_euclid(12))
            }
        }
    }

    /// Start of the chunk following the one starting at `aligned`.
    pub fn advance(self, aligned: UtcDateTime) -> UtcDateTime {
        match self {
            Self::Day => UtcDateTime::from_unix_clamped(aligned.unix_seconds() + 86_400),
            Self::Month => UtcDateTime::from_month_index(aligned.month_index() + 1),
            Self::Year => UtcDateTime::from_month_index(aligned.month_index() + 12),
        }
    }

    /// Smallest chunk boundary at or after `ts`.
    pub fn ceil(self, ts: UtcDateTime) -> UtcDateTime {
        let floor = self.floor(ts);
        if floor == ts {
            ts
        } else {
            self.advance(floor)
        }
    }
}

/// Chunk span per timeframe bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkSizePolicy {
    pub intraday: ChunkSpan,
    pub end_of_day: ChunkSpan,
}

impl Default for ChunkSizePolicy {
    fn default() -> Self {
        Self {
            intraday: ChunkSpan::Day,
            end_of_day: ChunkSpan::Month,
        }
    }
}

impl ChunkSizePolicy {
    pub fn span_for(&self, timeframe: TimeFrame) -> ChunkSpan {
        match timeframe.bucket() {
            TimeFrameBucket::Intraday => self.intraday,
            TimeFrameBucket::EndOfDay => self.end_of_day,
        }
    }
}

/// Identity of one chunk: a series plus its aligned bounds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkKey {
    series: SeriesKey,
    range: TimeRange,
}

impl ChunkKey {
    pub fn series(&self) -> &SeriesKey {
        &self.series
    }

    pub fn range(&self) -> TimeRange {
        self.range
    }
}

/// A planned chunk together with the part of it the caller asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDescriptor {
    key: ChunkKey,
    requested: TimeRange,
}

impl ChunkDescriptor {
    pub fn key(&self) -> &ChunkKey {
        &self.key
    }

    pub fn series(&self) -> &SeriesKey {
        &self.key.series
    }

    /// Aligned chunk bounds.
    pub fn range(&self) -> TimeRange {
        self.key.range
    }

    pub fn start(&self) -> UtcDateTime {
        self.key.range.start()
    }

    pub fn end(&self) -> UtcDateTime {
        self.key.range.end()
    }

    /// Requested sub-range, clipped to this chunk.
    pub fn requested(&self) -> TimeRange {
        self.requested
    }
}

/// Pure planner turning a time range into aligned chunk descriptors.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkRangeProvider {
    policy: ChunkSizePolicy,
}

impl ChunkRangeProvider {
    pub fn new(policy: ChunkSizePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> ChunkSizePolicy {
        self.policy
    }

    /// Plans the chunks covering `[start, end)`.
    ///
    /// The first and last chunk may extend past the requested bounds; each
    /// descriptor records the requested part so callers can trim.
    pub fn plan(
        &self,
        series: &SeriesKey,
        start: UtcDateTime,
        end: UtcDateTime,
    ) -> Result<Vec<ChunkDescriptor>, ValidationError> {
        let requested = TimeRange::new(start, end)?;
        let span = self.policy.span_for(series.timeframe());

        let mut chunks = Vec::new();
        let mut cursor = span.floor(start);
        while cursor < end {
            let next = span.advance(cursor);
            let Some(range) = TimeRange::spanning(cursor, next) else {
                // Only reachable at the edge of the representable calendar.
                break;
            };
            if let Some(clipped) = range.intersect(&requested) {
                chunks.push(ChunkDescriptor {
                    key: ChunkKey {
                        series: series.clone(),
                        range,
                    },
                    requested: clipped,
                });
            }
            cursor = next;
        }

        Ok(chunks)
    }
}

/// Whether a chunk holds every bar of its range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completeness {
    Complete,
    Partial { missing: Vec<TimeRange> },
}

/// Bars of one chunk plus the sub-ranges they are known to cover.
///
/// Coverage is tracked separately from bars because an exchange may
/// legitimately have no bars for a covered range.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    key: ChunkKey,
    bars: BTreeMap<UtcDateTime, Bar>,
    covered: Vec<TimeRange>,
}

impl Chunk {
    pub fn new(key: ChunkKey) -> Self {
        Self {
            key,
            bars: BTreeMap::new(),
            covered: Vec::new(),
        }
    }

    pub fn key(&self) -> &ChunkKey {
        &self.key
    }

    /// Merges bars fetched for `range` into the chunk and marks `range` covered.
    pub fn fill(&mut self, range: TimeRange, bars: &[Bar]) {
        let Some(range) = range.intersect(&self.key.range) else {
            return;
        };

        for bar in bars.iter().filter(|bar| range.contains(bar.open_time)) {
            self.bars.insert(bar.open_time, bar.clone());
        }
        self.covered = TimeRange::merge(self.covered.iter().copied().chain([range]));
    }

    pub fn covered(&self) -> &[TimeRange] {
        &self.covered
    }

    pub fn missing(&self) -> Vec<TimeRange> {
        self.key.range.subtract(&self.covered)
    }

    pub fn completeness(&self) -> Completeness {
        let missing = self.missing();
        if missing.is_empty() {
            Completeness::Complete
        } else {
            Completeness::Partial { missing }
        }
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// Bars whose open time falls inside `range`, ascending.
    pub fn bars_in(&self, range: TimeRange) -> Vec<Bar> {
        self.bars
            .range(range.start()..range.end())
            .map(|(_, bar)| bar.clone())
            .collect()
    }
}
