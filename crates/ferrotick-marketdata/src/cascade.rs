//! Resolution of historical series through the ordered tier cascade.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::chunk::{ChunkDescriptor, ChunkKey, ChunkRangeProvider};
use crate::domain::{Bar, SeriesKey, TimeRange, UtcDateTime};
use crate::hub::{HistoryFuture, HistorySource};
use crate::singleflight::SingleFlight;
use crate::tier::{Availability, DataTier, MemoryTier, TierError, TierErrorKind, TierKind};
use crate::MarketDataError;

/// Lookback doublings tried by [`HistorySource::recent_bars`] before giving up.
const MAX_LOOKBACK_ROUNDS: u32 = 6;

/// Per-request resolution options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolveOptions {
    /// Return bars with `gaps` instead of failing with `PartialData`.
    pub accept_partial: bool,
}

/// Bars for a requested range, ascending and unique by open time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedSeries {
    pub series: SeriesKey,
    pub range: TimeRange,
    pub bars: Vec<Bar>,
    /// Sub-ranges no tier could supply.
    pub gaps: Vec<TimeRange>,
}

impl ResolvedSeries {
    pub fn is_complete(&self) -> bool {
        self.gaps.is_empty()
    }
}

/// Outcome of resolving one chunk, shared by every concurrent requester.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkData {
    pub key: ChunkKey,
    pub bars: Vec<Bar>,
    pub missing: Vec<TimeRange>,
}

pub type ChunkOutcome = Result<Arc<ChunkData>, MarketDataError>;

struct CascadeInner {
    planner: ChunkRangeProvider,
    tiers: Vec<Arc<dyn DataTier>>,
    pin_target: Option<MemoryTier>,
    flights: SingleFlight<ChunkKey, ChunkOutcome>,
}

/// Ordered cascade of [`DataTier`]s with write-through and per-chunk
/// single-flight.
#[derive(Clone)]
pub struct TieredDataSource {
    inner: Arc<CascadeInner>,
}

impl std::fmt::Debug for TieredDataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredDataSource")
            .field("planner", &self.inner.planner)
            .field("tiers", &self.tier_kinds())
            .finish_non_exhaustive()
    }
}

impl TieredDataSource {
    /// Tiers are consulted in the given order, fastest first.
    pub fn new(planner: ChunkRangeProvider, tiers: Vec<Arc<dyn DataTier>>) -> Self {
        Self {
            inner: Arc::new(CascadeInner {
                planner,
                tiers,
                pin_target: None,
                flights: SingleFlight::new(),
            }),
        }
    }

    /// Memory tier whose chunks are pinned on behalf of live subscriptions.
    pub fn with_pin_target(self, memory: MemoryTier) -> Self {
        let inner = match Arc::try_unwrap(self.inner) {
            Ok(inner) => CascadeInner {
                pin_target: Some(memory),
                ..inner
            },
            Err(shared) => CascadeInner {
                planner: shared.planner,
                tiers: shared.tiers.clone(),
                pin_target: Some(memory),
                flights: SingleFlight::new(),
            },
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn planner(&self) -> &ChunkRangeProvider {
        &self.inner.planner
    }

    pub fn tier_kinds(&self) -> Vec<TierKind> {
        self.inner.tiers.iter().map(|tier| tier.kind()).collect()
    }

    /// Resolves bars with open time in `[start, end)`.
    pub async fn resolve_series(
        &self,
        series: &SeriesKey,
        start: UtcDateTime,
        end: UtcDateTime,
        options: ResolveOptions,
    ) -> Result<ResolvedSeries, MarketDataError> {
        self.resolve_with(series, start, end, options, FlightMode::Detached)
            .await
    }

    /// Resolves a single planned chunk, sharing the work with concurrent
    /// requests for the same chunk.
    pub async fn resolve_chunk(&self, chunk: &ChunkDescriptor) -> ChunkOutcome {
        self.resolve_chunk_with(chunk, FlightMode::Detached).await
    }

    async fn resolve_with(
        &self,
        series: &SeriesKey,
        start: UtcDateTime,
        end: UtcDateTime,
        options: ResolveOptions,
        mode: FlightMode,
    ) -> Result<ResolvedSeries, MarketDataError> {
        let range = TimeRange::new(start, end)?;
        let chunks = self.inner.planner.plan(series, start, end)?;

        let mut bars: Vec<Bar> = Vec::new();
        let mut gaps = Vec::new();
        for chunk in &chunks {
            let data = self.resolve_chunk_with(chunk, mode).await?;
            let requested = chunk.requested();
            bars.extend(
                data.bars
                    .iter()
                    .filter(|bar| requested.contains(bar.open_time))
                    .cloned(),
            );
            gaps.extend(data.missing.iter().filter_map(|gap| gap.intersect(&requested)));
        }
        bars.dedup_by_key(|bar| bar.open_time);
        let gaps = TimeRange::merge(gaps);

        if bars.is_empty() {
            return Err(MarketDataError::NotFound {
                series: series.clone(),
                range,
            });
        }

        if !gaps.is_empty() && !options.accept_partial {
            return Err(MarketDataError::PartialData {
                series: series.clone(),
                missing: gaps,
                available: bars.len(),
            });
        }

        Ok(ResolvedSeries {
            series: series.clone(),
            range,
            bars,
            gaps,
        })
    }

    async fn resolve_chunk_with(&self, chunk: &ChunkDescriptor, mode: FlightMode) -> ChunkOutcome {
        let inner = Arc::clone(&self.inner);
        let descriptor = chunk.clone();
        let work = move || async move { fetch_chunk(&inner, &descriptor).await.map(Arc::new) };

        match mode {
            FlightMode::Detached => {
                self.inner
                    .flights
                    .run_detached(chunk.key().clone(), work, |reason| {
                        Err(MarketDataError::Tier(TierError::internal(format!(
                            "chunk resolution failed: {reason}"
                        ))))
                    })
                    .await
            }
            FlightMode::Inline => self.inner.flights.run(chunk.key().clone(), work).await,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum FlightMode {
    /// Work runs on its own task and outlives dropped callers.
    Detached,
    /// Work is abandoned with the leading caller.
    Inline,
}

async fn fetch_chunk(
    inner: &CascadeInner,
    chunk: &ChunkDescriptor,
) -> Result<ChunkData, MarketDataError> {
    let timeframe = chunk.series().timeframe();
    let now = UtcDateTime::now();
    let open_bar = timeframe.floor(now);

    // Nothing can exist past the bar that is currently forming.
    let Some(target) = TimeRange::spanning(chunk.start(), chunk.end().min(timeframe.next_open(now)))
    else {
        return Ok(ChunkData {
            key: chunk.key().clone(),
            bars: Vec::new(),
            missing: Vec::new(),
        });
    };

    let mut missing = vec![target];
    let mut bars = BTreeMap::new();
    let mut failure: Option<(TierKind, TierError)> = None;

    for (rank, tier) in inner.tiers.iter().enumerate() {
        if missing.is_empty() {
            break;
        }
        let kind = tier.kind();

        let availability = match tier.probe(chunk).await {
            Ok(availability) => availability,
            Err(error) => {
                note_failure(&mut failure, kind, chunk, error);
                continue;
            }
        };

        let obtainable = match availability {
            Availability::Full => missing.clone(),
            Availability::Partial(absent) => missing
                .iter()
                .flat_map(|range| range.subtract(&absent))
                .collect(),
            Availability::None => Vec::new(),
        };
        if obtainable.is_empty() {
            debug!(tier = %kind, series = %chunk.series(), chunk = %chunk.range(), "tier miss");
            continue;
        }

        let mut obtained = Vec::new();
        for range in obtainable {
            match tier.fetch(chunk.series(), range).await {
                Ok(fetched) => {
                    for bar in fetched.iter().filter(|bar| range.contains(bar.open_time)) {
                        bars.entry(bar.open_time).or_insert_with(|| bar.clone());
                    }
                    obtained.push((range, fetched));
                }
                Err(error) => note_failure(&mut failure, kind, chunk, error),
            }
        }
        if obtained.is_empty() {
            continue;
        }
        debug!(
            tier = %kind,
            series = %chunk.series(),
            chunk = %chunk.range(),
            ranges = obtained.len(),
            "tier hit"
        );

        for (range, fetched) in &obtained {
            let Some(closed) = TimeRange::spanning(range.start(), range.end().min(open_bar)) else {
                continue;
            };
            for upper in inner.tiers[..rank].iter().filter(|tier| tier.accepts_writes()) {
                if let Err(error) = upper.put(chunk, closed, fetched).await {
                    warn!(
                        tier = %upper.kind(),
                        series = %chunk.series(),
                        range = %closed,
                        error = %error,
                        "write-through failed"
                    );
                }
            }
        }

        let fetched_ranges = obtained.iter().map(|(range, _)| *range).collect::<Vec<_>>();
        missing = missing
            .iter()
            .flat_map(|range| range.subtract(&fetched_ranges))
            .collect();
    }

    if !missing.is_empty() {
        if let Some((tier, error)) = failure {
            return Err(MarketDataError::SourceUnavailable {
                series: chunk.series().clone(),
                tier,
                message: error.message().to_owned(),
            });
        }
    }

    Ok(ChunkData {
        key: chunk.key().clone(),
        bars: bars.into_values().collect(),
        missing,
    })
}

/// Keeps the failure reported if ranges are still missing once every tier
/// was tried. An exhausted upstream outranks later failures; a tier that
/// simply has no data is not a failure.
fn note_failure(
    failure: &mut Option<(TierKind, TierError)>,
    kind: TierKind,
    chunk: &ChunkDescriptor,
    error: TierError,
) {
    warn!(
        tier = %kind,
        series = %chunk.series(),
        chunk = %chunk.range(),
        error = %error,
        "tier failed, falling through"
    );
    let outranked = failure
        .as_ref()
        .is_some_and(|(_, kept)| kept.kind() == TierErrorKind::Exhausted);
    if error.kind() != TierErrorKind::NotFound && !outranked {
        *failure = Some((kind, error));
    }
}

impl HistorySource for TieredDataSource {
    fn recent_bars<'a>(
        &'a self,
        series: &'a SeriesKey,
        before: UtcDateTime,
        count: usize,
    ) -> HistoryFuture<'a> {
        Box::pin(async move {
            if count == 0 {
                return Ok(Vec::new());
            }

            let timeframe = series.timeframe();
            let end = timeframe.floor(before);
            let mut span = u32::try_from(count).unwrap_or(u32::MAX);
            let options = ResolveOptions {
                accept_partial: true,
            };

            let mut bars = Vec::new();
            for _ in 0..MAX_LOOKBACK_ROUNDS {
                let start = timeframe.step_back(end, span);
                if start >= end {
                    break;
                }
                match self
                    .resolve_with(series, start, end, options, FlightMode::Inline)
                    .await
                {
                    Ok(resolved) => bars = resolved.bars,
                    Err(MarketDataError::NotFound { .. }) => {}
                    Err(error) => return Err(error),
                }
                if bars.len() >= count {
                    break;
                }
                span = span.saturating_mul(2);
            }

            let skip = bars.len().saturating_sub(count);
            bars.drain(..skip);
            Ok(bars)
        })
    }

    fn pin(&self, series: &SeriesKey, range: TimeRange) -> Vec<ChunkKey> {
        let Some(memory) = &self.inner.pin_target else {
            return Vec::new();
        };
        let Ok(chunks) = self.inner.planner.plan(series, range.start(), range.end()) else {
            return Vec::new();
        };

        chunks
            .into_iter()
            .map(|chunk| {
                memory.pin(chunk.key());
                chunk.key().clone()
            })
            .collect()
    }

    fn unpin(&self, keys: &[ChunkKey]) {
        if let Some(memory) = &self.inner.pin_target {
            for key in keys {
                memory.unpin(key);
            }
        }
    }
}
