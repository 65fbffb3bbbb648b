//! Behavior-driven tests for historical resolution through the tier cascade
//!
//! These tests verify HOW a resolver walks its tiers: which tier serves a
//! request, what gets written back up, and how concurrent or failing
//! requests are reported.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ferrotick_marketdata::{
    Availability, Bar, ChunkDescriptor, DataTier, HistoricalFeed, MarketDataConfig,
    MarketDataError, MarketDataResolver, MemoryTier, ResolveOptions, RetryConfig, SeriesKey,
    TierError, TierFuture, TierKind, TimeRange, UtcDateTime,
};

const HOUR: i64 = 3_600;

fn ts(value: &str) -> UtcDateTime {
    UtcDateTime::parse(value).expect("valid timestamp")
}

fn range(start: &str, end: &str) -> TimeRange {
    TimeRange::new(ts(start), ts(end)).expect("valid range")
}

fn btc_hourly() -> SeriesKey {
    SeriesKey::parse("binance", "spot", "BTCUSDT", "h1").expect("valid series")
}

fn hourly_bars(range: TimeRange, skip: Option<TimeRange>) -> Vec<Bar> {
    let mut bars = Vec::new();
    let mut cursor = range.start().unix_seconds();
    while cursor < range.end().unix_seconds() {
        let open_time = UtcDateTime::from_unix_seconds(cursor).expect("valid timestamp");
        if !skip.is_some_and(|hole| hole.contains(open_time)) {
            bars.push(Bar::new(open_time, 100.0, 101.0, 99.0, 100.5, 10.0).expect("valid bar"));
        }
        cursor += HOUR;
    }
    bars
}

/// Upstream feed that synthesises hourly bars and counts every call.
#[derive(Default)]
struct CountingFeed {
    calls: AtomicUsize,
    requested: Mutex<Vec<TimeRange>>,
    delay: Option<Duration>,
    hole: Option<TimeRange>,
    rejection: Option<TierError>,
}

impl CountingFeed {
    fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    fn with_hole(hole: TimeRange) -> Self {
        Self {
            hole: Some(hole),
            ..Self::default()
        }
    }

    fn failing() -> Self {
        Self::rejecting(TierError::unavailable("upstream connection refused"))
    }

    fn rejecting(error: TierError) -> Self {
        Self {
            rejection: Some(error),
            ..Self::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn requested(&self) -> Vec<TimeRange> {
        self.requested.lock().expect("requested ranges lock").clone()
    }
}

impl HistoricalFeed for CountingFeed {
    fn fetch_bars<'a>(
        &'a self,
        _series: &'a SeriesKey,
        range: TimeRange,
    ) -> TierFuture<'a, Vec<Bar>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requested.lock().expect("requested ranges lock").push(range);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(error) = &self.rejection {
                return Err(error.clone());
            }
            Ok(hourly_bars(range, self.hole))
        })
    }

    fn availability<'a>(&'a self, chunk: &'a ChunkDescriptor) -> TierFuture<'a, Availability> {
        let availability = match self.hole.and_then(|hole| hole.intersect(&chunk.range())) {
            Some(absent) => Availability::Partial(vec![absent]),
            None => Availability::Full,
        };
        Box::pin(async move { Ok(availability) })
    }
}

/// Disk tier holding one day of hourly bars except for a hole.
struct HoledDisk {
    day: TimeRange,
    hole: TimeRange,
    fetched: Mutex<Vec<TimeRange>>,
    written: Mutex<Vec<TimeRange>>,
}

impl HoledDisk {
    fn new(day: TimeRange, hole: TimeRange) -> Self {
        Self {
            day,
            hole,
            fetched: Mutex::new(Vec::new()),
            written: Mutex::new(Vec::new()),
        }
    }
}

impl DataTier for HoledDisk {
    fn kind(&self) -> TierKind {
        TierKind::Disk
    }

    fn probe<'a>(&'a self, chunk: &'a ChunkDescriptor) -> TierFuture<'a, Availability> {
        let availability = if chunk.range() == self.day {
            Availability::Partial(vec![self.hole])
        } else {
            Availability::None
        };
        Box::pin(async move { Ok(availability) })
    }

    fn fetch<'a>(&'a self, _series: &'a SeriesKey, range: TimeRange) -> TierFuture<'a, Vec<Bar>> {
        Box::pin(async move {
            self.fetched.lock().expect("fetched lock").push(range);
            Ok(hourly_bars(range, Some(self.hole)))
        })
    }

    fn put<'a>(
        &'a self,
        _chunk: &'a ChunkDescriptor,
        range: TimeRange,
        _bars: &'a [Bar],
    ) -> TierFuture<'a, ()> {
        Box::pin(async move {
            self.written.lock().expect("written lock").push(range);
            Ok(())
        })
    }
}

fn resolver_with_network(feed: Arc<CountingFeed>, memory: MemoryTier) -> MarketDataResolver {
    MarketDataResolver::builder(MarketDataConfig::default())
        .memory_tier(memory)
        .network_feed(feed)
        .build()
        .expect("resolver should build")
}

// =============================================================================
// Cascade: Planning
// =============================================================================

#[test]
fn when_hourly_range_fits_in_one_day_plan_returns_one_aligned_chunk() {
    // Given: A resolver with the default day-sized intraday chunks
    let resolver = MarketDataResolver::builder(MarketDataConfig::default())
        .build()
        .expect("resolver should build");

    // When: Six hours of h1 bars are planned
    let chunks = resolver
        .plan(
            &btc_hourly(),
            ts("2024-01-01T00:00:00Z"),
            ts("2024-01-01T06:00:00Z"),
        )
        .expect("plan should succeed");

    // Then: One whole-day chunk is returned with the requested part recorded
    assert_eq!(chunks.len(), 1);
    assert_eq!(
        chunks[0].range(),
        range("2024-01-01T00:00:00Z", "2024-01-02T00:00:00Z")
    );
    assert_eq!(
        chunks[0].requested(),
        range("2024-01-01T00:00:00Z", "2024-01-01T06:00:00Z")
    );
}

#[tokio::test]
async fn when_range_is_inverted_resolution_fails_before_touching_tiers() {
    // Given: A resolver backed by a counting network feed
    let feed = Arc::new(CountingFeed::default());
    let resolver = resolver_with_network(Arc::clone(&feed), MemoryTier::default());

    // When: End is before start
    let result = resolver
        .resolve_series(
            &btc_hourly(),
            ts("2024-01-02T00:00:00Z"),
            ts("2024-01-01T00:00:00Z"),
        )
        .await;

    // Then: InvalidRange is returned and no tier was asked
    assert!(matches!(result, Err(MarketDataError::InvalidRange { .. })));
    assert_eq!(feed.calls(), 0);
}

// =============================================================================
// Cascade: Single-Flight
// =============================================================================

#[tokio::test]
async fn when_many_callers_request_the_same_chunk_upstream_is_called_once() {
    // Given: A slow network feed so every caller overlaps
    let feed = Arc::new(CountingFeed::slow(Duration::from_millis(50)));
    let resolver = resolver_with_network(Arc::clone(&feed), MemoryTier::default());

    // When: Eight tasks resolve the same six hours concurrently
    let mut handles = Vec::new();
    for _ in 0..8 {
        let resolver = resolver.clone();
        handles.push(tokio::spawn(async move {
            resolver
                .resolve_series(
                    &btc_hourly(),
                    ts("2024-01-01T00:00:00Z"),
                    ts("2024-01-01T06:00:00Z"),
                )
                .await
        }));
    }

    // Then: Everyone gets the same bars from a single upstream fetch
    for handle in handles {
        let resolved = handle
            .await
            .expect("task should not panic")
            .expect("resolution should succeed");
        assert_eq!(resolved.bars.len(), 6);
        assert!(resolved.is_complete());
    }
    assert_eq!(feed.calls(), 1, "upstream should be fetched exactly once");
}

// =============================================================================
// Cascade: Write-Through
// =============================================================================

#[tokio::test]
async fn when_network_serves_a_chunk_it_is_written_through_to_memory() {
    // Given: An empty memory tier in front of a network feed
    let memory = MemoryTier::default();
    let feed = Arc::new(CountingFeed::default());
    let resolver = resolver_with_network(Arc::clone(&feed), memory.clone());

    // When: The same range is resolved twice
    let first = resolver
        .resolve_series(
            &btc_hourly(),
            ts("2024-01-01T00:00:00Z"),
            ts("2024-01-01T12:00:00Z"),
        )
        .await
        .expect("first resolution should succeed");
    let second = resolver
        .resolve_series(
            &btc_hourly(),
            ts("2024-01-01T03:00:00Z"),
            ts("2024-01-01T09:00:00Z"),
        )
        .await
        .expect("second resolution should succeed");

    // Then: Memory now holds the chunk and served the second request
    assert_eq!(first.bars.len(), 12);
    assert_eq!(second.bars.len(), 6);
    assert_eq!(second.bars[0].open_time, ts("2024-01-01T03:00:00Z"));
    assert_eq!(memory.len(), 1);
    assert_eq!(feed.calls(), 1, "second request should not reach the network");
}

#[tokio::test]
async fn when_disk_holds_part_of_a_chunk_only_the_missing_part_goes_upstream() {
    // Given: A disk tier missing 06:00-12:00 of the day
    let day = range("2024-01-01T00:00:00Z", "2024-01-02T00:00:00Z");
    let hole = range("2024-01-01T06:00:00Z", "2024-01-01T12:00:00Z");
    let disk = Arc::new(HoledDisk::new(day, hole));
    let feed = Arc::new(CountingFeed::default());
    let resolver = MarketDataResolver::builder(MarketDataConfig::default())
        .tier(Arc::clone(&disk) as Arc<dyn DataTier>)
        .network_feed(Arc::clone(&feed) as Arc<dyn HistoricalFeed>)
        .build()
        .expect("resolver should build");

    // When: The whole day is resolved
    let resolved = resolver
        .resolve_series(&btc_hourly(), day.start(), day.end())
        .await
        .expect("resolution should succeed");

    // Then: Disk served what it had, network served only the hole
    assert_eq!(resolved.bars.len(), 24);
    assert!(resolved.is_complete());
    assert_eq!(feed.requested(), vec![hole]);
    assert_eq!(
        *disk.fetched.lock().expect("fetched lock"),
        vec![
            range("2024-01-01T00:00:00Z", "2024-01-01T06:00:00Z"),
            range("2024-01-01T12:00:00Z", "2024-01-02T00:00:00Z"),
        ]
    );

    // And: The hole was written back to the disk tier
    assert_eq!(*disk.written.lock().expect("written lock"), vec![hole]);
}

// =============================================================================
// Cascade: Failures and Gaps
// =============================================================================

#[tokio::test]
async fn when_upstream_keeps_failing_retries_are_bounded_and_source_is_unavailable() {
    // Given: A network feed that always refuses, with two fast retries
    let feed = Arc::new(CountingFeed::failing());
    let mut config = MarketDataConfig::default();
    config.network.retry = RetryConfig::fixed(Duration::from_millis(1), 2);
    let resolver = MarketDataResolver::builder(config)
        .network_feed(Arc::clone(&feed) as Arc<dyn HistoricalFeed>)
        .build()
        .expect("resolver should build");

    // When: A range is resolved
    let result = resolver
        .resolve_series(
            &btc_hourly(),
            ts("2024-01-01T00:00:00Z"),
            ts("2024-01-01T06:00:00Z"),
        )
        .await;

    // Then: SourceUnavailable names the network tier after 1 + 2 attempts
    match result {
        Err(MarketDataError::SourceUnavailable { tier, series, .. }) => {
            assert_eq!(tier, TierKind::Network);
            assert_eq!(series, btc_hourly());
        }
        other => panic!("expected SourceUnavailable, got {other:?}"),
    }
    assert_eq!(feed.calls(), 3);
}

#[tokio::test]
async fn when_upstream_rejects_the_request_the_failure_is_fatal_not_skippable() {
    // Given: An exchange feed that rejects every request outright
    let feed = Arc::new(CountingFeed::rejecting(TierError::invalid_request(
        "api key rejected",
    )));
    let resolver = MarketDataResolver::builder(MarketDataConfig::default())
        .exchange_feed(Arc::clone(&feed) as Arc<dyn HistoricalFeed>)
        .build()
        .expect("resolver should build");

    // When: A range is resolved
    let error = resolver
        .resolve_series(
            &btc_hourly(),
            ts("2024-01-01T00:00:00Z"),
            ts("2024-01-01T06:00:00Z"),
        )
        .await
        .expect_err("rejected request should fail");

    // Then: The rejection is reported against the exchange tier without retries
    match &error {
        MarketDataError::SourceUnavailable { tier, message, .. } => {
            assert_eq!(*tier, TierKind::Exchange);
            assert!(message.contains("api key rejected"));
        }
        other => panic!("expected SourceUnavailable, got {other:?}"),
    }
    assert!(error.is_fatal());
    assert!(!error.is_skippable());
    assert_eq!(feed.calls(), 1);
}

#[tokio::test]
async fn when_a_shared_fetch_fails_every_waiter_receives_the_same_error() {
    // Given: A slow network feed that always refuses and is never retried
    let feed = Arc::new(CountingFeed {
        delay: Some(Duration::from_millis(50)),
        ..CountingFeed::failing()
    });
    let mut config = MarketDataConfig::default();
    config.network.retry = RetryConfig::no_retry();
    let resolver = MarketDataResolver::builder(config)
        .network_feed(Arc::clone(&feed) as Arc<dyn HistoricalFeed>)
        .build()
        .expect("resolver should build");

    // When: Six tasks resolve the same range concurrently
    let mut handles = Vec::new();
    for _ in 0..6 {
        let resolver = resolver.clone();
        handles.push(tokio::spawn(async move {
            resolver
                .resolve_series(
                    &btc_hourly(),
                    ts("2024-01-01T00:00:00Z"),
                    ts("2024-01-01T06:00:00Z"),
                )
                .await
        }));
    }
    let mut errors = Vec::new();
    for handle in handles {
        errors.push(
            handle
                .await
                .expect("task should not panic")
                .expect_err("resolution should fail"),
        );
    }

    // Then: One upstream call produced one failure shared by every caller
    assert_eq!(feed.calls(), 1);
    assert!(matches!(
        errors[0],
        MarketDataError::SourceUnavailable {
            tier: TierKind::Network,
            ..
        }
    ));
    assert!(errors.iter().all(|error| error == &errors[0]));
}

#[tokio::test]
async fn when_no_tier_has_a_range_partial_data_depends_on_accept_partial() {
    // Given: The only upstream lacks 06:00-12:00
    let hole = range("2024-01-01T06:00:00Z", "2024-01-01T12:00:00Z");
    let feed = Arc::new(CountingFeed::with_hole(hole));
    let resolver = resolver_with_network(Arc::clone(&feed), MemoryTier::default());
    let start = ts("2024-01-01T00:00:00Z");
    let end = ts("2024-01-02T00:00:00Z");

    // When: The day is resolved without accepting partial data
    let strict = resolver.resolve_series(&btc_hourly(), start, end).await;

    // Then: PartialData lists the hole and what was available
    match strict {
        Err(MarketDataError::PartialData {
            missing, available, ..
        }) => {
            assert_eq!(missing, vec![hole]);
            assert_eq!(available, 18);
        }
        other => panic!("expected PartialData, got {other:?}"),
    }

    // When: The same day is resolved accepting partial data
    let lenient = resolver
        .resolve_series_with(
            &btc_hourly(),
            start,
            end,
            ResolveOptions {
                accept_partial: true,
            },
        )
        .await
        .expect("partial data should be accepted");

    // Then: Bars are returned ascending with the hole reported as a gap
    assert_eq!(lenient.bars.len(), 18);
    assert_eq!(lenient.gaps, vec![hole]);
    assert!(lenient
        .bars
        .windows(2)
        .all(|pair| pair[0].open_time < pair[1].open_time));
}

#[tokio::test]
async fn when_no_tier_has_any_bar_resolution_reports_not_found() {
    // Given: A resolver with only an empty memory tier
    let resolver = MarketDataResolver::builder(MarketDataConfig::default())
        .build()
        .expect("resolver should build");

    // When: A range is resolved
    let result = resolver
        .resolve_series(
            &btc_hourly(),
            ts("2024-01-01T00:00:00Z"),
            ts("2024-01-01T06:00:00Z"),
        )
        .await;

    // Then: NotFound is returned and is skippable for batch drivers
    let error = result.expect_err("nothing should be found");
    assert!(matches!(error, MarketDataError::NotFound { .. }));
    assert!(error.is_skippable());
}
