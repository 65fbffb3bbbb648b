//! Behavior-driven tests for live subscriptions
//!
//! These tests verify HOW subscribers are served: catch-up replay, rolling
//! windows, feed sharing and teardown, and what a slow subscriber sees.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ferrotick_marketdata::{
    Bar, EventKind, HistoricalFeed, HistoryFuture, HistorySource, LiveFeedSource,
    MarketDataConfig, MarketDataError, MarketDataResolver, SeriesKey, SubscribeOptions,
    Subscription, SubscriptionHub, TierError, TierFuture, TimeRange, UtcDateTime,
};
use tokio::sync::mpsc;

const BASE: i64 = 1_704_067_200; // 2024-01-01T00:00:00Z
const HOUR: i64 = 3_600;

fn series() -> SeriesKey {
    SeriesKey::parse("binance", "spot", "BTCUSDT", "h1").expect("valid series")
}

fn bar(index: i64) -> Bar {
    let open_time = UtcDateTime::from_unix_seconds(BASE + index * HOUR).expect("valid timestamp");
    let price = 100.0 + index as f64;
    Bar::new(open_time, price, price + 1.0, price - 1.0, price, 1.0).expect("valid bar")
}

/// Live source handing out a fresh channel per open and counting opens.
#[derive(Default)]
struct FakeLive {
    opens: AtomicUsize,
    senders: Mutex<Vec<mpsc::Sender<Bar>>>,
}

impl FakeLive {
    fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn latest(&self) -> mpsc::Sender<Bar> {
        self.senders
            .lock()
            .expect("senders lock")
            .last()
            .cloned()
            .expect("feed should have been opened")
    }

    async fn push(&self, bars: impl IntoIterator<Item = Bar>) {
        let sender = self.latest();
        for bar in bars {
            sender.send(bar).await.expect("ingestion should be running");
        }
    }
}

impl LiveFeedSource for FakeLive {
    fn open(&self, _series: &SeriesKey) -> Result<mpsc::Receiver<Bar>, TierError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = mpsc::channel(64);
        self.senders.lock().expect("senders lock").push(sender);
        Ok(receiver)
    }
}

/// History holding bars `0..len`, optionally slow to answer.
#[derive(Default)]
struct FakeHistory {
    len: i64,
    delay: Option<Duration>,
}

impl FakeHistory {
    fn with_bars(len: i64) -> Self {
        Self { len, delay: None }
    }
}

impl HistorySource for FakeHistory {
    fn recent_bars<'a>(
        &'a self,
        _series: &'a SeriesKey,
        before: UtcDateTime,
        count: usize,
    ) -> HistoryFuture<'a> {
        Box::pin(async move {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let mut bars = (0..self.len)
                .map(bar)
                .filter(|bar| bar.open_time < before)
                .collect::<Vec<_>>();
            let skip = bars.len().saturating_sub(count);
            bars.drain(..skip);
            Ok(bars)
        })
    }
}

fn hub(live: &Arc<FakeLive>, history: FakeHistory, queue_capacity: usize) -> SubscriptionHub {
    SubscriptionHub::new(
        Arc::clone(live) as Arc<dyn LiveFeedSource>,
        Arc::new(history),
        queue_capacity,
    )
}

async fn next_event(subscription: &mut Subscription) -> ferrotick_marketdata::BarEvent {
    tokio::time::timeout(Duration::from_secs(1), subscription.recv())
        .await
        .expect("event should arrive in time")
        .expect("subscription should be open")
        .expect("event should not be an error")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached in time");
}

// =============================================================================
// Subscriptions: Catch-Up Replay
// =============================================================================

#[tokio::test]
async fn when_subscribing_with_catch_up_thirty_bars_replay_then_live_bars_follow() {
    // Given: A hub whose history holds 100 closed bars
    let live = Arc::new(FakeLive::default());
    let hub = hub(&live, FakeHistory::with_bars(100), 16);

    // When: A subscriber asks for 30 bars of catch-up and no memory
    let mut subscription = hub
        .subscribe(&series(), SubscribeOptions::catch_up(30))
        .await
        .expect("subscribe should succeed");

    // Then: Exactly the 30 most recent bars are replayed, oldest first
    assert_eq!(subscription.pending_catch_up(), 30);
    for index in 70..100 {
        let event = next_event(&mut subscription).await;
        assert_eq!(event.kind, EventKind::CatchUp);
        assert_eq!(event.bar, bar(index));
        assert!(event.window.is_none());
    }

    // And: Each later event carries exactly one new bar
    live.push([bar(100), bar(101)]).await;
    for index in 100..102 {
        let event = next_event(&mut subscription).await;
        assert_eq!(event.kind, EventKind::Live);
        assert_eq!(event.bar, bar(index));
        assert!(event.window.is_none());
    }
}

#[tokio::test]
async fn when_history_is_shorter_than_catch_up_everything_available_is_replayed() {
    // Given: Only ten closed bars exist
    let live = Arc::new(FakeLive::default());
    let hub = hub(&live, FakeHistory::with_bars(10), 16);

    // When: Thirty are requested
    let mut subscription = hub
        .subscribe(&series(), SubscribeOptions::catch_up(30))
        .await
        .expect("subscribe should succeed");

    // Then: The ten available bars are replayed
    assert_eq!(subscription.pending_catch_up(), 10);
    assert_eq!(next_event(&mut subscription).await.bar, bar(0));
}

#[tokio::test]
async fn when_memory_is_requested_each_event_carries_a_bounded_window() {
    // Given: No history and a subscriber keeping a three-bar window
    let live = Arc::new(FakeLive::default());
    let hub = hub(&live, FakeHistory::default(), 16);
    let mut subscription = hub
        .subscribe(
            &series(),
            SubscribeOptions::catch_up(0)
                .with_memory(3)
                .sending_memory(true),
        )
        .await
        .expect("subscribe should succeed");

    // When: Five live bars arrive
    live.push((0..5).map(bar)).await;

    // Then: Window length is min(bars seen, 3) and ends with the event's bar
    for (index, expected_len) in [(0, 1), (1, 2), (2, 3), (3, 3), (4, 3)] {
        let event = next_event(&mut subscription).await;
        let window = event.window.expect("window should be attached");
        assert_eq!(window.len(), expected_len);
        assert_eq!(window.last(), Some(&bar(index)));
        assert!(window
            .windows(2)
            .all(|pair| pair[0].open_time < pair[1].open_time));
    }
}

#[tokio::test]
async fn when_bars_arrive_out_of_order_stale_bars_are_dropped() {
    // Given: A live subscriber
    let live = Arc::new(FakeLive::default());
    let hub = hub(&live, FakeHistory::default(), 16);
    let mut subscription = hub
        .subscribe(&series(), SubscribeOptions::default())
        .await
        .expect("subscribe should succeed");

    // When: An older bar arrives between two newer ones
    live.push([bar(5), bar(3), bar(6)]).await;

    // Then: Only strictly increasing open times are delivered
    assert_eq!(next_event(&mut subscription).await.bar, bar(5));
    assert_eq!(next_event(&mut subscription).await.bar, bar(6));
}

// =============================================================================
// Subscriptions: Feed Sharing and Teardown
// =============================================================================

#[tokio::test]
async fn when_last_subscriber_leaves_the_feed_is_torn_down_and_reopened_cold() {
    // Given: Two subscribers to the same series
    let live = Arc::new(FakeLive::default());
    let hub = hub(&live, FakeHistory::default(), 16);
    let first = hub
        .subscribe(&series(), SubscribeOptions::default())
        .await
        .expect("first subscribe should succeed");
    let second = hub
        .subscribe(&series(), SubscribeOptions::default())
        .await
        .expect("second subscribe should succeed");

    // Then: They share one upstream feed
    assert_eq!(live.opens(), 1);
    assert_eq!(hub.subscriber_count(&series()), 2);

    // When: Both unsubscribe
    hub.unsubscribe(&first);
    assert_eq!(hub.active_series(), vec![series()]);
    drop(second);

    // Then: The series is released
    assert!(hub.active_series().is_empty());
    assert_eq!(hub.subscriber_count(&series()), 0);
    let released = live.latest();
    wait_until(|| released.is_closed()).await;

    // When: Someone subscribes again
    let _third = hub
        .subscribe(&series(), SubscribeOptions::default())
        .await
        .expect("third subscribe should succeed");

    // Then: A fresh feed is opened
    assert_eq!(live.opens(), 2);
}

#[tokio::test]
async fn when_subscribe_is_abandoned_during_backfill_no_subscriber_remains() {
    // Given: History that takes far longer than the caller waits
    let live = Arc::new(FakeLive::default());
    let history = FakeHistory {
        len: 100,
        delay: Some(Duration::from_secs(5)),
    };
    let hub = hub(&live, history, 16);

    // When: The subscribe future is dropped mid-backfill
    let result = tokio::time::timeout(
        Duration::from_millis(20),
        hub.subscribe(&series(), SubscribeOptions::catch_up(10)),
    )
    .await;

    // Then: Nothing is left registered for the series
    assert!(result.is_err(), "subscribe should not have completed");
    assert_eq!(hub.subscriber_count(&series()), 0);
    assert!(hub.active_series().is_empty());
}

#[tokio::test]
async fn when_unsubscribed_no_further_events_are_delivered() {
    // Given: A subscriber with a live bar already queued
    let live = Arc::new(FakeLive::default());
    let hub = hub(&live, FakeHistory::default(), 16);
    let mut subscription = hub
        .subscribe(&series(), SubscribeOptions::default())
        .await
        .expect("subscribe should succeed");
    live.push([bar(0)]).await;
    wait_until(|| hub.recent(&series(), 1).len() == 1).await;

    // When: It unsubscribes twice
    subscription.unsubscribe();
    hub.unsubscribe(&subscription);

    // Then: recv reports the end of the stream
    assert!(subscription.is_released());
    assert!(subscription.recv().await.is_none());
    assert_eq!(hub.subscriber_count(&series()), 0);
}

// =============================================================================
// Subscriptions: Slow Consumers
// =============================================================================

#[tokio::test]
async fn when_a_subscriber_falls_behind_it_is_told_once_then_resumes() {
    // Given: A subscriber with a two-slot queue that is not reading
    let live = Arc::new(FakeLive::default());
    let hub = hub(&live, FakeHistory::default(), 2);
    let options = SubscribeOptions {
        catch_up: 0,
        memory: 10,
        send_with_memory: false,
    };
    let mut subscription = hub
        .subscribe(&series(), options)
        .await
        .expect("subscribe should succeed");

    // When: Five bars are published
    live.push((0..5).map(bar)).await;
    wait_until(|| hub.recent(&series(), 10).len() == 5).await;

    // Then: The queued bars arrive, then a single lagging signal
    assert_eq!(next_event(&mut subscription).await.bar, bar(0));
    assert_eq!(next_event(&mut subscription).await.bar, bar(1));
    match subscription.recv().await {
        Some(Err(MarketDataError::SubscriberLagging { missed, series: lagging })) => {
            assert_eq!(missed, 3);
            assert_eq!(lagging, series());
        }
        other => panic!("expected SubscriberLagging, got {other:?}"),
    }

    // And: Delivery resumes with the next bar
    live.push([bar(5)]).await;
    assert_eq!(next_event(&mut subscription).await.bar, bar(5));
}

// =============================================================================
// Subscriptions: Through the Resolver
// =============================================================================

/// Network feed producing hourly bars for any range.
struct HourlyFeed;

impl HistoricalFeed for HourlyFeed {
    fn fetch_bars<'a>(
        &'a self,
        _series: &'a SeriesKey,
        range: TimeRange,
    ) -> TierFuture<'a, Vec<Bar>> {
        Box::pin(async move {
            let mut bars = Vec::new();
            let mut cursor = range.start().unix_seconds();
            while cursor < range.end().unix_seconds() {
                let open_time = UtcDateTime::from_unix_seconds(cursor)
                    .map_err(|error| TierError::internal(error.to_string()))?;
                bars.push(
                    Bar::new(open_time, 1.0, 1.0, 1.0, 1.0, 1.0)
                        .map_err(|error| TierError::internal(error.to_string()))?,
                );
                cursor += HOUR;
            }
            Ok(bars)
        })
    }
}

#[tokio::test]
async fn when_subscribing_through_the_resolver_catch_up_comes_from_the_cascade() {
    // Given: A resolver with a network history feed and a live feed
    let live = Arc::new(FakeLive::default());
    let resolver = MarketDataResolver::builder(MarketDataConfig::default())
        .network_feed(Arc::new(HourlyFeed))
        .live_feed(Arc::clone(&live) as Arc<dyn LiveFeedSource>)
        .build()
        .expect("resolver should build");

    // When: A subscriber asks for five bars of catch-up
    let mut subscription = resolver
        .subscribe(&series(), SubscribeOptions::catch_up(5))
        .await
        .expect("subscribe should succeed");

    // Then: Five consecutive closed hourly bars are replayed
    let mut replayed = Vec::new();
    for _ in 0..5 {
        let event = next_event(&mut subscription).await;
        assert_eq!(event.kind, EventKind::CatchUp);
        replayed.push(event.bar.open_time.unix_seconds());
    }
    assert!(replayed.windows(2).all(|pair| pair[1] - pair[0] == HOUR));
    assert_eq!(live.opens(), 1);

    // And: Unsubscribing through the facade releases the series
    resolver.unsubscribe(&subscription);
    assert!(resolver.hub().active_series().is_empty());
}
