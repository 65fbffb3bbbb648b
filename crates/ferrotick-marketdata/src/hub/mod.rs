//! Live subscriptions with catch-up replay and rolling windows.
//!
//! One upstream feed and one ingestion task exist per subscribed series.
//! The feed is opened by the first subscriber and torn down with the last.
//! Subscriber queues are bounded; a slow subscriber loses events and is
//! told so with [`MarketDataError::SubscriberLagging`] instead of stalling
//! the feed.

mod series;
mod subscription;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::chunk::ChunkKey;
use crate::domain::{Bar, SeriesKey, TimeRange, UtcDateTime};
use crate::tier::TierError;
use crate::MarketDataError;

use series::{SeriesState, SubscriberSlot};
pub use subscription::{BarEvent, EventKind, SubscribeOptions, Subscription, SubscriptionId};

/// Boxed future returned by [`HistorySource::recent_bars`].
pub type HistoryFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<Bar>, MarketDataError>> + Send + 'a>>;

/// Source of closed bars for backfilling a series before live data.
pub trait HistorySource: Send + Sync {
    /// Up to `count` most recent bars opening before `before`, oldest first.
    fn recent_bars<'a>(
        &'a self,
        series: &'a SeriesKey,
        before: UtcDateTime,
        count: usize,
    ) -> HistoryFuture<'a>;

    /// Protects cached chunks backing `range` from eviction.
    fn pin(&self, _series: &SeriesKey, _range: TimeRange) -> Vec<ChunkKey> {
        Vec::new()
    }

    fn unpin(&self, _keys: &[ChunkKey]) {}
}

/// Upstream of newly closed bars for a series.
pub trait LiveFeedSource: Send + Sync {
    /// Opens the feed; the stream ends when the sender side is dropped.
    fn open(&self, series: &SeriesKey) -> Result<mpsc::Receiver<Bar>, TierError>;
}

struct SeriesFeed {
    state: Arc<Mutex<SeriesState>>,
    task: JoinHandle<()>,
    pinned: Vec<ChunkKey>,
}

pub(crate) struct HubInner {
    live: Arc<dyn LiveFeedSource>,
    history: Arc<dyn HistorySource>,
    queue_capacity: usize,
    feeds: Mutex<HashMap<SeriesKey, SeriesFeed>>,
}

impl HubInner {
    fn feeds(&self) -> MutexGuard<'_, HashMap<SeriesKey, SeriesFeed>> {
        self.feeds
            .lock()
            .expect("subscription hub series map should not be poisoned")
    }

    /// Adds a not-yet-ready slot, opening the feed if needed.
    fn register(
        &self,
        series: &SeriesKey,
        id: SubscriptionId,
        slot: SubscriberSlot,
    ) -> Result<Arc<Mutex<SeriesState>>, MarketDataError> {
        let mut feeds = self.feeds();
        let state = match feeds.get_mut(series) {
            Some(feed) => {
                if feed.task.is_finished() {
                    info!(series = %series, "reopening ended live feed");
                    let bars = self.live.open(series)?;
                    feed.task = spawn_ingestion(series.clone(), Arc::clone(&feed.state), bars);
                }
                Arc::clone(&feed.state)
            }
            None => {
                let bars = self.live.open(series)?;
                let state = Arc::new(Mutex::new(SeriesState::new(series.clone())));
                let task = spawn_ingestion(series.clone(), Arc::clone(&state), bars);
                info!(series = %series, "opened live feed");
                feeds.insert(
                    series.clone(),
                    SeriesFeed {
                        state: Arc::clone(&state),
                        task,
                        pinned: Vec::new(),
                    },
                );
                state
            }
        };

        lock_state(&state).insert(id, slot);
        Ok(state)
    }

    pub(crate) fn unregister(&self, series: &SeriesKey, id: SubscriptionId) {
        let mut feeds = self.feeds();
        let Some(feed) = feeds.get(series) else {
            return;
        };

        let remaining = {
            let mut state = lock_state(&feed.state);
            if !state.remove(id) {
                return;
            }
            state.subscriber_count()
        };
        debug!(series = %series, subscription = %id, remaining, "unsubscribed");

        if remaining == 0 {
            if let Some(feed) = feeds.remove(series) {
                feed.task.abort();
                self.history.unpin(&feed.pinned);
                info!(series = %series, "closed live feed");
            }
        }
    }

    fn record_pins(&self, series: &SeriesKey, keys: Vec<ChunkKey>) {
        if keys.is_empty() {
            return;
        }
        let mut feeds = self.feeds();
        match feeds.get_mut(series) {
            Some(feed) => feed.pinned.extend(keys),
            None => self.history.unpin(&keys),
        }
    }
}

impl Drop for HubInner {
    fn drop(&mut self) {
        let feeds = self
            .feeds
            .get_mut()
            .expect("subscription hub series map should not be poisoned");
        for feed in feeds.values() {
            feed.task.abort();
        }
    }
}

/// Fans live bars out to subscribers, one upstream feed per series.
#[derive(Clone)]
pub struct SubscriptionHub {
    inner: Arc<HubInner>,
}

impl std::fmt::Debug for SubscriptionHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHub")
            .field("queue_capacity", &self.inner.queue_capacity)
            .field("active_series", &self.active_series())
            .finish()
    }
}

impl SubscriptionHub {
    pub fn new(
        live: Arc<dyn LiveFeedSource>,
        history: Arc<dyn HistorySource>,
        queue_capacity: usize,
    ) -> Self {
        Self {
            inner: Arc::new(HubInner {
                live,
                history,
                queue_capacity: queue_capacity.max(1),
                feeds: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Subscribes to `series`.
    ///
    /// The returned handle already holds the catch-up replay. Dropping this
    /// future before it completes abandons any history backfill and leaves
    /// no subscriber behind.
    pub async fn subscribe(
        &self,
        series: &SeriesKey,
        options: SubscribeOptions,
    ) -> Result<Subscription, MarketDataError> {
        let id = SubscriptionId::new();
        let (sender, receiver) = mpsc::channel(self.inner.queue_capacity);
        let lag = Arc::new(AtomicU64::new(0));

        let state = self.inner.register(
            series,
            id,
            SubscriberSlot::new(options, sender, Arc::clone(&lag)),
        )?;
        let mut registration = Registration {
            hub: Arc::clone(&self.inner),
            series: series.clone(),
            id,
            armed: true,
        };

        let depth = options.history_depth();
        let (held, oldest) = {
            let state = lock_state(&state);
            (state.len(), state.oldest_open())
        };
        if held < depth {
            let before =
                oldest.unwrap_or_else(|| series.timeframe().floor(UtcDateTime::now()));
            let history = self
                .inner
                .history
                .recent_bars(series, before, depth - held)
                .await?;
            debug!(series = %series, bars = history.len(), "backfilled history");

            if let (Some(first), Some(last)) = (history.first(), history.last()) {
                let end = series.timeframe().next_open(last.open_time);
                if let Some(range) = TimeRange::spanning(first.open_time, end) {
                    let keys = self.inner.history.pin(series, range);
                    self.inner.record_pins(series, keys);
                }
                lock_state(&state).prepend(history);
            }
        }

        let pending = lock_state(&state).activate(id);
        registration.armed = false;

        Ok(Subscription {
            id,
            series: series.clone(),
            options,
            pending,
            receiver,
            lag,
            released: AtomicBool::new(false),
            hub: Arc::clone(&self.inner),
        })
    }

    /// Stops delivery to `subscription`. Idempotent.
    pub fn unsubscribe(&self, subscription: &Subscription) {
        subscription.unsubscribe();
    }

    /// Up to `count` most recent bars held for `series`, oldest first.
    pub fn recent(&self, series: &SeriesKey, count: usize) -> Vec<Bar> {
        self.inner
            .feeds()
            .get(series)
            .map(|feed| lock_state(&feed.state).recent(count))
            .unwrap_or_default()
    }

    pub fn active_series(&self) -> Vec<SeriesKey> {
        let mut series = self.inner.feeds().keys().cloned().collect::<Vec<_>>();
        series.sort();
        series
    }

    pub fn subscriber_count(&self, series: &SeriesKey) -> usize {
        self.inner
            .feeds()
            .get(series)
            .map_or(0, |feed| lock_state(&feed.state).subscriber_count())
    }
}

/// Unregisters a subscriber whose subscribe future was dropped or failed.
struct Registration {
    hub: Arc<HubInner>,
    series: SeriesKey,
    id: SubscriptionId,
    armed: bool,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.armed {
            self.hub.unregister(&self.series, self.id);
        }
    }
}

fn spawn_ingestion(
    series: SeriesKey,
    state: Arc<Mutex<SeriesState>>,
    mut bars: mpsc::Receiver<Bar>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(bar) = bars.recv().await {
            lock_state(&state).ingest(bar);
        }
        info!(series = %series, "live feed ended");
        lock_state(&state).close();
    })
}

fn lock_state(state: &Mutex<SeriesState>) -> MutexGuard<'_, SeriesState> {
    state
        .lock()
        .expect("series state mutex should not be poisoned")
}

