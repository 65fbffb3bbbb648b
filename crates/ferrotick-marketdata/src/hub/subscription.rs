use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use uuid::Uuid;

use super::HubInner;
use crate::domain::{Bar, SeriesKey};
use crate::MarketDataError;

/// Unique handle identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for SubscriptionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// What a subscriber wants replayed and attached to each event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscribeOptions {
    /// Closed bars replayed on subscribe, oldest first.
    pub catch_up: usize,
    /// Length of the rolling window kept for this subscriber.
    pub memory: usize,
    /// Attach the rolling window to every event.
    pub send_with_memory: bool,
}

impl SubscribeOptions {
    pub fn catch_up(catch_up: usize) -> Self {
        Self {
            catch_up,
            ..Self::default()
        }
    }

    pub fn with_memory(mut self, memory: usize) -> Self {
        self.memory = memory;
        self
    }

    /// Attaches the rolling window to every delivered event.
    pub fn sending_memory(mut self, send_with_memory: bool) -> Self {
        self.send_with_memory = send_with_memory;
        self
    }

    /// Bars of history the hub must hold for this subscriber.
    pub(crate) fn history_depth(&self) -> usize {
        self.catch_up.max(self.memory)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CatchUp,
    Live,
}

/// One closed bar delivered to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct BarEvent {
    pub kind: EventKind,
    pub bar: Bar,
    /// Up to `memory` most recent bars ending with `bar`, oldest first.
    pub window: Option<Arc<[Bar]>>,
}

/// Item carried by a subscriber queue.
#[derive(Debug)]
pub(crate) enum Delivery {
    Event(BarEvent),
    Lagged(u64),
}

/// Live subscription handle.
///
/// Dropping the handle unsubscribes.
pub struct Subscription {
    pub(crate) id: SubscriptionId,
    pub(crate) series: SeriesKey,
    pub(crate) options: SubscribeOptions,
    pub(crate) pending: VecDeque<BarEvent>,
    pub(crate) receiver: mpsc::Receiver<Delivery>,
    pub(crate) lag: Arc<AtomicU64>,
    pub(crate) released: AtomicBool,
    pub(crate) hub: Arc<HubInner>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("series", &self.series)
            .field("options", &self.options)
            .field("pending", &self.pending.len())
            .field("released", &self.is_released())
            .finish()
    }
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn series(&self) -> &SeriesKey {
        &self.series
    }

    pub fn options(&self) -> SubscribeOptions {
        self.options
    }

    /// Catch-up events not yet received.
    pub fn pending_catch_up(&self) -> usize {
        self.pending.len()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Next event, or `None` once unsubscribed or the live feed has ended.
    ///
    /// After the queue overflowed, the next call returns
    /// [`MarketDataError::SubscriberLagging`] once before events resume.
    pub async fn recv(&mut self) -> Option<Result<BarEvent, MarketDataError>> {
        if self.is_released() {
            return None;
        }
        if let Some(event) = self.pending.pop_front() {
            return Some(Ok(event));
        }

        let delivery = match self.receiver.try_recv() {
            Ok(delivery) => Some(delivery),
            Err(TryRecvError::Empty) => {
                if let Some(lagging) = self.take_lag() {
                    return Some(Err(lagging));
                }
                self.receiver.recv().await
            }
            Err(TryRecvError::Disconnected) => None,
        };

        match delivery {
            Some(Delivery::Event(event)) => Some(Ok(event)),
            Some(Delivery::Lagged(missed)) => Some(Err(self.lagging(missed))),
            None => self.take_lag().map(Err),
        }
    }

    /// Stops delivery. Idempotent; no event is returned after this call.
    pub fn unsubscribe(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.hub.unregister(&self.series, self.id);
    }

    fn take_lag(&self) -> Option<MarketDataError> {
        let missed = self.lag.swap(0, Ordering::AcqRel);
        (missed > 0).then(|| self.lagging(missed))
    }

    fn lagging(&self, missed: u64) -> MarketDataError {
        MarketDataError::SubscriberLagging {
            series: self.series.clone(),
            missed,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
