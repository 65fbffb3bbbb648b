//! Per-series state shared by the ingestion task and subscribers.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use super::subscription::{BarEvent, Delivery, EventKind, SubscribeOptions, SubscriptionId};
use crate::domain::{Bar, SeriesKey, UtcDateTime};

pub(crate) struct SubscriberSlot {
    options: SubscribeOptions,
    sender: Option<mpsc::Sender<Delivery>>,
    lag: Arc<AtomicU64>,
    /// Set once catch-up has been taken; live events go to ready slots only.
    ready: bool,
}

impl SubscriberSlot {
    pub(crate) fn new(
        options: SubscribeOptions,
        sender: mpsc::Sender<Delivery>,
        lag: Arc<AtomicU64>,
    ) -> Self {
        Self {
            options,
            sender: Some(sender),
            lag,
            ready: false,
        }
    }

    fn deliver(&self, series: &SeriesKey, event: BarEvent) {
        let Some(sender) = &self.sender else {
            return;
        };

        let owed = self.lag.swap(0, Ordering::AcqRel);
        if owed > 0 {
            match sender.try_send(Delivery::Lagged(owed)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.lag.fetch_add(owed + 1, Ordering::AcqRel);
                    return;
                }
                Err(TrySendError::Closed(_)) => return,
            }
        }

        match sender.try_send(Delivery::Event(event)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                if self.lag.fetch_add(1, Ordering::AcqRel) == 0 {
                    warn!(series = %series, "subscriber queue full, dropping events");
                }
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

/// Ring of recent closed bars plus the subscribers fed from it.
pub(crate) struct SeriesState {
    series: SeriesKey,
    ring: VecDeque<Bar>,
    capacity: usize,
    last_open: Option<UtcDateTime>,
    subscribers: HashMap<SubscriptionId, SubscriberSlot>,
}

impl SeriesState {
    pub(crate) fn new(series: SeriesKey) -> Self {
        Self {
            series,
            ring: VecDeque::new(),
            capacity: 1,
            last_open: None,
            subscribers: HashMap::new(),
        }
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn len(&self) -> usize {
        self.ring.len()
    }

    pub(crate) fn oldest_open(&self) -> Option<UtcDateTime> {
        self.ring.front().map(|bar| bar.open_time)
    }

    /// Up to `count` most recent bars, oldest first.
    pub(crate) fn recent(&self, count: usize) -> Vec<Bar> {
        let skip = self.ring.len().saturating_sub(count);
        self.ring.iter().skip(skip).cloned().collect()
    }

    pub(crate) fn insert(&mut self, id: SubscriptionId, slot: SubscriberSlot) {
        self.subscribers.insert(id, slot);
        self.resize();
    }

    pub(crate) fn remove(&mut self, id: SubscriptionId) -> bool {
        let removed = self.subscribers.remove(&id).is_some();
        if removed {
            self.resize();
        }
        removed
    }

    /// Marks the slot ready and returns its catch-up replay.
    pub(crate) fn activate(&mut self, id: SubscriptionId) -> VecDeque<BarEvent> {
        let Some(slot) = self.subscribers.get_mut(&id) else {
            return VecDeque::new();
        };
        slot.ready = true;
        let options = slot.options;

        let count = options.catch_up.min(self.ring.len());
        let first = self.ring.len() - count;
        (first..self.ring.len())
            .map(|index| BarEvent {
                kind: EventKind::CatchUp,
                bar: self.ring[index].clone(),
                window: window_ending_at(&self.ring, index, options),
            })
            .collect()
    }

    /// Adds history older than anything in the ring.
    pub(crate) fn prepend(&mut self, history: Vec<Bar>) {
        let oldest = self.oldest_open();
        let mut older = history
            .into_iter()
            .filter(|bar| oldest.map_or(true, |oldest| bar.open_time < oldest))
            .collect::<Vec<_>>();
        older.sort_by_key(|bar| bar.open_time);
        older.dedup_by_key(|bar| bar.open_time);

        if self.last_open.is_none() {
            self.last_open = older.last().map(|bar| bar.open_time);
        }
        for bar in older.into_iter().rev() {
            self.ring.push_front(bar);
        }
        self.trim();
    }

    /// Appends a newly closed bar and fans it out to ready subscribers.
    pub(crate) fn ingest(&mut self, bar: Bar) {
        if self.last_open.is_some_and(|last| bar.open_time <= last) {
            debug!(
                series = %self.series,
                open_time = %bar.open_time,
                "dropping out-of-order bar"
            );
            return;
        }

        self.last_open = Some(bar.open_time);
        self.ring.push_back(bar);
        self.trim();

        let Some(newest) = self.ring.len().checked_sub(1) else {
            return;
        };
        let mut windows: HashMap<usize, Arc<[Bar]>> = HashMap::new();
        for slot in self.subscribers.values().filter(|slot| slot.ready) {
            let window = slot.options.send_with_memory.then(|| {
                Arc::clone(windows.entry(slot.options.memory).or_insert_with(|| {
                    window_slice(&self.ring, newest, slot.options.memory)
                }))
            });
            slot.deliver(
                &self.series,
                BarEvent {
                    kind: EventKind::Live,
                    bar: self.ring[newest].clone(),
                    window,
                },
            );
        }
    }

    /// Drops every sender so subscribers observe the end of the stream.
    pub(crate) fn close(&mut self) {
        for slot in self.subscribers.values_mut() {
            slot.sender = None;
        }
    }

    fn resize(&mut self) {
        self.capacity = self
            .subscribers
            .values()
            .map(|slot| slot.options.history_depth().max(1))
            .max()
            .unwrap_or(1);
        self.trim();
    }

    fn trim(&mut self) {
        while self.ring.len() > self.capacity {
            self.ring.pop_front();
        }
    }
}

fn window_ending_at(
    ring: &VecDeque<Bar>,
    index: usize,
    options: SubscribeOptions,
) -> Option<Arc<[Bar]>> {
    options
        .send_with_memory
        .then(|| window_slice(ring, index, options.memory))
}

fn window_slice(ring: &VecDeque<Bar>, index: usize, memory: usize) -> Arc<[Bar]> {
    let start = (index + 1).saturating_sub(memory);
    ring.range(start..=index).cloned().collect()
}
