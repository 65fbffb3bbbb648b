//! In-memory chunk cache, the fastest tier of the cascade.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tracing::debug;

use super::{Availability, DataTier, TierFuture, TierKind};
use crate::chunk::{Chunk, ChunkDescriptor, ChunkKey, Completeness};
use crate::domain::{Bar, SeriesKey, TimeRange, UtcDateTime};

/// Snapshot of one cache entry handed to an [`EvictionPolicy`].
#[derive(Debug, Clone)]
pub struct EntryStats {
    pub key: ChunkKey,
    pub bar_count: usize,
    pub inserted_at: Instant,
    pub last_access: Instant,
    pub pinned: bool,
}

/// Decides which cache entries to drop after each insertion.
///
/// Pinned entries are never removed, whatever the policy returns.
pub trait EvictionPolicy: Send + Sync + Debug {
    fn select_victims(&self, entries: &[EntryStats], now: Instant) -> Vec<ChunkKey>;
}

/// Keeps every entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEviction;

impl EvictionPolicy for NoEviction {
    fn select_victims(&self, _entries: &[EntryStats], _now: Instant) -> Vec<ChunkKey> {
        Vec::new()
    }
}

/// Keeps at most `max_entries` unpinned entries, dropping the least recently
/// used. Pinned entries do not count toward the limit.
#[derive(Debug, Clone, Copy)]
pub struct LruEviction {
    pub max_entries: usize,
}

impl EvictionPolicy for LruEviction {
    fn select_victims(&self, entries: &[EntryStats], _now: Instant) -> Vec<ChunkKey> {
        let mut candidates = entries
            .iter()
            .filter(|entry| !entry.pinned)
            .collect::<Vec<_>>();
        let excess = candidates.len().saturating_sub(self.max_entries);
        if excess == 0 {
            return Vec::new();
        }

        candidates.sort_by_key(|entry| entry.last_access);
        candidates
            .into_iter()
            .take(excess)
            .map(|entry| entry.key.clone())
            .collect()
    }
}

/// Drops unpinned entries older than `ttl`.
#[derive(Debug, Clone, Copy)]
pub struct TtlEviction {
    pub ttl: Duration,
}

impl EvictionPolicy for TtlEviction {
    fn select_victims(&self, entries: &[EntryStats], now: Instant) -> Vec<ChunkKey> {
        entries
            .iter()
            .filter(|entry| !entry.pinned)
            .filter(|entry| now.saturating_duration_since(entry.inserted_at) > self.ttl)
            .map(|entry| entry.key.clone())
            .collect()
    }
}

#[derive(Debug)]
struct CacheEntry {
    chunk: Chunk,
    inserted_at: Instant,
    last_access: Instant,
}

#[derive(Debug, Default)]
struct MemoryInner {
    series: HashMap<SeriesKey, BTreeMap<UtcDateTime, CacheEntry>>,
    pins: HashMap<ChunkKey, u32>,
}

impl MemoryInner {
    fn entry(&self, key: &ChunkKey) -> Option<&CacheEntry> {
        self.series.get(key.series())?.get(&key.range().start())
    }

    fn len(&self) -> usize {
        self.series.values().map(BTreeMap::len).sum()
    }

    fn stats(&self) -> Vec<EntryStats> {
        self.series
            .values()
            .flat_map(BTreeMap::values)
            .map(|entry| EntryStats {
                key: entry.chunk.key().clone(),
                bar_count: entry.chunk.len(),
                inserted_at: entry.inserted_at,
                last_access: entry.last_access,
                pinned: self.pins.contains_key(entry.chunk.key()),
            })
            .collect()
    }

    fn remove(&mut self, key: &ChunkKey) -> bool {
        let Some(entries) = self.series.get_mut(key.series()) else {
            return false;
        };
        let removed = entries.remove(&key.range().start()).is_some();
        if entries.is_empty() {
            self.series.remove(key.series());
        }
        removed
    }
}

/// Thread-safe in-memory chunk cache with pinning and pluggable eviction.
#[derive(Debug, Clone)]
pub struct MemoryTier {
    inner: Arc<RwLock<MemoryInner>>,
    policy: Arc<dyn EvictionPolicy>,
}

impl Default for MemoryTier {
    fn default() -> Self {
        Self::new(Arc::new(NoEviction))
    }
}

impl MemoryTier {
    pub fn new(policy: Arc<dyn EvictionPolicy>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(MemoryInner::default())),
            policy,
        }
    }

    /// Number of cached chunks.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &ChunkKey) -> bool {
        self.read().entry(key).is_some()
    }

    /// Protects `key` from eviction until a matching [`MemoryTier::unpin`].
    ///
    /// A key may be pinned before its chunk is cached.
    pub fn pin(&self, key: &ChunkKey) {
        let mut inner = self.write();
        *inner.pins.entry(key.clone()).or_insert(0) += 1;
    }

    pub fn unpin(&self, key: &ChunkKey) {
        let mut inner = self.write();
        if let Some(count) = inner.pins.get_mut(key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                inner.pins.remove(key);
            }
        }
    }

    pub fn is_pinned(&self, key: &ChunkKey) -> bool {
        self.read().pins.contains_key(key)
    }

    /// Applies the eviction policy immediately.
    pub fn evict(&self) -> usize {
        let mut inner = self.write();
        self.evict_locked(&mut inner)
    }

    pub fn clear(&self) {
        let mut inner = self.write();
        let pins = std::mem::take(&mut inner.pins);
        inner.series.retain(|_, entries| {
            entries.retain(|_, entry| pins.contains_key(entry.chunk.key()));
            !entries.is_empty()
        });
        inner.pins = pins;
    }

    fn evict_locked(&self, inner: &mut MemoryInner) -> usize {
        let victims = self.policy.select_victims(&inner.stats(), Instant::now());
        let mut evicted = 0;
        for key in victims {
            if inner.pins.contains_key(&key) {
                continue;
            }
            if inner.remove(&key) {
                debug!(chunk = %key.range(), series = %key.series(), "evicted cached chunk");
                evicted += 1;
            }
        }
        evicted
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, MemoryInner> {
        self.inner
            .read()
            .expect("memory tier lock should not be poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, MemoryInner> {
        self.inner
            .write()
            .expect("memory tier lock should not be poisoned")
    }
}

impl DataTier for MemoryTier {
    fn kind(&self) -> TierKind {
        TierKind::Memory
    }

    fn probe<'a>(&'a self, chunk: &'a ChunkDescriptor) -> TierFuture<'a, Availability> {
        Box::pin(async move {
            let inner = self.read();
            let availability = match inner.entry(chunk.key()) {
                None => Availability::None,
                Some(entry) if entry.chunk.covered().is_empty() => Availability::None,
                Some(entry) => match entry.chunk.completeness() {
                    Completeness::Complete => Availability::Full,
                    Completeness::Partial { missing } => Availability::Partial(missing),
                },
            };
            Ok(availability)
        })
    }

    fn fetch<'a>(&'a self, series: &'a SeriesKey, range: TimeRange) -> TierFuture<'a, Vec<Bar>> {
        Box::pin(async move {
            let mut inner = self.write();
            let Some(entries) = inner.series.get_mut(series) else {
                return Ok(Vec::new());
            };

            let now = Instant::now();
            let mut bars = Vec::new();
            for entry in entries.range_mut(..range.end()).map(|(_, entry)| entry) {
                let Some(overlap) = entry.chunk.key().range().intersect(&range) else {
                    continue;
                };
                entry.last_access = now;
                bars.extend(entry.chunk.bars_in(overlap));
            }
            Ok(bars)
        })
    }

    fn put<'a>(
        &'a self,
        chunk: &'a ChunkDescriptor,
        range: TimeRange,
        bars: &'a [Bar],
    ) -> TierFuture<'a, ()> {
        Box::pin(async move {
            let mut inner = self.write();
            let now = Instant::now();
            let entry = inner
                .series
                .entry(chunk.series().clone())
                .or_default()
                .entry(chunk.start())
                .or_insert_with(|| CacheEntry {
                    chunk: Chunk::new(chunk.key().clone()),
                    inserted_at: now,
                    last_access: now,
                });
            entry.chunk.fill(range, bars);
            entry.last_access = now;

            self.evict_locked(&mut inner);
            Ok(())
        })
    }
}
