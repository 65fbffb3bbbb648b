//! Facade composing the planner, cascade, hub and binder.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::binder::{BoundInputs, InputSlotBinder, ProcessorDeclaration, SymbolNormalizer};
use crate::cascade::{ResolveOptions, ResolvedSeries, TieredDataSource};
use crate::chunk::{ChunkDescriptor, ChunkRangeProvider};
use crate::config::MarketDataConfig;
use crate::domain::{Bar, SeriesKey, UtcDateTime};
use crate::hub::{LiveFeedSource, SubscribeOptions, Subscription, SubscriptionHub};
use crate::registry::ProcessorRegistry;
use crate::tier::{
    DataTier, EvictionPolicy, HistoricalFeed, MemoryTier, NoEviction, TierError, TierKind,
    UpstreamTier, WarehouseTier,
};
use crate::{MarketDataError, ValidationError};

/// Entry point for historical queries, live subscriptions and input binding.
#[derive(Debug, Clone)]
pub struct MarketDataResolver {
    config: MarketDataConfig,
    cascade: TieredDataSource,
    hub: SubscriptionHub,
    binder: InputSlotBinder,
    registry: ProcessorRegistry,
}

impl MarketDataResolver {
    pub fn builder(config: MarketDataConfig) -> MarketDataResolverBuilder {
        MarketDataResolverBuilder::new(config)
    }

    pub fn config(&self) -> &MarketDataConfig {
        &self.config
    }

    pub fn cascade(&self) -> &TieredDataSource {
        &self.cascade
    }

    pub fn hub(&self) -> &SubscriptionHub {
        &self.hub
    }

    pub fn registry(&self) -> &ProcessorRegistry {
        &self.registry
    }

    /// Chunks a resolution of `[start, end)` would touch.
    pub fn plan(
        &self,
        series: &SeriesKey,
        start: UtcDateTime,
        end: UtcDateTime,
    ) -> Result<Vec<ChunkDescriptor>, MarketDataError> {
        Ok(self.cascade.planner().plan(series, start, end)?)
    }

    /// Resolves `[start, end)` with the configured partial-data policy.
    pub async fn resolve_series(
        &self,
        series: &SeriesKey,
        start: UtcDateTime,
        end: UtcDateTime,
    ) -> Result<ResolvedSeries, MarketDataError> {
        let options = ResolveOptions {
            accept_partial: self.config.accept_partial,
        };
        self.resolve_series_with(series, start, end, options).await
    }

    pub async fn resolve_series_with(
        &self,
        series: &SeriesKey,
        start: UtcDateTime,
        end: UtcDateTime,
        options: ResolveOptions,
    ) -> Result<ResolvedSeries, MarketDataError> {
        self.cascade
            .resolve_series(series, start, end, options)
            .await
    }

    pub async fn subscribe(
        &self,
        series: &SeriesKey,
        options: SubscribeOptions,
    ) -> Result<Subscription, MarketDataError> {
        self.hub.subscribe(series, options).await
    }

    pub fn unsubscribe(&self, subscription: &Subscription) {
        self.hub.unsubscribe(subscription);
    }

    pub fn bind_inputs(
        &self,
        declaration: &ProcessorDeclaration,
    ) -> Result<BoundInputs, MarketDataError> {
        self.binder.bind(declaration)
    }

    /// Binds the declaration registered under `processor`.
    pub fn bind_registered(&self, processor: &str) -> Result<BoundInputs, MarketDataError> {
        let declaration =
            self.registry
                .get(processor)
                .ok_or_else(|| ValidationError::InvalidDeclaration {
                    processor: processor.to_owned(),
                    reason: String::from("processor is not registered"),
                })?;
        self.binder.bind(&declaration)
    }
}

/// Assembles a [`MarketDataResolver`] from collaborators and configuration.
pub struct MarketDataResolverBuilder {
    config: MarketDataConfig,
    memory: Option<MemoryTier>,
    eviction: Option<Arc<dyn EvictionPolicy>>,
    custom_tiers: HashMap<TierKind, Arc<dyn DataTier>>,
    network_feed: Option<Arc<dyn HistoricalFeed>>,
    exchange_feed: Option<Arc<dyn HistoricalFeed>>,
    open_warehouse: bool,
    live: Option<Arc<dyn LiveFeedSource>>,
    normalizer: Option<Arc<dyn SymbolNormalizer>>,
    registry: Option<ProcessorRegistry>,
}

impl MarketDataResolverBuilder {
    pub fn new(config: MarketDataConfig) -> Self {
        Self {
            config,
            memory: None,
            eviction: None,
            custom_tiers: HashMap::new(),
            network_feed: None,
            exchange_feed: None,
            open_warehouse: false,
            live: None,
            normalizer: None,
            registry: None,
        }
    }

    /// Shares an existing memory tier instead of creating one.
    pub fn memory_tier(mut self, memory: MemoryTier) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn eviction_policy(mut self, policy: Arc<dyn EvictionPolicy>) -> Self {
        self.eviction = Some(policy);
        self
    }

    /// Uses `tier` for the cascade slot named by its [`DataTier::kind`].
    pub fn tier(mut self, tier: Arc<dyn DataTier>) -> Self {
        self.custom_tiers.insert(tier.kind(), tier);
        self
    }

    /// Opens the `DuckDB` warehouse from the configuration as the disk tier.
    pub fn warehouse(mut self) -> Self {
        self.open_warehouse = true;
        self
    }

    pub fn network_feed(mut self, feed: Arc<dyn HistoricalFeed>) -> Self {
        self.network_feed = Some(feed);
        self
    }

    pub fn exchange_feed(mut self, feed: Arc<dyn HistoricalFeed>) -> Self {
        self.exchange_feed = Some(feed);
        self
    }

    pub fn live_feed(mut self, live: Arc<dyn LiveFeedSource>) -> Self {
        self.live = Some(live);
        self
    }

    pub fn normalizer(mut self, normalizer: Arc<dyn SymbolNormalizer>) -> Self {
        self.normalizer = Some(normalizer);
        self
    }

    pub fn registry(mut self, registry: ProcessorRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(mut self) -> Result<MarketDataResolver, MarketDataError> {
        self.config.validate()?;

        let memory = match self.memory.take() {
            Some(memory) => memory,
            None => MemoryTier::new(self.eviction.take().unwrap_or_else(|| Arc::new(NoEviction))),
        };

        let mut tiers: Vec<Arc<dyn DataTier>> = Vec::new();
        for kind in self.config.tier_order.clone() {
            match self.tier_for(kind, &memory)? {
                Some(tier) => tiers.push(tier),
                None => debug!(tier = %kind, "no implementation configured, skipping tier"),
            }
        }
        for kind in self.custom_tiers.keys() {
            if !self.config.tier_order.contains(kind) {
                warn!(tier = %kind, "tier supplied but absent from tier_order");
            }
        }

        let planner = ChunkRangeProvider::new(self.config.chunk_policy);
        let cascade = TieredDataSource::new(planner, tiers).with_pin_target(memory);

        let live = self.live.unwrap_or_else(|| Arc::new(NoLiveFeed));
        let hub = SubscriptionHub::new(
            live,
            Arc::new(cascade.clone()),
            self.config.subscriber_queue_capacity,
        );

        let binder = match self.normalizer {
            Some(normalizer) => InputSlotBinder::new(normalizer),
            None => InputSlotBinder::default(),
        };

        Ok(MarketDataResolver {
            config: self.config,
            cascade,
            hub,
            binder,
            registry: self.registry.unwrap_or_default(),
        })
    }

    fn tier_for(
        &mut self,
        kind: TierKind,
        memory: &MemoryTier,
    ) -> Result<Option<Arc<dyn DataTier>>, MarketDataError> {
        if let Some(tier) = self.custom_tiers.get(&kind) {
            return Ok(Some(Arc::clone(tier)));
        }

        let tier: Option<Arc<dyn DataTier>> = match kind {
            TierKind::Memory => Some(Arc::new(memory.clone())),
            TierKind::Disk if self.open_warehouse => {
                Some(Arc::new(WarehouseTier::open(&self.config.warehouse)?))
            }
            TierKind::Disk => None,
            TierKind::Network => self.network_feed.take().map(|feed| {
                Arc::new(UpstreamTier::network(feed, self.config.network.clone()))
                    as Arc<dyn DataTier>
            }),
            TierKind::Exchange => self.exchange_feed.take().map(|feed| {
                Arc::new(UpstreamTier::exchange(feed, self.config.exchange.clone()))
                    as Arc<dyn DataTier>
            }),
        };
        Ok(tier)
    }
}

/// Live source used when none is configured; every open fails.
struct NoLiveFeed;

impl LiveFeedSource for NoLiveFeed {
    fn open(&self, series: &SeriesKey) -> Result<mpsc::Receiver<Bar>, TierError> {
        Err(TierError::unavailable(format!(
            "no live feed configured for {series}"
        )))
    }
}
