//! # Ferrotick Market Data
//!
//! Time-series market-data resolution and subscription for Ferrotick.
//!
//! ## Overview
//!
//! Given an exchange, area, symbol and timeframe this crate produces bars by
//! cascading through tiered sources, caching results in the faster tiers on
//! the way back. Live subscribers get a catch-up replay followed by one event
//! per newly closed bar. Processor input declarations are bound to concrete
//! series before a processor runs.
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`domain`] | Value types (TimeFrame, SeriesKey, Bar, TimeRange) |
//! | [`chunk`] | Calendar-aligned chunk planning |
//! | [`tier`] | Tier contract plus memory, DuckDB and upstream tiers |
//! | [`cascade`] | Tiered resolution with write-through |
//! | [`singleflight`] | Deduplication of concurrent chunk fetches |
//! | [`hub`] | Live subscriptions, catch-up and rolling windows |
//! | [`binder`] | Processor input slot binding |
//! | [`registry`] | Processor declaration registry |
//! | [`resolver`] | Facade over all of the above |
//! | [`config`] | JSON configuration |
//! | [`retry`] | Backoff and retry policy |
//! | [`error`] | Error types |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ferrotick_marketdata::{MarketDataConfig, MarketDataResolver, SeriesKey, UtcDateTime};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let resolver = MarketDataResolver::builder(MarketDataConfig::default())
//!         .warehouse()
//!         .exchange_feed(my_exchange_feed())
//!         .build()?;
//!
//!     let series = SeriesKey::parse("binance", "spot", "BTCUSDT", "h1")?;
//!     let resolved = resolver
//!         .resolve_series(
//!             &series,
//!             UtcDateTime::parse("2024-01-01T00:00:00Z")?,
//!             UtcDateTime::parse("2024-01-02T00:00:00Z")?,
//!         )
//!         .await?;
//!
//!     println!("{} bars", resolved.bars.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Error Handling
//!
//! ```rust
//! use ferrotick_marketdata::MarketDataError;
//!
//! fn should_abort(error: &MarketDataError) -> bool {
//!     if error.is_skippable() {
//!         // No data for this symbol; move on to the next one.
//!         return false;
//!     }
//!     error.is_fatal()
//! }
//! ```

pub mod binder;
pub mod cascade;
pub mod chunk;
pub mod config;
pub mod domain;
pub mod error;
pub mod hub;
pub mod registry;
pub mod resolver;
pub mod retry;
pub mod singleflight;
pub mod tier;

// Binding
pub use binder::{
    BoundInput, BoundInputs, InputDeclaration, InputKind, InputSlotBinder, KnownSymbols,
    PriceField, ProcessorDeclaration, SymbolNormalizer, UppercaseNormalizer,
};

// Cascade
pub use cascade::{ChunkData, ResolveOptions, ResolvedSeries, TieredDataSource};

// Chunk planning
pub use chunk::{
    Chunk, ChunkDescriptor, ChunkKey, ChunkRangeProvider, ChunkSizePolicy, ChunkSpan, Completeness,
};

// Configuration
pub use config::MarketDataConfig;

// Domain models
pub use domain::{Bar, SeriesKey, Symbol, TimeFrame, TimeFrameBucket, TimeRange, TimeUnit, UtcDateTime};

// Error types
pub use error::{MarketDataError, UnresolvedSlot, ValidationError};

// Subscriptions
pub use hub::{
    BarEvent, EventKind, HistoryFuture, HistorySource, LiveFeedSource, SubscribeOptions,
    Subscription, SubscriptionHub, SubscriptionId,
};

// Registry
pub use registry::ProcessorRegistry;

// Facade
pub use resolver::{MarketDataResolver, MarketDataResolverBuilder};

// Retry logic
pub use retry::{Backoff, RetryConfig};

// Single-flight
pub use singleflight::SingleFlight;

// Tiers
pub use tier::{
    Availability, DataTier, EntryStats, EvictionPolicy, HistoricalFeed, LruEviction, MemoryTier,
    NoEviction, RateBudget, TierError, TierErrorKind, TierFuture, TierKind, TtlEviction,
    UpstreamConfig, UpstreamTier, WarehouseTier, WarehouseTierConfig,
};
