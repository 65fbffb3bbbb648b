//! Source tiers of the resolution cascade.
//!
//! Every tier implements [`DataTier`]: it can report what it holds for a
//! chunk, fetch bars for a sub-range, and (unless it is read-only) accept
//! bars written through from slower tiers.
//!
//! | Tier | Type | Writable |
//! |------|------|----------|
//! | Memory | [`MemoryTier`] | yes |
//! | Disk | [`WarehouseTier`] | yes |
//! | Network | [`UpstreamTier`] | no |
//! | Exchange | [`UpstreamTier`] | no |

mod duckdb;
mod memory;
mod throttling;
mod upstream;
mod warehouse;

use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::chunk::ChunkDescriptor;
use crate::domain::{Bar, SeriesKey, TimeRange};
use crate::ValidationError;

pub use memory::{EntryStats, EvictionPolicy, LruEviction, MemoryTier, NoEviction, TtlEviction};
pub use throttling::RateBudget;
pub use upstream::{HistoricalFeed, UpstreamConfig, UpstreamTier};
pub use warehouse::{WarehouseTier, WarehouseTierConfig};

/// Boxed future returned by tier operations.
pub type TierFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TierError>> + Send + 'a>>;

/// Position of a tier in the cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierKind {
    Memory,
    Disk,
    Network,
    Exchange,
}

impl TierKind {
    /// Fastest first.
    pub const DEFAULT_ORDER: [Self; 4] = [Self::Memory, Self::Disk, Self::Network, Self::Exchange];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Disk => "disk",
            Self::Network => "network",
            Self::Exchange => "exchange",
        }
    }
}

impl Display for TierKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TierKind {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "disk" => Ok(Self::Disk),
            "network" => Ok(Self::Network),
            "exchange" => Ok(Self::Exchange),
            other => Err(ValidationError::InvalidConfig {
                reason: format!("unknown tier '{other}'"),
            }),
        }
    }
}

/// What a tier holds for one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Full,
    /// The tier holds the chunk except for the listed sub-ranges.
    Partial(Vec<TimeRange>),
    None,
}

/// Tier-level error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierErrorKind {
    NotFound,
    Unavailable,
    Timeout,
    RateLimited,
    /// Retries against an upstream were used up.
    Exhausted,
    InvalidRequest,
    Storage,
    Internal,
}

/// Structured tier error used by cascade fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierError {
    kind: TierErrorKind,
    message: String,
    retryable: bool,
}

impl TierError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(TierErrorKind::NotFound, message, false)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(TierErrorKind::Unavailable, message, true)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TierErrorKind::Timeout, message, true)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(TierErrorKind::RateLimited, message, true)
    }

    pub fn exhausted(message: impl Into<String>) -> Self {
        Self::new(TierErrorKind::Exhausted, message, false)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(TierErrorKind::InvalidRequest, message, false)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(TierErrorKind::Storage, message, false)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(TierErrorKind::Internal, message, false)
    }

    fn new(kind: TierErrorKind, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable,
        }
    }

    pub const fn kind(&self) -> TierErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn retryable(&self) -> bool {
        self.retryable
    }

    pub const fn code(&self) -> &'static str {
        match self.kind {
            TierErrorKind::NotFound => "tier.not_found",
            TierErrorKind::Unavailable => "tier.unavailable",
            TierErrorKind::Timeout => "tier.timeout",
            TierErrorKind::RateLimited => "tier.rate_limited",
            TierErrorKind::Exhausted => "tier.exhausted",
            TierErrorKind::InvalidRequest => "tier.invalid_request",
            TierErrorKind::Storage => "tier.storage",
            TierErrorKind::Internal => "tier.internal",
        }
    }
}

impl Display for TierError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code())
    }
}

impl std::error::Error for TierError {}

/// Source tier contract.
///
/// Implementations must be `Send + Sync`; the cascade shares them across
/// tasks and calls them concurrently for unrelated chunks.
pub trait DataTier: Send + Sync {
    fn kind(&self) -> TierKind;

    /// Reports what this tier can supply for `chunk` without fetching bars.
    fn probe<'a>(&'a self, chunk: &'a ChunkDescriptor) -> TierFuture<'a, Availability>;

    /// Fetches bars with open time inside `range`, ascending.
    fn fetch<'a>(&'a self, series: &'a SeriesKey, range: TimeRange) -> TierFuture<'a, Vec<Bar>>;

    /// Stores bars obtained from a slower tier and marks `range` as covered.
    fn put<'a>(
        &'a self,
        chunk: &'a ChunkDescriptor,
        range: TimeRange,
        bars: &'a [Bar],
    ) -> TierFuture<'a, ()>;

    /// Read-only tiers are skipped as write-through targets.
    fn accepts_writes(&self) -> bool {
        true
    }
}
