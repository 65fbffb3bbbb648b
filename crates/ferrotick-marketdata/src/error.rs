use thiserror::Error;

use crate::domain::{SeriesKey, TimeRange, UtcDateTime};
use crate::tier::{TierError, TierKind};

/// Validation errors raised while constructing value types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("symbol cannot be empty")]
    EmptySymbol,
    #[error("symbol length {len} exceeds max {max}")]
    SymbolTooLong { len: usize, max: usize },
    #[error("symbol contains invalid character '{ch}' at index {index}")]
    SymbolInvalidChar { ch: char, index: usize },
    #[error("symbol '{symbol}' is not listed on {exchange}:{area}")]
    UnknownSymbol {
        exchange: String,
        area: String,
        symbol: String,
    },

    #[error("{field} cannot be empty")]
    EmptyIdentifier { field: &'static str },
    #[error("{field} contains invalid characters: '{value}'")]
    InvalidIdentifier { field: &'static str, value: String },

    #[error("invalid timeframe '{value}', expected <unit><multiplier> such as m5, h1, d1, w1, mn1")]
    InvalidTimeFrame { value: String },
    #[error("invalid range: end {end} must be after start {start}")]
    InvalidRange {
        start: UtcDateTime,
        end: UtcDateTime,
    },

    #[error("timestamp must be RFC3339 UTC (suffix Z): '{value}'")]
    TimestampNotUtc { value: String },
    #[error("unix timestamp {seconds} is out of range")]
    TimestampOutOfRange { seconds: i64 },

    #[error("field '{field}' must be finite")]
    NonFiniteValue { field: &'static str },
    #[error("field '{field}' must be non-negative")]
    NegativeValue { field: &'static str },
    #[error("bar high must be >= low")]
    InvalidBarRange,
    #[error("bar open/close must be within high/low range")]
    InvalidBarBounds,

    #[error("processor '{processor}' declaration is invalid: {reason}")]
    InvalidDeclaration { processor: String, reason: String },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

/// Why a single input slot could not be bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedSlot {
    pub name: String,
    pub reason: String,
}

/// Errors returned by resolution, subscription and binding operations.
///
/// Every variant is `Clone` so a single in-flight fetch can hand the same
/// failure to all of its waiters.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MarketDataError {
    #[error("invalid range: end {end} must be after start {start}")]
    InvalidRange {
        start: UtcDateTime,
        end: UtcDateTime,
    },

    #[error("invalid timeframe '{value}'")]
    InvalidTimeFrame { value: String },

    #[error("no tier could supply data for {series} in {range}")]
    NotFound { series: SeriesKey, range: TimeRange },

    #[error("{series}: {} range(s) unavailable after exhausting all tiers ({available} bar(s) available)", .missing.len())]
    PartialData {
        series: SeriesKey,
        missing: Vec<TimeRange>,
        available: usize,
    },

    #[error("{tier} tier unavailable for {series}: {message}")]
    SourceUnavailable {
        series: SeriesKey,
        tier: TierKind,
        message: String,
    },

    #[error("processor '{processor}' has unresolved input slot(s): {}", describe_slots(.slots))]
    UnresolvedInputSlot {
        processor: String,
        slots: Vec<UnresolvedSlot>,
    },

    #[error("subscriber for {series} is lagging, {missed} event(s) dropped")]
    SubscriberLagging { series: SeriesKey, missed: u64 },

    #[error(transparent)]
    Validation(ValidationError),

    #[error(transparent)]
    Tier(#[from] TierError),
}

impl MarketDataError {
    /// Errors a driver can treat as "skip this symbol".
    pub const fn is_skippable(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::PartialData { .. })
    }

    /// Errors that should abort an optimization or backtest run.
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::UnresolvedInputSlot { .. } | Self::SourceUnavailable { .. }
        )
    }
}

impl From<ValidationError> for MarketDataError {
    fn from(error: ValidationError) -> Self {
        match error {
            ValidationError::InvalidRange { start, end } => Self::InvalidRange { start, end },
            ValidationError::InvalidTimeFrame { value } => Self::InvalidTimeFrame { value },
            other => Self::Validation(other),
        }
    }
}

fn describe_slots(slots: &[UnresolvedSlot]) -> String {
    slots
        .iter()
        .map(|slot| format!("'{}' ({})", slot.name, slot.reason))
        .collect::<Vec<_>>()
        .join(", ")
}
