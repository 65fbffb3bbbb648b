//! # Domain Models
//!
//! Value types shared by every layer of the market-data subsystem.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`TimeFrame`] | Bar duration (`m5`, `h1`, `d1`, `mn1`) |
//! | [`SeriesKey`] | Exchange / area / symbol / timeframe identity |
//! | [`Bar`] | Validated OHLCV record |
//! | [`TimeRange`] | Half-open `[start, end)` interval |
//! | [`Symbol`] | Normalized instrument symbol |
//! | [`UtcDateTime`] | UTC timestamp |
//!
//! All types validate their invariants at construction time and are
//! immutable values once built.

mod bar;
mod range;
mod series;
mod symbol;
mod timeframe;
mod timestamp;

pub use bar::Bar;
pub use range::TimeRange;
pub(crate) use series::normalize_identifier;
pub use series::SeriesKey;
pub use symbol::Symbol;
pub use timeframe::{TimeFrame, TimeFrameBucket, TimeUnit};
pub use timestamp::UtcDateTime;
