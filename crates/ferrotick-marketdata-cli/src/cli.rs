//! CLI argument definitions for `ferrotick-md`.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `plan` | Print the chunks a range resolves through |
//! | `resolve` | Resolve bars through the memory and disk tiers |
//! | `bind` | Bind a processor declaration to concrete series |
//!
//! # Examples
//!
//! ```bash
//! ferrotick-md plan binance spot BTCUSDT --timeframe h1 \
//!     --start 2024-01-01T00:00:00Z --end 2024-01-01T06:00:00Z
//!
//! ferrotick-md resolve binance spot BTCUSDT --timeframe d1 \
//!     --start 2024-01-01T00:00:00Z --end 2024-02-01T00:00:00Z --accept-partial --pretty
//!
//! ferrotick-md bind ./crossover.json
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Market-data resolution tooling for ferrotick.
#[derive(Debug, Parser)]
#[command(
    name = "ferrotick-md",
    author,
    version,
    about = "Inspect chunk plans, resolve cached bars and bind processor inputs"
)]
pub struct Cli {
    /// JSON configuration file. Defaults apply when omitted.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Pretty-print JSON output with indentation.
    #[arg(long, global = true, default_value_t = false)]
    pub pretty: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the aligned chunks covering a range.
    ///
    /// # Examples
    ///
    ///   ferrotick-md plan binance spot BTCUSDT --timeframe m5 --start 2024-01-01T00:00:00Z --end 2024-01-03T00:00:00Z
    Plan(SeriesRangeArgs),

    /// Resolve bars from the in-memory and DuckDB tiers.
    ///
    /// Exits with code 3 when the range is only partially covered.
    Resolve(ResolveArgs),

    /// Bind a processor declaration read from a JSON file.
    Bind(BindArgs),
}

/// A series plus a half-open time range.
#[derive(Debug, Clone, Args)]
pub struct SeriesRangeArgs {
    pub exchange: String,

    /// Market area, e.g. spot or futures.
    pub area: String,

    pub symbol: String,

    /// Bar duration such as m5, h1, d1, w1 or mn1.
    #[arg(long, default_value = "d1")]
    pub timeframe: String,

    /// Inclusive start, RFC3339 UTC.
    #[arg(long)]
    pub start: String,

    /// Exclusive end, RFC3339 UTC.
    #[arg(long)]
    pub end: String,
}

#[derive(Debug, Args)]
pub struct ResolveArgs {
    #[command(flatten)]
    pub range: SeriesRangeArgs,

    /// Print what was found instead of failing on gaps.
    #[arg(long, default_value_t = false)]
    pub accept_partial: bool,
}

#[derive(Debug, Args)]
pub struct BindArgs {
    /// Path to a processor declaration JSON file.
    pub declaration: PathBuf,
}
