mod bind;
mod plan;
mod resolve;

use ferrotick_marketdata::{MarketDataConfig, SeriesKey, UtcDateTime};
use serde_json::Value;
use tracing::debug;

use crate::cli::{Cli, Command, SeriesRangeArgs};
use crate::error::CliError;

pub struct CommandReport {
    pub data: Value,
    /// Output is valid but does not cover everything asked for.
    pub incomplete: bool,
}

impl CommandReport {
    pub fn complete(data: Value) -> Self {
        Self {
            data,
            incomplete: false,
        }
    }
}

pub async fn run(cli: &Cli) -> Result<CommandReport, CliError> {
    let config = load_config(cli)?;

    match &cli.command {
        Command::Plan(args) => plan::run(args, &config),
        Command::Resolve(args) => resolve::run(args, config).await,
        Command::Bind(args) => bind::run(args),
    }
}

fn load_config(cli: &Cli) -> Result<MarketDataConfig, CliError> {
    match &cli.config {
        Some(path) => {
            debug!(path = %path.display(), "loading configuration");
            Ok(MarketDataConfig::load(path)?)
        }
        None => Ok(MarketDataConfig::default()),
    }
}

struct ParsedRange {
    series: SeriesKey,
    start: UtcDateTime,
    end: UtcDateTime,
}

fn parse_range(args: &SeriesRangeArgs) -> Result<ParsedRange, CliError> {
    Ok(ParsedRange {
        series: SeriesKey::parse(&args.exchange, &args.area, &args.symbol, &args.timeframe)?,
        start: UtcDateTime::parse(&args.start)?,
        end: UtcDateTime::parse(&args.end)?,
    })
}
