use ferrotick_marketdata::{ChunkRangeProvider, MarketDataConfig, SeriesKey, TimeRange};
use serde::Serialize;

use crate::cli::SeriesRangeArgs;
use crate::error::CliError;

use super::{parse_range, CommandReport};

#[derive(Debug, Serialize)]
struct PlannedChunk {
    chunk: TimeRange,
    requested: TimeRange,
}

#[derive(Debug, Serialize)]
struct PlanResponseData {
    series: SeriesKey,
    chunks: Vec<PlannedChunk>,
}

pub fn run(args: &SeriesRangeArgs, config: &MarketDataConfig) -> Result<CommandReport, CliError> {
    let parsed = parse_range(args)?;
    let planner = ChunkRangeProvider::new(config.chunk_policy);

    let chunks = planner
        .plan(&parsed.series, parsed.start, parsed.end)?
        .into_iter()
        .map(|descriptor| PlannedChunk {
            chunk: descriptor.range(),
            requested: descriptor.requested(),
        })
        .collect();

    let data = serde_json::to_value(PlanResponseData {
        series: parsed.series,
        chunks,
    })?;
    Ok(CommandReport::complete(data))
}
