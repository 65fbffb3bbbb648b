use ferrotick_marketdata::{MarketDataConfig, MarketDataResolver, ResolveOptions};
use tracing::info;

use crate::cli::ResolveArgs;
use crate::error::CliError;

use super::{parse_range, CommandReport};

/// Resolves through memory and the local warehouse only; no upstream feed is
/// wired into the operator tool.
pub async fn run(args: &ResolveArgs, config: MarketDataConfig) -> Result<CommandReport, CliError> {
    let parsed = parse_range(&args.range)?;
    let accept_partial = args.accept_partial || config.accept_partial;

    let resolver = MarketDataResolver::builder(config).warehouse().build()?;
    info!(
        series = %parsed.series,
        tiers = ?resolver.cascade().tier_kinds(),
        "resolving series"
    );

    let resolved = resolver
        .resolve_series_with(
            &parsed.series,
            parsed.start,
            parsed.end,
            ResolveOptions { accept_partial },
        )
        .await?;

    let incomplete = !resolved.is_complete();
    Ok(CommandReport {
        data: serde_json::to_value(&resolved)?,
        incomplete,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::SeriesRangeArgs;
    use ferrotick_marketdata::{MarketDataError, WarehouseTierConfig};

    fn resolve_args(accept_partial: bool) -> ResolveArgs {
        ResolveArgs {
            range: SeriesRangeArgs {
                exchange: String::from("binance"),
                area: String::from("spot"),
                symbol: String::from("BTCUSDT"),
                timeframe: String::from("d1"),
                start: String::from("2024-01-01T00:00:00Z"),
                end: String::from("2024-01-05T00:00:00Z"),
            },
            accept_partial,
        }
    }

    fn config_in(home: &std::path::Path) -> MarketDataConfig {
        MarketDataConfig {
            warehouse: WarehouseTierConfig::in_home(home),
            ..MarketDataConfig::default()
        }
    }

    #[tokio::test]
    async fn empty_warehouse_reports_not_found() {
        let temp = tempfile::tempdir().expect("tempdir");

        let result = run(&resolve_args(false), config_in(temp.path())).await;

        assert!(matches!(
            result,
            Err(CliError::MarketData(MarketDataError::NotFound { .. }))
        ));
    }
}
