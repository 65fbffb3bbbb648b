use ferrotick_marketdata::{MarketDataError, ValidationError};
use thiserror::Error;

/// CLI-level error categories mapped to exit codes.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    MarketData(#[from] MarketDataError),

    #[error("command error: {0}")]
    Command(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Validation(_) | Self::Command(_) => 2,
            Self::MarketData(error) => market_data_exit_code(error),
            Self::Serialization(_) => 4,
            Self::Io(_) => 10,
        }
    }
}

const fn market_data_exit_code(error: &MarketDataError) -> u8 {
    match error {
        MarketDataError::InvalidRange { .. }
        | MarketDataError::InvalidTimeFrame { .. }
        | MarketDataError::Validation(_)
        | MarketDataError::UnresolvedInputSlot { .. } => 2,
        MarketDataError::NotFound { .. } | MarketDataError::PartialData { .. } => 3,
        MarketDataError::SourceUnavailable { .. }
        | MarketDataError::SubscriberLagging { .. }
        | MarketDataError::Tier(_) => 6,
    }
}
