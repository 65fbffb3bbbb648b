use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::{Symbol, TimeFrame, ValidationError};

/// Canonical identity of one bar series.
///
/// Two keys are equal when exchange, area, symbol and timeframe are equal;
/// exchange and area are stored lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    exchange: String,
    area: String,
    symbol: Symbol,
    timeframe: TimeFrame,
}

impl SeriesKey {
    pub fn new(
        exchange: &str,
        area: &str,
        symbol: Symbol,
        timeframe: TimeFrame,
    ) -> Result<Self, ValidationError> {
        Ok(Self {
            exchange: normalize_identifier("exchange", exchange)?,
            area: normalize_identifier("area", area)?,
            symbol,
            timeframe,
        })
    }

    /// Convenience constructor parsing every component from text.
    pub fn parse(
        exchange: &str,
        area: &str,
        symbol: &str,
        timeframe: &str,
    ) -> Result<Self, ValidationError> {
        Self::new(exchange, area, Symbol::parse(symbol)?, timeframe.parse()?)
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn area(&self) -> &str {
        &self.area
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn timeframe(&self) -> TimeFrame {
        self.timeframe
    }

    /// Same instrument, different bar duration.
    pub fn with_timeframe(&self, timeframe: TimeFrame) -> Self {
        Self {
            timeframe,
            ..self.clone()
        }
    }
}

impl Display for SeriesKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.exchange, self.area, self.symbol, self.timeframe
        )
    }
}

pub(crate) fn normalize_identifier(
    field: &'static str,
    value: &str,
) -> Result<String, ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyIdentifier { field });
    }

    let valid = trimmed
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'));
    if !valid {
        return Err(ValidationError::InvalidIdentifier {
            field,
            value: trimmed.to_owned(),
        });
    }

    Ok(trimmed.to_ascii_lowercase())
}
