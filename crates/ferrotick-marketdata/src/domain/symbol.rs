use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::ValidationError;

const MAX_SYMBOL_LEN: usize = 24;

/// Exchange instrument code such as `BTCUSDT` or `1000PEPEUSDT`.
///
/// Parsing trims, uppercases and drops the `/` of pair notation, so
/// `btc/usdt` and `BTCUSDT` name the same instrument.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Symbol(String);

impl Symbol {
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let canonical = input
            .trim()
            .chars()
            .filter(|ch| *ch != '/')
            .map(|ch| ch.to_ascii_uppercase())
            .collect::<String>();

        if canonical.is_empty() {
            return Err(ValidationError::EmptySymbol);
        }
        if let Some((index, ch)) = canonical
            .chars()
            .enumerate()
            .find(|(_, ch)| !is_symbol_char(*ch))
        {
            return Err(ValidationError::SymbolInvalidChar { ch, index });
        }
        if canonical.len() > MAX_SYMBOL_LEN {
            return Err(ValidationError::SymbolTooLong {
                len: canonical.len(),
                max: MAX_SYMBOL_LEN,
            });
        }

        Ok(Self(canonical))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits off `quote` when the symbol ends with it, e.g. `BTCUSDT` -> `BTC`.
    pub fn base_for_quote(&self, quote: &str) -> Option<&str> {
        self.0
            .strip_suffix(quote)
            .filter(|base| !base.is_empty())
    }
}

fn is_symbol_char(ch: char) -> bool {
    ch.is_ascii_uppercase() || ch.is_ascii_digit() || matches!(ch, '.' | '-' | '_')
}

impl Display for Symbol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Symbol {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Symbol> for String {
    fn from(value: Symbol) -> Self {
        value.0
    }
}
