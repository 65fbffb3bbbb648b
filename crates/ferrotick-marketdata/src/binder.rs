//! Binding of processor input slots to concrete series.

use std::collections::{BTreeSet, HashSet};
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{normalize_identifier, SeriesKey, Symbol, TimeFrame};
use crate::error::UnresolvedSlot;
use crate::{MarketDataError, ValidationError};

const SYMBOL_PLACEHOLDER: &str = "symbol";

/// Price component a single-value input reads from each bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceField {
    Open,
    High,
    Low,
    Close,
    Volume,
}

/// Data shape an input slot consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "field", rename_all = "snake_case")]
pub enum InputKind {
    Bars,
    Price(PriceField),
}

/// One declared input slot of a processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputDeclaration {
    pub name: String,
    pub kind: InputKind,
    /// Literal symbol, or text containing `{symbol}` for the processor default.
    #[serde(default = "default_template")]
    pub symbol_template: String,
    /// Falls back to the processor default when absent.
    #[serde(default)]
    pub timeframe: Option<TimeFrame>,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_template() -> String {
    format!("{{{SYMBOL_PLACEHOLDER}}}")
}

const fn default_required() -> bool {
    true
}

impl InputDeclaration {
    /// Required bar input on the processor's default symbol.
    pub fn bars(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: InputKind::Bars,
            symbol_template: default_template(),
            timeframe: None,
            required: true,
        }
    }

    pub fn price(name: impl Into<String>, field: PriceField) -> Self {
        Self {
            kind: InputKind::Price(field),
            ..Self::bars(name)
        }
    }

    pub fn with_symbol(mut self, template: impl Into<String>) -> Self {
        self.symbol_template = template.into();
        self
    }

    pub fn with_timeframe(mut self, timeframe: TimeFrame) -> Self {
        self.timeframe = Some(timeframe);
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// Inputs and defaults a processor type declares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorDeclaration {
    pub name: String,
    pub exchange: String,
    pub area: String,
    #[serde(default)]
    pub default_symbol: Option<String>,
    #[serde(default)]
    pub default_timeframe: Option<TimeFrame>,
    pub inputs: Vec<InputDeclaration>,
}

impl ProcessorDeclaration {
    /// Checks the declaration's shape; binding can still fail later on
    /// unknown symbols or missing defaults.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let invalid = |reason: String| ValidationError::InvalidDeclaration {
            processor: self.name.clone(),
            reason,
        };

        if self.name.trim().is_empty() {
            return Err(invalid(String::from("processor name cannot be empty")));
        }
        normalize_identifier("exchange", &self.exchange).map_err(|e| invalid(e.to_string()))?;
        normalize_identifier("area", &self.area).map_err(|e| invalid(e.to_string()))?;

        let mut seen = HashSet::new();
        for input in &self.inputs {
            if input.name.trim().is_empty() {
                return Err(invalid(String::from("input slot name cannot be empty")));
            }
            if !seen.insert(input.name.as_str()) {
                return Err(invalid(format!("duplicate input slot '{}'", input.name)));
            }
            parse_template(&input.symbol_template)
                .map_err(|reason| invalid(format!("slot '{}': {reason}", input.name)))?;
        }
        Ok(())
    }
}

/// Maps raw symbol text to a canonical [`Symbol`] for a venue.
pub trait SymbolNormalizer: Send + Sync {
    fn normalize(&self, exchange: &str, area: &str, raw: &str) -> Result<Symbol, ValidationError>;
}

/// Accepts any well-formed symbol, uppercased.
#[derive(Debug, Clone, Copy, Default)]
pub struct UppercaseNormalizer;

impl SymbolNormalizer for UppercaseNormalizer {
    fn normalize(&self, _exchange: &str, _area: &str, raw: &str) -> Result<Symbol, ValidationError> {
        Symbol::parse(raw)
    }
}

/// Accepts only symbols listed for an exchange and area.
#[derive(Debug, Clone, Default)]
pub struct KnownSymbols {
    listed: HashSet<(String, String, Symbol)>,
}

impl KnownSymbols {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list(
        mut self,
        exchange: &str,
        area: &str,
        symbols: impl IntoIterator<Item = Symbol>,
    ) -> Self {
        let exchange = exchange.trim().to_ascii_lowercase();
        let area = area.trim().to_ascii_lowercase();
        self.listed.extend(
            symbols
                .into_iter()
                .map(|symbol| (exchange.clone(), area.clone(), symbol)),
        );
        self
    }
}

impl SymbolNormalizer for KnownSymbols {
    fn normalize(&self, exchange: &str, area: &str, raw: &str) -> Result<Symbol, ValidationError> {
        let symbol = Symbol::parse(raw)?;
        let key = (
            exchange.trim().to_ascii_lowercase(),
            area.trim().to_ascii_lowercase(),
            symbol,
        );
        if self.listed.contains(&key) {
            Ok(key.2)
        } else {
            Err(ValidationError::UnknownSymbol {
                exchange: key.0,
                area: key.1,
                symbol: key.2.to_string(),
            })
        }
    }
}

/// A slot resolved to its series; immutable once bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoundInput {
    pub slot: InputDeclaration,
    pub series: SeriesKey,
}

/// Every bound slot of one processor, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoundInputs {
    pub processor: String,
    pub inputs: Vec<BoundInput>,
}

impl BoundInputs {
    pub fn get(&self, slot: &str) -> Option<&BoundInput> {
        self.inputs.iter().find(|input| input.slot.name == slot)
    }

    pub fn series_for(&self, slot: &str) -> Option<&SeriesKey> {
        self.get(slot).map(|input| &input.series)
    }

    /// Distinct series across all slots, sorted.
    pub fn series(&self) -> Vec<SeriesKey> {
        self.inputs
            .iter()
            .map(|input| input.series.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}

impl Display for BoundInputs {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:", self.processor)?;
        for input in &self.inputs {
            write!(f, " {}={}", input.slot.name, input.series)?;
        }
        Ok(())
    }
}

/// Resolves processor declarations into [`BoundInputs`].
#[derive(Clone)]
pub struct InputSlotBinder {
    normalizer: Arc<dyn SymbolNormalizer>,
}

impl Default for InputSlotBinder {
    fn default() -> Self {
        Self::new(Arc::new(UppercaseNormalizer))
    }
}

impl std::fmt::Debug for InputSlotBinder {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputSlotBinder").finish_non_exhaustive()
    }
}

impl InputSlotBinder {
    pub fn new(normalizer: Arc<dyn SymbolNormalizer>) -> Self {
        Self { normalizer }
    }

    /// Binds every slot, or fails listing every unresolved required slot.
    pub fn bind(&self, declaration: &ProcessorDeclaration) -> Result<BoundInputs, MarketDataError> {
        let mut inputs = Vec::with_capacity(declaration.inputs.len());
        let mut unresolved = Vec::new();

        for slot in &declaration.inputs {
            match self.resolve_slot(declaration, slot) {
                Ok(series) => inputs.push(BoundInput {
                    slot: slot.clone(),
                    series,
                }),
                Err(reason) if slot.required => unresolved.push(UnresolvedSlot {
                    name: slot.name.clone(),
                    reason,
                }),
                Err(reason) => {
                    debug!(
                        processor = %declaration.name,
                        slot = %slot.name,
                        reason = %reason,
                        "skipping unresolved optional slot"
                    );
                }
            }
        }

        if !unresolved.is_empty() {
            return Err(MarketDataError::UnresolvedInputSlot {
                processor: declaration.name.clone(),
                slots: unresolved,
            });
        }

        Ok(BoundInputs {
            processor: declaration.name.clone(),
            inputs,
        })
    }

    fn resolve_slot(
        &self,
        declaration: &ProcessorDeclaration,
        slot: &InputDeclaration,
    ) -> Result<SeriesKey, String> {
        let raw = expand_template(&slot.symbol_template, declaration.default_symbol.as_deref())?;
        let symbol = self
            .normalizer
            .normalize(&declaration.exchange, &declaration.area, &raw)
            .map_err(|error| error.to_string())?;
        let timeframe = slot
            .timeframe
            .or(declaration.default_timeframe)
            .ok_or_else(|| String::from("no timeframe on slot and no processor default"))?;

        SeriesKey::new(&declaration.exchange, &declaration.area, symbol, timeframe)
            .map_err(|error| error.to_string())
    }
}

enum Segment<'a> {
    Literal(&'a str),
    Symbol,
}

fn parse_template(template: &str) -> Result<Vec<Segment<'_>>, String> {
    if template.trim().is_empty() {
        return Err(String::from("symbol template is empty"));
    }

    let mut segments = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find(['{', '}']) {
        if rest[open..].starts_with('}') {
            return Err(format!("unmatched '}}' in template '{template}'"));
        }
        let Some(close) = rest[open..].find('}') else {
            return Err(format!("unclosed '{{' in template '{template}'"));
        };
        let placeholder = &rest[open + 1..open + close];
        if placeholder != SYMBOL_PLACEHOLDER {
            return Err(format!("unknown placeholder '{{{placeholder}}}' in template '{template}'"));
        }
        if open > 0 {
            segments.push(Segment::Literal(&rest[..open]));
        }
        segments.push(Segment::Symbol);
        rest = &rest[open + close + 1..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Literal(rest));
    }
    Ok(segments)
}

fn expand_template(template: &str, default_symbol: Option<&str>) -> Result<String, String> {
    let mut expanded = String::new();
    for segment in parse_template(template)? {
        match segment {
            Segment::Literal(text) => expanded.push_str(text),
            Segment::Symbol => match default_symbol {
                Some(symbol) => expanded.push_str(symbol),
                None => {
                    return Err(String::from(
                        "template uses {symbol} but the processor has no default symbol",
                    ))
                }
            },
        }
    }
    Ok(expanded)
}
