//! Runtime configuration loaded from JSON.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::chunk::ChunkSizePolicy;
use crate::tier::{TierKind, UpstreamConfig, WarehouseTierConfig};
use crate::ValidationError;

/// Settings for a [`crate::MarketDataResolver`].
///
/// Every field has a default, so `{}` is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketDataConfig {
    /// Cascade order, fastest first. Tiers without an implementation are skipped.
    pub tier_order: Vec<TierKind>,
    pub chunk_policy: ChunkSizePolicy,
    pub network: UpstreamConfig,
    pub exchange: UpstreamConfig,
    /// Bounded queue length per subscriber.
    pub subscriber_queue_capacity: usize,
    /// Default for requests that do not pass explicit options.
    pub accept_partial: bool,
    pub warehouse: WarehouseTierConfig,
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            tier_order: TierKind::DEFAULT_ORDER.to_vec(),
            chunk_policy: ChunkSizePolicy::default(),
            network: UpstreamConfig::default(),
            exchange: UpstreamConfig::default(),
            subscriber_queue_capacity: 256,
            accept_partial: false,
            warehouse: WarehouseTierConfig::default(),
        }
    }
}

impl MarketDataConfig {
    /// Reads and validates a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ValidationError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|error| ValidationError::InvalidConfig {
            reason: format!("cannot read '{}': {error}", path.display()),
        })?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ValidationError> {
        let config: Self =
            serde_json::from_str(text).map_err(|error| ValidationError::InvalidConfig {
                reason: error.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let invalid = |reason: &str| ValidationError::InvalidConfig {
            reason: reason.to_owned(),
        };

        if self.subscriber_queue_capacity == 0 {
            return Err(invalid("subscriber_queue_capacity must be greater than zero"));
        }
        if self.tier_order.is_empty() {
            return Err(invalid("tier_order cannot be empty"));
        }
        let mut seen = HashSet::new();
        if !self.tier_order.iter().all(|tier| seen.insert(*tier)) {
            return Err(invalid("tier_order cannot list a tier twice"));
        }
        for (name, upstream) in [("network", &self.network), ("exchange", &self.exchange)] {
            if upstream.timeout.is_zero() {
                return Err(ValidationError::InvalidConfig {
                    reason: format!("{name}.timeout_ms must be greater than zero"),
                });
            }
            upstream
                .retry
                .backoff
                .validate()
                .map_err(|reason| ValidationError::InvalidConfig {
                    reason: format!("{name}.retry: {reason}"),
                })?;
        }
        if self.warehouse.max_pool_size == 0 {
            return Err(invalid("warehouse.max_pool_size must be greater than zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::chunk::ChunkSpan;

    #[test]
    fn empty_object_uses_defaults() {
        let config = MarketDataConfig::from_json_str("{}").expect("valid config");

        assert_eq!(config.tier_order, TierKind::DEFAULT_ORDER.to_vec());
        assert_eq!(config.subscriber_queue_capacity, 256);
        assert!(!config.accept_partial);
    }

    #[test]
    fn reads_nested_sections() {
        let config = MarketDataConfig::from_json_str(
            r#"{
                "tier_order": ["memory", "exchange"],
                "chunk_policy": {"intraday": "month", "end_of_day": "year"},
                "exchange": {"timeout_ms": 2500, "retry": {"max_retries": 1}},
                "subscriber_queue_capacity": 8,
                "warehouse": {"home": "/var/lib/ferrotick", "max_pool_size": 2}
            }"#,
        )
        .expect("valid config");

        assert_eq!(config.tier_order, vec![TierKind::Memory, TierKind::Exchange]);
        assert_eq!(config.chunk_policy.intraday, ChunkSpan::Month);
        assert_eq!(config.exchange.timeout, Duration::from_millis(2500));
        assert_eq!(config.exchange.retry.max_retries, 1);
        assert_eq!(config.subscriber_queue_capacity, 8);
        assert!(config
            .warehouse
            .db_path()
            .starts_with("/var/lib/ferrotick"));
    }

    #[test]
    fn rejects_backoff_factors_that_cannot_grow_the_delay() {
        for factor in ["-3.0", "0.5", "0.0"] {
            let json = format!(
                r#"{{"exchange": {{"retry": {{"backoff": {{"kind": "exponential", "base_ms": 100, "factor": {factor}, "max_ms": 1000, "jitter": false}}}}}}}}"#
            );
            let error =
                MarketDataConfig::from_json_str(&json).expect_err("factor should be rejected");
            assert!(error.to_string().contains("exchange.retry"), "{error}");
        }

        let config = MarketDataConfig::from_json_str(
            r#"{"network": {"retry": {"backoff": {"kind": "exponential", "base_ms": 100, "factor": 1.0, "max_ms": 1000, "jitter": false}}}}"#,
        )
        .expect("flat backoff is valid");
        assert_eq!(config.network.retry.delay_for_attempt(3), Duration::from_millis(100));
    }

    #[test]
    fn rejects_duplicate_tiers_and_zero_capacity() {
        assert!(MarketDataConfig::from_json_str(r#"{"tier_order": ["memory", "memory"]}"#).is_err());
        assert!(MarketDataConfig::from_json_str(r#"{"tier_order": []}"#).is_err());
        assert!(MarketDataConfig::from_json_str(r#"{"subscriber_queue_capacity": 0}"#).is_err());
        assert!(MarketDataConfig::from_json_str(r#"{"tier_order": ["tape"]}"#).is_err());
    }

    #[test]
    fn load_reads_a_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("marketdata.json");
        fs::write(&path, r#"{"accept_partial": true}"#).expect("write config");

        let config = MarketDataConfig::load(&path).expect("load");
        assert!(config.accept_partial);
        assert!(MarketDataConfig::load(temp.path().join("missing.json")).is_err());
    }
}
