//! Retry logic with exponential backoff and jitter for upstream tiers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::tier::{TierError, TierErrorKind};

/// Backoff strategy between attempts of an upstream call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Uses a fixed delay between retries.
    Fixed {
        #[serde(rename = "delay_ms", with = "millis")]
        delay: Duration,
    },
    /// Delay is `base * (factor ^ attempt)`, capped at `max`.
    Exponential {
        #[serde(rename = "base_ms", with = "millis")]
        base: Duration,
        factor: f64,
        #[serde(rename = "max_ms", with = "millis")]
        max: Duration,
        /// Applies +/- 50% random jitter.
        jitter: bool,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_millis(200),
            factor: 2.0,
            max: Duration::from_secs(3),
            jitter: true,
        }
    }
}

impl Backoff {
    /// Rejects growth factors that would shrink, negate or poison the delay.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Fixed { .. } => Ok(()),
            Self::Exponential { factor, .. } if !factor.is_finite() || *factor < 1.0 => Err(
                format!("backoff factor must be a finite number >= 1.0, got {factor}"),
            ),
            Self::Exponential { .. } => Ok(()),
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => delay,
            Self::Exponential {
                base,
                factor,
                max,
                jitter,
            } => {
                let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
                let seconds = (base.as_secs_f64() * factor.powi(exponent)).max(0.0);
                let capped = Duration::from_secs_f64(seconds.min(max.as_secs_f64()));

                if !jitter {
                    return capped;
                }

                let millis = u64::try_from(capped.as_millis()).unwrap_or(u64::MAX);
                let spread = millis / 2;
                let offset = fastrand::u64(0..=spread.saturating_mul(2));
                Duration::from_millis(millis.saturating_sub(spread).saturating_add(offset))
            }
        }
    }
}

/// Retry policy applied by [`crate::tier::UpstreamTier`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,
    /// Total attempts = `max_retries + 1`.
    pub max_retries: u32,
    pub backoff: Backoff,
    pub retry_on_timeout: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 4,
            backoff: Backoff::default(),
            retry_on_timeout: true,
        }
    }
}

impl RetryConfig {
    pub fn exponential(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn fixed(delay: Duration, max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Fixed { delay },
            ..Self::default()
        }
    }

    pub fn no_retry() -> Self {
        Self {
            enabled: false,
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Whether a failed attempt number `attempt` (0-based) may be retried.
    pub fn should_retry(&self, error: &TierError, attempt: u32) -> bool {
        if !self.enabled || attempt >= self.max_retries || !error.retryable() {
            return false;
        }
        error.kind() != TierErrorKind::Timeout || self.retry_on_timeout
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }
}

pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_backoff_is_constant() {
        let backoff = Backoff::Fixed {
            delay: Duration::from_millis(100),
        };

        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(10), Duration::from_millis(100));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(100),
            factor: 2.0,
            max: Duration::from_secs(1),
            jitter: false,
        };

        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(400));
        assert_eq!(backoff.delay(4), Duration::from_secs(1));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn shrinking_or_negative_factors_are_rejected_and_never_panic() {
        let negative = Backoff::Exponential {
            base: Duration::from_millis(100),
            factor: -3.0,
            max: Duration::from_secs(1),
            jitter: false,
        };
        let nan = Backoff::Exponential {
            base: Duration::from_millis(100),
            factor: f64::NAN,
            max: Duration::from_secs(1),
            jitter: true,
        };

        assert!(negative.validate().is_err());
        assert!(nan.validate().is_err());
        assert!(Backoff::default().validate().is_ok());
        assert_eq!(negative.delay(1), Duration::ZERO);
        assert_eq!(nan.delay(2), Duration::ZERO);
    }

    #[test]
    fn jitter_stays_within_half_of_the_delay() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(100),
            factor: 2.0,
            max: Duration::from_secs(1),
            jitter: true,
        };

        for _ in 0..10 {
            for attempt in 0..5 {
                let expected = (100.0 * 2_f64.powi(attempt as i32)).min(1000.0);
                let delay_ms = backoff.delay(attempt).as_millis() as f64;
                assert!(delay_ms >= expected * 0.49, "attempt={attempt} delay={delay_ms}");
                assert!(delay_ms <= expected * 1.51, "attempt={attempt} delay={delay_ms}");
            }
        }
    }

    #[test]
    fn retries_only_retryable_errors_within_budget() {
        let config = RetryConfig::fixed(Duration::from_millis(1), 2);
        let transient = TierError::unavailable("connection reset");
        let fatal = TierError::invalid_request("bad symbol");

        assert!(config.should_retry(&transient, 0));
        assert!(config.should_retry(&transient, 1));
        assert!(!config.should_retry(&transient, 2));
        assert!(!config.should_retry(&fatal, 0));
        assert!(!RetryConfig::no_retry().should_retry(&transient, 0));
    }

    #[test]
    fn timeouts_respect_retry_on_timeout() {
        let config = RetryConfig {
            retry_on_timeout: false,
            ..RetryConfig::default()
        };

        assert!(!config.should_retry(&TierError::timeout("slow"), 0));
        assert!(RetryConfig::default().should_retry(&TierError::timeout("slow"), 0));
    }

    #[test]
    fn backoff_deserializes_from_millisecond_fields() {
        let backoff: Backoff =
            serde_json::from_str(r#"{"kind":"fixed","delay_ms":250}"#).expect("valid backoff");
        assert_eq!(
            backoff,
            Backoff::Fixed {
                delay: Duration::from_millis(250)
            }
        );

        let config: RetryConfig = serde_json::from_str(r#"{"max_retries":1}"#).expect("config");
        assert_eq!(config.max_retries, 1);
        assert!(config.enabled);
    }
}
