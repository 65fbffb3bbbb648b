//! Read-only tiers backed by a remote collaborator: the local network
//! market-data service or the exchange itself.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Availability, DataTier, RateBudget, TierError, TierFuture, TierKind};
use crate::chunk::ChunkDescriptor;
use crate::domain::{Bar, SeriesKey, TimeRange};
use crate::retry::{millis, RetryConfig};

/// Remote source of historical bars.
pub trait HistoricalFeed: Send + Sync {
    /// Fetches bars with open time inside `range`, ascending.
    fn fetch_bars<'a>(
        &'a self,
        series: &'a SeriesKey,
        range: TimeRange,
    ) -> TierFuture<'a, Vec<Bar>>;

    /// Feeds that cannot tell what they hold report everything as available.
    fn availability<'a>(&'a self, _chunk: &'a ChunkDescriptor) -> TierFuture<'a, Availability> {
        Box::pin(async { Ok(Availability::Full) })
    }
}

/// Call policy of one upstream tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    #[serde(rename = "timeout_ms", with = "millis")]
    pub timeout: Duration,
    pub retry: RetryConfig,
    #[serde(rename = "quota_window_ms", with = "millis")]
    pub quota_window: Duration,
    pub quota_limit: u32,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            retry: RetryConfig::default(),
            quota_window: Duration::from_secs(60),
            quota_limit: 1_200,
        }
    }
}

/// [`DataTier`] adapter around a [`HistoricalFeed`] with timeout, rate
/// budget and bounded retry.
pub struct UpstreamTier {
    kind: TierKind,
    feed: Arc<dyn HistoricalFeed>,
    config: UpstreamConfig,
    budget: RateBudget,
}

impl std::fmt::Debug for UpstreamTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamTier")
            .field("kind", &self.kind)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl UpstreamTier {
    pub fn network(feed: Arc<dyn HistoricalFeed>, config: UpstreamConfig) -> Self {
        Self::new(TierKind::Network, feed, config)
    }

    pub fn exchange(feed: Arc<dyn HistoricalFeed>, config: UpstreamConfig) -> Self {
        Self::new(TierKind::Exchange, feed, config)
    }

    fn new(kind: TierKind, feed: Arc<dyn HistoricalFeed>, config: UpstreamConfig) -> Self {
        let budget = RateBudget::new(config.quota_window, config.quota_limit);
        Self {
            kind,
            feed,
            config,
            budget,
        }
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    async fn call<'b, T>(
        &'b self,
        operation: &'static str,
        series: &'b SeriesKey,
        mut attempt_call: impl FnMut() -> TierFuture<'b, T> + Send,
    ) -> Result<T, TierError>
    where
        T: Send,
    {
        let mut attempt = 0;
        loop {
            self.budget.acquire().await;

            let result = match tokio::time::timeout(self.config.timeout, attempt_call()).await {
                Ok(result) => result,
                Err(_) => Err(TierError::timeout(format!(
                    "{operation} timed out after {}ms",
                    self.config.timeout.as_millis()
                ))),
            };

            let error = match result {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if self.config.retry.should_retry(&error, attempt) {
                let delay = self.config.retry.delay_for_attempt(attempt);
                warn!(
                    tier = %self.kind,
                    series = %series,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "retrying upstream {operation}"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            if !error.retryable() {
                debug!(tier = %self.kind, series = %series, error = %error, "upstream {operation} failed");
                return Err(error);
            }

            return Err(TierError::exhausted(format!(
                "{operation} from {} gave up after {} attempt(s): {}",
                self.kind,
                attempt + 1,
                error.message()
            )));
        }
    }
}

impl DataTier for UpstreamTier {
    fn kind(&self) -> TierKind {
        self.kind
    }

    fn probe<'a>(&'a self, chunk: &'a ChunkDescriptor) -> TierFuture<'a, Availability> {
        Box::pin(self.call("probe", chunk.series(), move || {
            self.feed.availability(chunk)
        }))
    }

    fn fetch<'a>(&'a self, series: &'a SeriesKey, range: TimeRange) -> TierFuture<'a, Vec<Bar>> {
        Box::pin(self.call("fetch", series, move || {
            self.feed.fetch_bars(series, range)
        }))
    }

    fn put<'a>(
        &'a self,
        _chunk: &'a ChunkDescriptor,
        _range: TimeRange,
        _bars: &'a [Bar],
    ) -> TierFuture<'a, ()> {
        let kind = self.kind;
        Box::pin(async move { Err(TierError::invalid_request(format!("{kind} tier is read-only"))) })
    }

    fn accepts_writes(&self) -> bool {
        false
    }
}
