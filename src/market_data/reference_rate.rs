// =============================================================================
// Reference Rate Cache — BTC/USDT rate for cross-pair conversion
// =============================================================================
//
// XBT/BTC trades must be valued in USDT before the threshold test. The rate
// comes from the NonKYC BTC/USDT ticker, cached and refreshed on a timer. A
// stale value is reused with a warning when a refresh fails; a trade that
// arrives before any rate has ever been fetched is dropped by the caller,
// never valued with a guess.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::client::MarketDataClient;

/// Seconds between refreshes of the cached rate.
pub const REFRESH_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Clone, Copy)]
struct RateEntry {
    rate: f64,
    fetched_at: Instant,
}

/// Cached BTC/USDT rate shared by the cross-pair adapters and the alert
/// formatter.
pub struct ReferenceRateCache {
    client: Arc<MarketDataClient>,
    entry: RwLock<Option<RateEntry>>,
}

impl ReferenceRateCache {
    pub fn new(client: Arc<MarketDataClient>) -> Self {
        Self {
            client,
            entry: RwLock::new(None),
        }
    }

    /// Last known rate, however old. `None` until the first successful fetch.
    pub fn current(&self) -> Option<f64> {
        self.entry.read().map(|e| e.rate)
    }

    /// Fetch a fresh rate and replace the cache. On failure the previous
    /// value stays in place.
    pub async fn refresh(&self) -> Option<f64> {
        match self.client.btc_usdt_rate().await {
            Ok(rate) if rate > 0.0 => {
                *self.entry.write() = Some(RateEntry {
                    rate,
                    fetched_at: Instant::now(),
                });
                debug!(rate, "BTC/USDT reference rate refreshed");
                Some(rate)
            }
            Ok(rate) => {
                warn!(rate, "ignoring non-positive BTC/USDT rate");
                self.current()
            }
            Err(e) => {
                let stale_age_s = self.entry.read().map(|e| e.fetched_at.elapsed().as_secs());
                warn!(error = %e, stale_age_s = ?stale_age_s,
                    "BTC/USDT rate refresh failed, keeping previous value");
                self.current()
            }
        }
    }

    /// Cached rate, fetching once when the cache is still empty.
    pub async fn ensure(&self) -> Option<f64> {
        if let Some(rate) = self.current() {
            return Some(rate);
        }
        self.refresh().await
    }

    /// Seed the cache directly (tests).
    #[cfg(test)]
    pub fn seed(&self, rate: f64) {
        *self.entry.write() = Some(RateEntry {
            rate,
            fetched_at: Instant::now(),
        });
    }
}

/// Periodic refresh task. Fetches immediately, then every
/// [`REFRESH_INTERVAL_SECS`] until shutdown.
pub async fn run_refresher(cache: Arc<ReferenceRateCache>, mut shutdown: watch::Receiver<bool>) {
    info!(interval_s = REFRESH_INTERVAL_SECS, "reference rate refresher started");

    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(REFRESH_INTERVAL_SECS));

    loop {
        tokio::select! {
            _ = interval.tick() => {
                cache.refresh().await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("reference rate refresher stopped");
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_starts_empty() {
        let cache = ReferenceRateCache::new(Arc::new(MarketDataClient::new()));
        assert!(cache.current().is_none());
    }

    #[test]
    fn seeded_rate_is_served() {
        let cache = ReferenceRateCache::new(Arc::new(MarketDataClient::new()));
        cache.seed(65_000.0);
        assert_eq!(cache.current(), Some(65_000.0));
    }
}
