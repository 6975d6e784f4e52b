// =============================================================================
// Threshold Controller — volume-driven adjustment of the alert threshold
// =============================================================================
//
// Static mode: the threshold is whatever the config says. Dynamic mode
// recomputes it from 24 h volume on a timer and writes the result back
// through the config store, so every reader picks it up on the next
// snapshot. Failures keep the previous threshold.
// =============================================================================

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{ConfigStore, DynamicThreshold};
use crate::market_data::MarketDataClient;

/// Seconds between enabled-flag re-checks while dynamic mode is off.
const DISABLED_RECHECK_SECS: u64 = 60;

/// clamp(base + volume · multiplier, min, max), rounded to the nearest
/// whole USDT.
pub fn compute_threshold(settings: &DynamicThreshold, volume_24h: f64) -> f64 {
    let raw = settings.base_value + volume_24h * settings.volume_multiplier;
    raw.clamp(settings.min_threshold, settings.max_threshold).round()
}

/// Refresh the threshold once from the live 24 h volume. Returns the new
/// threshold when a write happened.
pub async fn refresh_once(
    config: &Arc<ConfigStore>,
    client: &Arc<MarketDataClient>,
) -> Option<f64> {
    let snapshot = config.snapshot();
    if !snapshot.dynamic_threshold.enabled {
        return None;
    }

    let volume_24h = match client.nonkyc_ticker("XBT_USDT").await {
        Ok(ticker) => match ticker.volume_24h {
            Some(v) => v,
            None => {
                warn!("ticker missing 24 h volume, keeping current threshold");
                return None;
            }
        },
        Err(e) => {
            warn!(error = %e, "volume fetch failed, keeping current threshold");
            return None;
        }
    };

    let new_threshold = compute_threshold(&snapshot.dynamic_threshold, volume_24h);
    if (new_threshold - snapshot.value_require).abs() < f64::EPSILON {
        debug!(threshold = new_threshold, "dynamic threshold unchanged");
        return None;
    }

    match config.update(|c| c.value_require = new_threshold) {
        Ok(()) => {
            info!(
                threshold = new_threshold,
                volume_24h, "threshold updated from 24 h volume"
            );
            Some(new_threshold)
        }
        Err(e) => {
            warn!(error = %e, "threshold write rejected, keeping previous value");
            None
        }
    }
}

/// Run the refresh timer until shutdown. The interval is re-read every
/// cycle so config changes take effect without a restart.
pub async fn run_threshold_controller(
    config: Arc<ConfigStore>,
    client: Arc<MarketDataClient>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("threshold controller started");

    loop {
        let snapshot = config.snapshot();
        let sleep_secs = if snapshot.dynamic_threshold.enabled {
            snapshot.dynamic_threshold.price_check_interval.max(1)
        } else {
            DISABLED_RECHECK_SECS
        };

        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs(sleep_secs)) => {
                refresh_once(&config, &client).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("threshold controller stopped");
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> DynamicThreshold {
        DynamicThreshold {
            enabled: true,
            base_value: 300.0,
            volume_multiplier: 0.05,
            price_check_interval: 3600,
            min_threshold: 100.0,
            max_threshold: 1000.0,
        }
    }

    #[test]
    fn threshold_scales_with_volume() {
        // 300 + 5000 × 0.05 = 550.
        assert!((compute_threshold(&settings(), 5_000.0) - 550.0).abs() < f64::EPSILON);
    }

    #[test]
    fn threshold_rounds_to_nearest_integer() {
        // 300 + 10.1 × 0.05 = 300.505 → 301.
        assert!((compute_threshold(&settings(), 10.1) - 301.0).abs() < f64::EPSILON);
        // 300 + 9.8 × 0.05 = 300.49 → 300.
        assert!((compute_threshold(&settings(), 9.8) - 300.0).abs() < f64::EPSILON);
    }

    #[test]
    fn threshold_clamps_to_bounds() {
        // Huge volume pins at max.
        assert!((compute_threshold(&settings(), 1e9) - 1000.0).abs() < f64::EPSILON);

        // A base below min pins at min even with zero volume.
        let mut s = settings();
        s.base_value = 10.0;
        assert!((compute_threshold(&s, 0.0) - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn clamped_threshold_always_within_bounds() {
        let s = settings();
        for volume in [0.0, 1.0, 999.0, 14_000.0, 1e7, 1e12] {
            let t = compute_threshold(&s, volume);
            assert!(t >= s.min_threshold && t <= s.max_threshold);
        }
    }
}
