// =============================================================================
// Central Application State — XBT Sentinel
// =============================================================================
//
// Ties the long-lived subsystem handles together for the control API and
// the supervisor. Each subsystem manages its own interior mutability; this
// struct only holds Arcs, channel ends, and the running flag.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::alerts::ImageCollection;
use crate::config::ConfigStore;
use crate::market_data::{ReferenceRateCache, VenueAvailability};
use crate::types::{now_ms, NormalizedTrade, Pair, Side, TradeEvent};

/// Shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    pub config: Arc<ConfigStore>,
    pub rates: Arc<ReferenceRateCache>,
    pub availability: watch::Receiver<VenueAvailability>,
    pub images: Arc<ImageCollection>,

    /// Pipeline gate flipped by the start/stop control operations. The
    /// engine drops trades while this is false.
    pub running: Arc<AtomicBool>,

    /// Fan-in into the engine; also used to inject synthetic test trades.
    pub trades_tx: mpsc::Sender<NormalizedTrade>,

    /// Instant the process came up, for uptime reporting.
    pub start_time: std::time::Instant,
}

/// Snapshot returned by the debug control operation.
#[derive(Debug, Serialize)]
pub struct DebugSnapshot {
    pub threshold: f64,
    pub active_chats: usize,
    pub aggregation_enabled: bool,
    pub window_seconds: u64,
    pub dynamic_threshold_enabled: bool,
    pub image_count: usize,
    /// Last known BTC/USDT rate, absent before the first fetch.
    pub reference_rate: Option<f64>,
    pub running: bool,
    pub available_venues: Vec<&'static str>,
    pub uptime_secs: u64,
    pub server_time: String,
}

impl AppState {
    pub fn debug_snapshot(&self) -> DebugSnapshot {
        let config = self.config.snapshot();
        DebugSnapshot {
            threshold: config.value_require,
            active_chats: config.active_chat_ids.len(),
            aggregation_enabled: config.trade_aggregation.enabled,
            window_seconds: config.trade_aggregation.window_seconds,
            dynamic_threshold_enabled: config.dynamic_threshold.enabled,
            image_count: self.images.count(),
            reference_rate: self.rates.current(),
            running: self.running.load(Ordering::Relaxed),
            available_venues: self.availability.borrow().available_labels(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            server_time: chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }

    /// Resume alert processing. Returns whether the state changed.
    pub fn start(&self) -> bool {
        let changed = !self.running.swap(true, Ordering::Relaxed);
        if changed {
            info!("pipeline started");
        }
        changed
    }

    /// Suspend alert processing. Returns whether the state changed.
    pub fn stop(&self) -> bool {
        let changed = self.running.swap(false, Ordering::Relaxed);
        if changed {
            info!("pipeline stopped");
        }
        changed
    }

    /// Push a synthetic trade through the whole alert path. Sized to land
    /// just above the current threshold so it always alerts while the
    /// pipeline is running.
    pub async fn inject_test_trade(&self) -> bool {
        let threshold = self.config.threshold();
        let price = 0.15;
        let quantity = (threshold * 1.1 / price).max(1.0);
        let now = now_ms();

        let trade = NormalizedTrade::native(TradeEvent {
            venue: "Test".to_string(),
            pair: Pair::XbtUsdt,
            side: Side::Buy,
            price,
            quantity,
            gross: price * quantity,
            event_time_ms: now,
            receive_time_ms: now,
            venue_url: "https://nonkyc.io/market/XBT_USDT".to_string(),
        });

        match self.trades_tx.send(trade).await {
            Ok(()) => {
                info!(threshold, "synthetic test trade injected");
                true
            }
            Err(_) => {
                warn!("engine channel closed, test trade not injected");
                false
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::images::IMAGES_DIR;
    use crate::config::BotConfig;

    fn state(trades_tx: mpsc::Sender<NormalizedTrade>) -> AppState {
        let cfg = BotConfig {
            bot_token: "123456789:test".to_string(),
            bot_owner: 1,
            active_chat_ids: vec![1, 2],
            ..BotConfig::default()
        };
        let path = std::env::temp_dir().join(format!(
            "xbt-sentinel-appstate-test-{}.json",
            std::process::id()
        ));
        let config = Arc::new(ConfigStore::with_config(path, cfg));
        let client = Arc::new(crate::market_data::MarketDataClient::new());
        let (_avail_tx, avail_rx) = watch::channel(VenueAvailability::default());

        AppState {
            config: config.clone(),
            rates: Arc::new(ReferenceRateCache::new(client)),
            availability: avail_rx,
            images: Arc::new(ImageCollection::new(
                std::env::temp_dir().join(IMAGES_DIR),
                "missing.gif",
            )),
            running: Arc::new(AtomicBool::new(true)),
            trades_tx,
            start_time: std::time::Instant::now(),
        }
    }

    #[tokio::test]
    async fn debug_snapshot_reflects_config() {
        let (tx, _rx) = mpsc::channel(4);
        let state = state(tx);

        let snap = state.debug_snapshot();
        assert!((snap.threshold - 300.0).abs() < f64::EPSILON);
        assert_eq!(snap.active_chats, 2);
        assert!(snap.aggregation_enabled);
        assert_eq!(snap.window_seconds, 8);
        assert!(snap.running);
    }

    #[tokio::test]
    async fn start_stop_toggle_reports_changes() {
        let (tx, _rx) = mpsc::channel(4);
        let state = state(tx);

        assert!(!state.start()); // already running
        assert!(state.stop());
        assert!(!state.stop()); // already stopped
        assert!(state.start());
    }

    #[tokio::test]
    async fn test_trade_lands_in_engine_channel() {
        let (tx, mut rx) = mpsc::channel(4);
        let state = state(tx);

        assert!(state.inject_test_trade().await);
        let trade = rx.recv().await.expect("trade expected");
        assert_eq!(trade.trade.venue, "Test");
        assert_eq!(trade.trade.side, Side::Buy);
        // Sized above the 300 USDT default threshold.
        assert!(trade.canonical_gross > 300.0);
    }
}
