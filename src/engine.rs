// =============================================================================
// Aggregation Engine — windowed grouping and threshold decisions
// =============================================================================
//
// The engine owns all pending-trade state. Incoming normalized trades either
// trigger an immediate alert (aggregation disabled), join an open bucket
// keyed by (venue, pair, aligned time window), or are dropped. A sweeper
// tick closes buckets whose window has elapsed and emits one aggregated
// alert per bucket that crossed the threshold.
//
// Only the engine task touches the bucket map; fan-in from the adapters
// arrives over a single bounded channel, which also preserves per-adapter
// event ordering.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::ConfigStore;
use crate::types::{
    now_ms, AlertKind, AlertRecord, BreakdownEntry, NormalizedTrade, Pair,
};

/// Seconds between bucket-expiry sweeps.
pub const SWEEP_TICK_SECS: u64 = 1;

/// Individual trades shown in an aggregated alert before truncation.
const BREAKDOWN_LIMIT: usize = 5;

/// Bucket identity: one venue label, one pair, one aligned window.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub venue: String,
    pub pair: Pair,
    pub bucket_id: i64,
}

/// An open aggregation window. Immutable once closed and emitted.
#[derive(Debug)]
struct Bucket {
    trades: Vec<NormalizedTrade>,
    /// Wall-clock when the first member arrived; expiry counts from here.
    opened_at_ms: i64,
    latest_event_time_ms: i64,
}

/// The engine's owned state plus its decision logic. The async loop in
/// [`run_engine`] is a thin shell around this so the semantics stay
/// synchronous and testable.
pub struct AggregationEngine {
    config: Arc<ConfigStore>,
    running: Arc<AtomicBool>,
    buckets: HashMap<BucketKey, Bucket>,
}

impl AggregationEngine {
    pub fn new(config: Arc<ConfigStore>, running: Arc<AtomicBool>) -> Self {
        Self {
            config,
            running,
            buckets: HashMap::new(),
        }
    }

    /// Number of currently open buckets (debug surface).
    pub fn open_buckets(&self) -> usize {
        self.buckets.len()
    }

    /// Process one incoming trade. Returns an alert only on the immediate
    /// path; windowed alerts come out of [`Self::sweep_expired`].
    pub fn handle_trade(&mut self, mut trade: NormalizedTrade) -> Option<AlertRecord> {
        if !self.running.load(Ordering::Relaxed) {
            debug!(venue = %trade.trade.venue, "pipeline stopped, dropping trade");
            return None;
        }

        trade.revalidate("engine intake");

        let config = self.config.snapshot();
        let threshold = config.value_require;

        info!(
            venue = %trade.trade.venue,
            pair = %trade.trade.pair,
            side = %trade.trade.side,
            quantity = trade.trade.quantity,
            price = trade.trade.price,
            gross_usdt = trade.canonical_gross,
            "processing trade"
        );

        let aggregation = &config.trade_aggregation;
        if !aggregation.enabled || aggregation.window_seconds == 0 {
            if !trade.trade.side.counts_as_buy() {
                debug!(side = %trade.trade.side, "not a buy, no immediate alert");
                return None;
            }
            if trade.canonical_gross >= threshold {
                info!(
                    gross_usdt = trade.canonical_gross,
                    threshold, "sending immediate alert"
                );
                return Some(single_alert(&trade));
            }
            debug!(
                gross_usdt = trade.canonical_gross,
                threshold, "trade below threshold"
            );
            return None;
        }

        // Windowed path: align on the venue-reported event time so trades
        // of one burst share a bucket regardless of receive jitter.
        let window = aggregation.window_seconds as i64;
        let bucket_id = (trade.trade.event_time_ms / 1000).div_euclid(window);
        let key = BucketKey {
            venue: trade.trade.venue.clone(),
            pair: trade.trade.pair,
            bucket_id,
        };

        let event_time = trade.trade.event_time_ms;
        let bucket = self.buckets.entry(key).or_insert_with(|| Bucket {
            trades: Vec::new(),
            opened_at_ms: now_ms(),
            latest_event_time_ms: event_time,
        });
        bucket.latest_event_time_ms = bucket.latest_event_time_ms.max(event_time);
        bucket.trades.push(trade);

        None
    }

    /// Close every bucket whose window has elapsed, in the order they were
    /// opened, and return the alerts that crossed the threshold.
    pub fn sweep_expired(&mut self, now_ms: i64) -> Vec<AlertRecord> {
        let window_ms = self.config.snapshot().trade_aggregation.window_seconds as i64 * 1000;

        let mut expired: Vec<BucketKey> = self
            .buckets
            .iter()
            .filter(|(_, b)| now_ms - b.opened_at_ms >= window_ms)
            .map(|(k, _)| k.clone())
            .collect();
        expired.sort_by_key(|k| self.buckets[k].opened_at_ms);

        self.close_buckets(expired)
    }

    /// Close everything that is still open (shutdown drain). Buckets still
    /// go through the threshold test so an in-flight burst can alert.
    pub fn flush_all(&mut self) -> Vec<AlertRecord> {
        let mut keys: Vec<BucketKey> = self.buckets.keys().cloned().collect();
        keys.sort_by_key(|k| self.buckets[k].opened_at_ms);
        if !keys.is_empty() {
            info!(count = keys.len(), "draining open buckets");
        }
        self.close_buckets(keys)
    }

    fn close_buckets(&mut self, keys: Vec<BucketKey>) -> Vec<AlertRecord> {
        let threshold = self.config.threshold();
        let mut alerts = Vec::new();
        for key in keys {
            // Removal is also the garbage collection: a closed key leaves
            // nothing behind, and a late event for it opens a fresh bucket
            // in a later window.
            if let Some(bucket) = self.buckets.remove(&key) {
                if let Some(alert) = close_bucket(&key, bucket, threshold) {
                    alerts.push(alert);
                }
            }
        }
        alerts
    }
}

impl NormalizedTrade {
    /// Re-check the quote arithmetic and rebuild the canonical values from
    /// the (possibly corrected) gross.
    fn revalidate(&mut self, context: &str) {
        self.trade.validate_gross(context);
        match self.reference_rate {
            Some(rate) => {
                self.canonical_price = self.trade.price * rate;
                self.canonical_gross = self.canonical_price * self.trade.quantity;
            }
            None => {
                self.canonical_price = self.trade.price;
                self.canonical_gross = self.trade.gross;
            }
        }
    }
}

fn single_alert(trade: &NormalizedTrade) -> AlertRecord {
    AlertRecord {
        pair: trade.trade.pair,
        kind: AlertKind::Single,
        venue_label: trade.trade.venue.clone(),
        venue_url: trade.trade.venue_url.clone(),
        canonical_gross: trade.canonical_gross,
        quote_gross: trade.trade.gross,
        quantity: trade.trade.quantity,
        weighted_avg_price: trade.trade.price,
        canonical_avg_price: trade.canonical_price,
        num_trades: 1,
        breakdown: Vec::new(),
        breakdown_overflow: 0,
        reference_rate: trade.reference_rate,
        latest_event_time_ms: trade.trade.event_time_ms,
    }
}

/// Compute a closed bucket's aggregates and apply the threshold test.
///
/// Only buy and unknown sides contribute; sell members stay in the bucket
/// for auditing but never count toward the threshold or the emitted totals.
fn close_bucket(key: &BucketKey, bucket: Bucket, threshold: f64) -> Option<AlertRecord> {
    let buys: Vec<&NormalizedTrade> = bucket
        .trades
        .iter()
        .filter(|t| t.trade.side.counts_as_buy())
        .collect();
    let sell_count = bucket.trades.len() - buys.len();
    if sell_count > 0 {
        debug!(
            venue = %key.venue,
            pair = %key.pair,
            sells = sell_count,
            "bucket closed with sell trades excluded from buy volume"
        );
    }

    if buys.is_empty() {
        return None;
    }

    let total_quantity: f64 = buys.iter().map(|t| t.trade.quantity).sum();
    let buy_gross: f64 = buys.iter().map(|t| t.canonical_gross).sum();
    let quote_gross: f64 = buys.iter().map(|t| t.trade.gross).sum();

    let (avg_price, canonical_avg_price) = if total_quantity > 0.0 {
        (quote_gross / total_quantity, buy_gross / total_quantity)
    } else {
        (buys[0].trade.price, buys[0].canonical_price)
    };

    // Verify the volume-weighted average reproduces the summed gross. On
    // failure the summed gross stays authoritative for the alert.
    let recomputed = canonical_avg_price * total_quantity;
    let tolerance = Pair::XbtUsdt.gross_tolerance(buy_gross);
    if (recomputed - buy_gross).abs() > tolerance {
        error!(
            venue = %key.venue,
            pair = %key.pair,
            avg_price = canonical_avg_price,
            total_quantity,
            recomputed,
            summed = buy_gross,
            tolerance,
            "aggregation price calculation mismatch"
        );
    }

    if buy_gross < threshold {
        info!(
            venue = %key.venue,
            pair = %key.pair,
            buy_gross_usdt = buy_gross,
            threshold,
            trades = buys.len(),
            "aggregated trades below threshold"
        );
        return None;
    }

    info!(
        venue = %key.venue,
        pair = %key.pair,
        trades = buys.len(),
        quantity = total_quantity,
        buy_gross_usdt = buy_gross,
        "sending aggregated alert"
    );

    let breakdown: Vec<BreakdownEntry> = buys
        .iter()
        .take(BREAKDOWN_LIMIT)
        .map(|t| BreakdownEntry {
            quantity: t.trade.quantity,
            price: t.trade.price,
            canonical_price: t.canonical_price,
        })
        .collect();
    let breakdown_overflow = buys.len().saturating_sub(BREAKDOWN_LIMIT);
    let reference_rate = buys.iter().find_map(|t| t.reference_rate);

    Some(AlertRecord {
        pair: key.pair,
        kind: AlertKind::Aggregated,
        venue_label: key.venue.clone(),
        venue_url: buys[0].trade.venue_url.clone(),
        canonical_gross: buy_gross,
        quote_gross,
        quantity: total_quantity,
        weighted_avg_price: avg_price,
        canonical_avg_price,
        num_trades: buys.len(),
        breakdown,
        breakdown_overflow,
        reference_rate,
        latest_event_time_ms: bucket.latest_event_time_ms,
    })
}

// =============================================================================
// Engine task
// =============================================================================

/// Run the engine until shutdown: consume the fan-in channel, tick the
/// bucket sweeper once per second, drain open buckets on exit.
pub async fn run_engine(
    mut engine: AggregationEngine,
    mut trades: mpsc::Receiver<NormalizedTrade>,
    alerts: mpsc::Sender<AlertRecord>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("aggregation engine started");

    let mut tick = tokio::time::interval(std::time::Duration::from_secs(SWEEP_TICK_SECS));

    loop {
        tokio::select! {
            trade = trades.recv() => {
                match trade {
                    Some(trade) => {
                        if let Some(alert) = engine.handle_trade(trade) {
                            if alerts.send(alert).await.is_err() {
                                warn!("alert channel closed, stopping engine");
                                return;
                            }
                        }
                    }
                    None => {
                        warn!("trade channel closed, stopping engine");
                        break;
                    }
                }
            }
            _ = tick.tick() => {
                for alert in engine.sweep_expired(now_ms()) {
                    if alerts.send(alert).await.is_err() {
                        warn!("alert channel closed, stopping engine");
                        return;
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    for alert in engine.flush_all() {
        if alerts.send(alert).await.is_err() {
            break;
        }
    }

    info!("aggregation engine stopped");
}
