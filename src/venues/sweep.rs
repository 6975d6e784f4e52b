// =============================================================================
// NonKYC Order-Book Sweep Detector — synthetic buys from consumed asks
// =============================================================================
//
// A parallel subscription mirrors the XBT/USDT order book. Snapshots replace
// the mirror, incremental updates apply in sequence order, and a sequence
// gap aborts the connection so the resubscribe delivers a fresh snapshot.
//
// On a fixed cadence the detector compares the current ask side with the
// previous sample. When at least `min_orders_filled` levels below the new
// best ask have been consumed and their summed value reaches `min_value`,
// one synthetic buy trade is emitted whose price is the volume-weighted
// average of the swept levels. It flows through the same engine path as real
// trades, under its own venue label so it aggregates separately.
// =============================================================================

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::config::ConfigStore;
use crate::market_data::client::field_f64;
use crate::market_data::VenueId;
use crate::types::{now_ms, NormalizedTrade, Pair, Side, TradeEvent};

use super::backoff::is_rate_limit_error;
use super::{nonkyc, sleep_unless_shutdown, wait_until_available, Backoff, StreamContext};

/// Venue label for synthetic sweep trades. Distinct from plain "NonKYC" so
/// sweeps and regular trades aggregate into separate buckets.
pub const SWEEP_VENUE_LABEL: &str = "NonKYC (Orderbook Sweep)";

const RECV_TIMEOUT_SECS: u64 = 5;

/// One price level on the ask side.
#[derive(Debug, Clone, PartialEq)]
pub struct AskLevel {
    pub price: f64,
    pub quantity: f64,
}

/// Mirror of the venue's ask side, ordered by ascending price.
#[derive(Debug, Default)]
pub struct AskBook {
    sequence: u64,
    asks: Vec<AskLevel>,
    /// False until the first snapshot arrives.
    synced: bool,
}

impl AskBook {
    /// Replace the mirror from a `snapshotOrderbook` payload.
    pub fn apply_snapshot(&mut self, params: &Value) {
        self.sequence = params.get("sequence").and_then(Value::as_u64).unwrap_or(0);
        self.asks = parse_levels(params.get("asks"));
        self.synced = true;
        debug!(sequence = self.sequence, levels = self.asks.len(), "orderbook snapshot applied");
    }

    /// Apply an `updateOrderbook` payload.
    ///
    /// Stale updates are ignored; a gap beyond `sequence + 1` returns an
    /// error so the caller can reconnect for a fresh snapshot.
    pub fn apply_update(&mut self, params: &Value) -> Result<()> {
        if !self.synced {
            // Updates may race the snapshot right after subscribing.
            return Ok(());
        }

        let sequence = params.get("sequence").and_then(Value::as_u64).unwrap_or(0);
        if sequence <= self.sequence {
            return Ok(());
        }
        if sequence > self.sequence + 1 {
            bail!(
                "orderbook sequence gap: have {}, got {}",
                self.sequence,
                sequence
            );
        }

        for level in parse_levels(params.get("asks")) {
            match self
                .asks
                .iter()
                .position(|l| (l.price - level.price).abs() < f64::EPSILON)
            {
                Some(idx) if level.quantity <= 0.0 => {
                    self.asks.remove(idx);
                }
                Some(idx) => self.asks[idx] = level,
                None if level.quantity > 0.0 => self.asks.push(level),
                None => {}
            }
        }
        self.asks
            .sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal));
        self.sequence = sequence;
        Ok(())
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn sample(&self) -> Vec<AskLevel> {
        self.asks.clone()
    }
}

fn parse_levels(raw: Option<&Value>) -> Vec<AskLevel> {
    raw.and_then(Value::as_array)
        .map(|levels| {
            levels
                .iter()
                .filter_map(|l| {
                    let price = field_f64(l, "price")?;
                    let quantity = field_f64(l, "quantity")?;
                    (price > 0.0).then_some(AskLevel { price, quantity })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Summary of one detected sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepSummary {
    pub levels: usize,
    pub quantity: f64,
    pub value: f64,
    pub vwap: f64,
}

/// Compare two ask samples and report a sweep when enough whole levels in
/// front of the new best ask were consumed.
pub fn detect_sweep(
    previous: &[AskLevel],
    current: &[AskLevel],
    min_orders_filled: u32,
    min_value: f64,
) -> Option<SweepSummary> {
    if previous.is_empty() {
        return None;
    }

    // Everything strictly in front of the new best ask is gone from the
    // book. An emptied ask side counts wholesale.
    let swept: Vec<&AskLevel> = match current.first() {
        Some(best) => previous.iter().filter(|l| l.price < best.price).collect(),
        None => previous.iter().collect(),
    };

    if (swept.len() as u32) < min_orders_filled {
        return None;
    }

    let quantity: f64 = swept.iter().map(|l| l.quantity).sum();
    let value: f64 = swept.iter().map(|l| l.price * l.quantity).sum();
    if quantity <= 0.0 || value < min_value {
        return None;
    }

    Some(SweepSummary {
        levels: swept.len(),
        quantity,
        value,
        vwap: value / quantity,
    })
}

// =============================================================================
// Stream loop
// =============================================================================

/// Run the sweep detector until shutdown. Connection lifecycle matches the
/// trade adapters: availability gate, reconnect with shared backoff.
pub async fn run_sweep_detector(config: Arc<ConfigStore>, mut ctx: StreamContext) {
    if !wait_until_available(VenueId::NonKyc, &mut ctx).await {
        return;
    }

    let mut backoff = Backoff::new();

    loop {
        if ctx.shutting_down() || ctx.trades.is_closed() {
            break;
        }

        match run_book_stream(&config, &mut ctx, &mut backoff).await {
            Ok(()) => {
                if ctx.shutting_down() || ctx.trades.is_closed() {
                    break;
                }
                let delay = backoff.next_delay();
                info!(delay_s = delay.as_secs(), "reconnecting orderbook stream");
                if !sleep_unless_shutdown(delay, &mut ctx.shutdown).await {
                    break;
                }
            }
            Err(e) if is_rate_limit_error(&e) => {
                let (delay, first) = backoff.next_delay_rate_limited();
                if first {
                    warn!(error = %e, delay_s = delay.as_secs(),
                        "orderbook stream rate limited, extending backoff");
                }
                if !sleep_unless_shutdown(delay, &mut ctx.shutdown).await {
                    break;
                }
            }
            Err(e) => {
                error!(error = format!("{e:#}"), "orderbook stream failed");
                let delay = backoff.next_delay();
                info!(delay_s = delay.as_secs(), "reconnecting orderbook stream");
                if !sleep_unless_shutdown(delay, &mut ctx.shutdown).await {
                    break;
                }
            }
        }
    }

    info!("sweep detector stopped");
}

/// One connection lifetime of the orderbook mirror plus the detection tick.
async fn run_book_stream(
    config: &Arc<ConfigStore>,
    ctx: &mut StreamContext,
    backoff: &mut Backoff,
) -> Result<()> {
    let (ws_stream, _response) = connect_async(nonkyc::WS_URL)
        .await
        .context("failed to connect to NonKYC orderbook stream")?;

    let (mut write, mut read) = ws_stream.split();

    let subscribe = json!({
        "method": "subscribeOrderbook",
        "params": { "symbol": "XBT/USDT" },
        "id": 4,
    });
    write
        .send(Message::Text(subscribe.to_string()))
        .await
        .context("failed to subscribe to orderbook")?;
    info!("subscribed to XBT/USDT orderbook for sweep detection");

    backoff.reset();

    let mut book = AskBook::default();
    let mut previous_sample: Option<Vec<AskLevel>> = None;

    let check_interval = config.snapshot().sweep_orders.check_interval.max(1);
    let mut tick =
        tokio::time::interval(std::time::Duration::from_secs(check_interval));

    loop {
        tokio::select! {
            next = tokio::time::timeout(
                std::time::Duration::from_secs(RECV_TIMEOUT_SECS),
                read.next(),
            ) => {
                match next {
                    Ok(Some(Ok(Message::Text(text)))) => {
                        handle_book_message(&text, &mut book)?;
                    }
                    Ok(Some(Ok(Message::Ping(data)))) => {
                        write
                            .send(Message::Pong(data))
                            .await
                            .context("failed to answer ping")?;
                    }
                    Ok(Some(Ok(_))) => {}
                    Ok(Some(Err(e))) => {
                        return Err(anyhow::Error::from(e))
                            .context("orderbook stream read error");
                    }
                    Ok(None) => {
                        warn!("orderbook stream ended");
                        return Ok(());
                    }
                    Err(_elapsed) => {
                        write
                            .send(Message::Ping(Vec::new()))
                            .await
                            .context("failed to ping orderbook stream")?;
                    }
                }
            }
            _ = tick.tick() => {
                let sweep_cfg = config.snapshot().sweep_orders;
                if !sweep_cfg.enabled || !book.is_synced() {
                    previous_sample = None;
                    continue;
                }

                let current = book.sample();
                if let Some(prev) = previous_sample.replace(current.clone()) {
                    if let Some(sweep) = detect_sweep(
                        &prev,
                        &current,
                        sweep_cfg.min_orders_filled,
                        sweep_cfg.min_value,
                    ) {
                        info!(
                            levels = sweep.levels,
                            quantity = sweep.quantity,
                            value = sweep.value,
                            vwap = sweep.vwap,
                            "ask sweep detected"
                        );
                        let event = synthetic_sweep_trade(&sweep);
                        if ctx.trades.send(event).await.is_err() {
                            warn!("trade channel closed, ending orderbook stream");
                            return Ok(());
                        }
                    }
                }
            }
            _ = ctx.shutdown.changed() => {
                if *ctx.shutdown.borrow() {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
        }
    }
}

fn handle_book_message(text: &str, book: &mut AskBook) -> Result<()> {
    let root: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "failed to parse orderbook message");
            return Ok(());
        }
    };

    let Some(params) = root.get("params") else {
        return Ok(());
    };

    match root.get("method").and_then(Value::as_str) {
        Some("snapshotOrderbook") => book.apply_snapshot(params),
        Some("updateOrderbook") => book.apply_update(params)?,
        _ => {}
    }

    Ok(())
}

fn synthetic_sweep_trade(sweep: &SweepSummary) -> NormalizedTrade {
    let now = now_ms();
    NormalizedTrade::native(TradeEvent {
        venue: SWEEP_VENUE_LABEL.to_string(),
        pair: Pair::XbtUsdt,
        side: Side::Buy,
        price: sweep.vwap,
        quantity: sweep.quantity,
        gross: sweep.value,
        event_time_ms: now,
        receive_time_ms: now,
        venue_url: nonkyc::market_url(Pair::XbtUsdt).to_string(),
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn level(price: f64, quantity: f64) -> AskLevel {
        AskLevel { price, quantity }
    }

    fn snapshot(sequence: u64, asks: &[(f64, f64)]) -> Value {
        let asks: Vec<Value> = asks
            .iter()
            .map(|(p, q)| json!({"price": p.to_string(), "quantity": q.to_string()}))
            .collect();
        json!({"symbol": "XBT/USDT", "sequence": sequence, "asks": asks, "bids": []})
    }

    #[test]
    fn snapshot_replaces_the_mirror() {
        let mut book = AskBook::default();
        assert!(!book.is_synced());
        book.apply_snapshot(&snapshot(10, &[(0.15, 500.0), (0.16, 300.0)]));
        assert!(book.is_synced());
        assert_eq!(book.sample().len(), 2);
        assert_eq!(book.sequence, 10);
    }

    #[test]
    fn update_applies_in_sequence_and_removes_emptied_levels() {
        let mut book = AskBook::default();
        book.apply_snapshot(&snapshot(10, &[(0.15, 500.0), (0.16, 300.0)]));

        // Level at 0.15 fully consumed, new level appears at 0.17.
        let update = snapshot(11, &[(0.15, 0.0), (0.17, 200.0)]);
        book.apply_update(&update).unwrap();

        let asks = book.sample();
        assert_eq!(asks, vec![level(0.16, 300.0), level(0.17, 200.0)]);
    }

    #[test]
    fn stale_update_is_ignored() {
        let mut book = AskBook::default();
        book.apply_snapshot(&snapshot(10, &[(0.15, 500.0)]));
        book.apply_update(&snapshot(9, &[(0.15, 0.0)])).unwrap();
        assert_eq!(book.sample(), vec![level(0.15, 500.0)]);
    }

    #[test]
    fn sequence_gap_is_an_error() {
        let mut book = AskBook::default();
        book.apply_snapshot(&snapshot(10, &[(0.15, 500.0)]));
        assert!(book.apply_update(&snapshot(12, &[(0.15, 0.0)])).is_err());
    }

    #[test]
    fn sweep_vwap_matches_consumed_levels() {
        let previous = vec![
            level(0.15, 500.0),
            level(0.16, 300.0),
            level(0.17, 200.0),
            level(0.18, 100.0),
        ];
        // Everything below 0.17 was consumed.
        let current = vec![level(0.17, 200.0), level(0.18, 100.0)];

        let sweep = detect_sweep(&previous, &current, 2, 80.0).expect("sweep expected");
        assert_eq!(sweep.levels, 2);
        assert!((sweep.quantity - 800.0).abs() < 1e-9);
        assert!((sweep.value - 123.0).abs() < 1e-9);
        assert!((sweep.vwap - 123.0 / 800.0).abs() < 1e-12);
        // VWAP × quantity reproduces the swept value.
        assert!((sweep.vwap * sweep.quantity - sweep.value).abs() < 0.01);
    }

    #[test]
    fn too_few_levels_is_not_a_sweep() {
        let previous = vec![level(0.15, 500.0), level(0.16, 300.0)];
        let current = vec![level(0.16, 300.0)];
        assert!(detect_sweep(&previous, &current, 2, 10.0).is_none());
    }

    #[test]
    fn small_value_is_not_a_sweep() {
        let previous = vec![level(0.15, 1.0), level(0.16, 1.0), level(0.17, 100.0)];
        let current = vec![level(0.17, 100.0)];
        // Two levels consumed but only ~0.31 USDT of value.
        assert!(detect_sweep(&previous, &current, 2, 80.0).is_none());
    }

    #[test]
    fn emptied_ask_side_counts_wholesale() {
        let previous = vec![level(0.15, 500.0), level(0.16, 300.0)];
        let sweep = detect_sweep(&previous, &[], 2, 80.0).expect("sweep expected");
        assert_eq!(sweep.levels, 2);
        assert!((sweep.value - 123.0).abs() < 1e-9);
    }

    #[test]
    fn synthetic_trade_carries_sweep_label_and_buy_side() {
        let sweep = SweepSummary {
            levels: 2,
            quantity: 800.0,
            value: 123.0,
            vwap: 123.0 / 800.0,
        };
        let trade = synthetic_sweep_trade(&sweep);
        assert_eq!(trade.trade.venue, SWEEP_VENUE_LABEL);
        assert_eq!(trade.trade.side, Side::Buy);
        assert_eq!(trade.trade.pair, Pair::XbtUsdt);
        assert!((trade.canonical_gross - 123.0).abs() < 1e-9);
    }
}
