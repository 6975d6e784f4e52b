// =============================================================================
// NonKYC Stream Adapter — JSON-RPC trades over WebSocket
// =============================================================================
//
// Subscribe with `{"method": "subscribeTrades", "params": {"symbol": ...}}`;
// trades arrive as `{"method": "updateTrades", "params": {"data": [...]}}`.
// The venue runs both the XBT/USDT and XBT/BTC markets; the BTC stream
// values its trades in USDT through the cached reference rate before they
// reach the engine.
// =============================================================================

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::market_data::client::field_f64;
use crate::market_data::{ReferenceRateCache, VenueId};
use crate::types::{now_ms, NormalizedTrade, Pair, Side, TradeEvent};

use super::{run_adapter, DedupFilter, StreamContext, Subscription};

pub const WS_URL: &str = "wss://ws.nonkyc.io";

const USDT_MARKET_URL: &str = "https://nonkyc.io/market/XBT_USDT";
const BTC_MARKET_URL: &str = "https://nonkyc.io/market/XBT_BTC";

/// Market page linked from alerts for `pair`.
pub fn market_url(pair: Pair) -> &'static str {
    match pair {
        Pair::XbtUsdt => USDT_MARKET_URL,
        Pair::XbtBtc => BTC_MARKET_URL,
    }
}

fn subscription(pair: Pair) -> Subscription {
    let (symbol, label, id) = match pair {
        Pair::XbtUsdt => ("XBT/USDT", "NonKYC XBT/USDT trades", 1),
        Pair::XbtBtc => ("XBT/BTC", "NonKYC XBT/BTC trades", 3),
    };
    Subscription {
        venue: VenueId::NonKyc,
        label,
        url: WS_URL,
        subscribe: json!({
            "method": "subscribeTrades",
            "params": { "symbol": symbol },
            "id": id,
        }),
    }
}

/// Run the NonKYC trade adapter for `pair` until shutdown.
pub async fn run_trades(pair: Pair, ctx: StreamContext) {
    // Warm the reference rate before the first cross-quote trade can arrive.
    if !pair.is_canonical_quote() {
        ctx.rates.ensure().await;
    }

    let mut dedup = DedupFilter::since(now_ms());
    let rates = ctx.rates.clone();
    let sub = subscription(pair);

    run_adapter(sub, ctx, move |text| {
        parse_update(pair, text, &mut dedup, &rates)
    })
    .await;
}

/// Parse one `updateTrades` message into normalized trades, applying
/// duplicate suppression and cross-pair conversion.
fn parse_update(
    pair: Pair,
    text: &str,
    dedup: &mut DedupFilter,
    rates: &ReferenceRateCache,
) -> Vec<NormalizedTrade> {
    let root: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "failed to parse NonKYC message");
            return Vec::new();
        }
    };

    if root.get("method").and_then(Value::as_str) != Some("updateTrades") {
        return Vec::new();
    }

    let Some(data) = root
        .pointer("/params/data")
        .and_then(Value::as_array)
    else {
        warn!("NonKYC updateTrades message missing params.data");
        return Vec::new();
    };

    let mut out = Vec::new();
    for raw in data {
        let Some(price) = field_f64(raw, "price") else {
            warn!("NonKYC trade missing price, skipping");
            continue;
        };
        let Some(quantity) = field_f64(raw, "quantity") else {
            warn!("NonKYC trade missing quantity, skipping");
            continue;
        };
        let Some(timestamp) = field_f64(raw, "timestamp") else {
            warn!("NonKYC trade missing timestamp, skipping");
            continue;
        };
        let event_time_ms = timestamp as i64;
        if price <= 0.0 || quantity <= 0.0 {
            warn!(price, quantity, "NonKYC trade with non-positive fields, skipping");
            continue;
        }

        if !dedup.accept(event_time_ms) {
            debug!(event_time_ms, "skipping replayed NonKYC trade");
            continue;
        }

        let side = raw
            .get("side")
            .and_then(Value::as_str)
            .map(Side::parse)
            .unwrap_or(Side::Unknown);

        let trade = TradeEvent {
            venue: VenueId::NonKyc.label().to_string(),
            pair,
            side,
            price,
            quantity,
            gross: price * quantity,
            event_time_ms,
            receive_time_ms: now_ms(),
            venue_url: market_url(pair).to_string(),
        };

        if pair.is_canonical_quote() {
            out.push(NormalizedTrade::native(trade));
        } else {
            match rates.current() {
                Some(rate) => out.push(NormalizedTrade::converted(trade, rate)),
                None => {
                    // Never value a cross-quote trade with a guessed rate.
                    warn!(
                        pair = %pair,
                        price,
                        quantity,
                        "dropping trade: BTC/USDT reference rate unavailable"
                    );
                }
            }
        }
    }

    out
}
