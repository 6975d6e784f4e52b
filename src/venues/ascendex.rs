// =============================================================================
// AscendEX Stream Adapter — channel subscription over WebSocket
// =============================================================================
//
// Subscribe with `{"op": "sub", "ch": "trades:XBT/USDT"}`; trades arrive as
// `{"m": "trades", "data": [{p, q, ts, bm}, ...]}` where `bm` is a boolean
// side flag (true = buy). AscendEX is the venue most prone to HTTP 429
// handshake rejections, which the shared backoff stretches to five minutes.
// =============================================================================

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::market_data::client::field_f64;
use crate::market_data::VenueId;
use crate::types::{now_ms, NormalizedTrade, Pair, Side, TradeEvent};

use super::{run_adapter, DedupFilter, StreamContext, Subscription};

pub const WS_URL: &str = "wss://ascendex.com/0/api/pro/v1/stream";
pub const MARKET_URL: &str = "https://ascendex.com/en/cashtrade-spottrading/usdt/xbt";

fn subscription() -> Subscription {
    Subscription {
        venue: VenueId::AscendEx,
        label: "AscendEX XBT/USDT trades",
        url: WS_URL,
        subscribe: json!({
            "op": "sub",
            "ch": "trades:XBT/USDT",
        }),
    }
}

/// Run the AscendEX trade adapter until shutdown.
pub async fn run_trades(ctx: StreamContext) {
    let mut dedup = DedupFilter::since(now_ms());
    run_adapter(subscription(), ctx, move |text| {
        parse_update(text, &mut dedup)
    })
    .await;
}

/// Parse one `trades` channel message into normalized trades.
fn parse_update(text: &str, dedup: &mut DedupFilter) -> Vec<NormalizedTrade> {
    let root: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "failed to parse AscendEX message");
            return Vec::new();
        }
    };

    if root.get("m").and_then(Value::as_str) != Some("trades") {
        return Vec::new();
    }

    let Some(data) = root.get("data").and_then(Value::as_array) else {
        warn!("AscendEX trades message missing data");
        return Vec::new();
    };

    let mut out = Vec::new();
    for raw in data {
        let Some(price) = field_f64(raw, "p") else {
            warn!("AscendEX trade missing p, skipping");
            continue;
        };
        let Some(quantity) = field_f64(raw, "q") else {
            warn!("AscendEX trade missing q, skipping");
            continue;
        };
        let Some(ts) = field_f64(raw, "ts") else {
            warn!("AscendEX trade missing ts, skipping");
            continue;
        };
        let event_time_ms = ts as i64;
        if price <= 0.0 || quantity <= 0.0 {
            warn!(price, quantity, "AscendEX trade with non-positive fields, skipping");
            continue;
        }

        if !dedup.accept(event_time_ms) {
            debug!(event_time_ms, "skipping replayed AscendEX trade");
            continue;
        }

        let side = raw
            .get("bm")
            .and_then(Value::as_bool)
            .map(Side::from_buy_flag)
            .unwrap_or(Side::Unknown);

        out.push(NormalizedTrade::native(TradeEvent {
            venue: VenueId::AscendEx.label().to_string(),
            pair: Pair::XbtUsdt,
            side,
            price,
            quantity,
            gross: price * quantity,
            event_time_ms,
            receive_time_ms: now_ms(),
            venue_url: MARKET_URL.to_string(),
        }));
    }

    out
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trades_message_parses_with_boolean_sides() {
        let mut dedup = DedupFilter::since(0);
        let msg = r#"{"m":"trades","symbol":"XBT/USDT","data":[
            {"p":"0.17","q":"100","ts":1700000000001,"bm":true,"seqnum":1},
            {"p":"0.17","q":"50","ts":1700000000002,"bm":false,"seqnum":2}
        ]}"#;

        let trades = parse_update(msg, &mut dedup);
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].trade.side, Side::Buy);
        assert_eq!(trades[1].trade.side, Side::Sell);
        assert_eq!(trades[0].trade.venue, "AscendEX");
        assert!((trades[0].canonical_gross - 17.0).abs() < 1e-9);
    }

    #[test]
    fn missing_flag_becomes_unknown() {
        let mut dedup = DedupFilter::since(0);
        let msg = r#"{"m":"trades","data":[{"p":"0.17","q":"100","ts":1700000000001}]}"#;
        let trades = parse_update(msg, &mut dedup);
        assert_eq!(trades[0].trade.side, Side::Unknown);
    }

    #[test]
    fn control_messages_are_ignored() {
        let mut dedup = DedupFilter::since(0);
        assert!(parse_update(r#"{"m":"ping","hp":3}"#, &mut dedup).is_empty());
        assert!(parse_update(r#"{"m":"sub","ch":"trades:XBT/USDT","code":0}"#, &mut dedup)
            .is_empty());
    }

    #[test]
    fn replay_after_reconnect_is_suppressed() {
        let mut dedup = DedupFilter::since(0);
        let msg = r#"{"m":"trades","data":[{"p":"0.17","q":"100","ts":1700000000001,"bm":true}]}"#;
        assert_eq!(parse_update(msg, &mut dedup).len(), 1);
        assert!(parse_update(msg, &mut dedup).is_empty());
    }
}
