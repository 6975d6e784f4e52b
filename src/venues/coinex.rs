// =============================================================================
// CoinEx Stream Adapter — deals.subscribe over WebSocket
// =============================================================================
//
// Subscribe with `{"method": "deals.subscribe", "params": ["XBTUSDT"]}`;
// trades arrive as `{"method": "deals.update", "params": [market, [...]]}`
// where each deal is `{price, amount, date_ms, type}`.
// =============================================================================

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::market_data::client::field_f64;
use crate::market_data::VenueId;
use crate::types::{now_ms, NormalizedTrade, Pair, Side, TradeEvent};

use super::{run_adapter, DedupFilter, StreamContext, Subscription};

pub const WS_URL: &str = "wss://socket.coinex.com/";
pub const MARKET_URL: &str = "https://www.coinex.com/exchange/XBT-USDT";

fn subscription() -> Subscription {
    Subscription {
        venue: VenueId::CoinEx,
        label: "CoinEx XBT/USDT trades",
        url: WS_URL,
        subscribe: json!({
            "method": "deals.subscribe",
            "params": ["XBTUSDT"],
            "id": 2,
        }),
    }
}

/// Run the CoinEx trade adapter until shutdown.
pub async fn run_trades(ctx: StreamContext) {
    let mut dedup = DedupFilter::since(now_ms());
    run_adapter(subscription(), ctx, move |text| {
        parse_update(text, &mut dedup)
    })
    .await;
}

/// Parse one `deals.update` message into normalized trades.
fn parse_update(text: &str, dedup: &mut DedupFilter) -> Vec<NormalizedTrade> {
    let root: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "failed to parse CoinEx message");
            return Vec::new();
        }
    };

    if root.get("method").and_then(Value::as_str) != Some("deals.update") {
        return Vec::new();
    }

    // params: [market, [deal, ...]]
    let Some(deals) = root
        .pointer("/params/1")
        .and_then(Value::as_array)
    else {
        warn!("CoinEx deals.update message missing deal list");
        return Vec::new();
    };

    let mut out = Vec::new();
    for raw in deals {
        let Some(price) = field_f64(raw, "price") else {
            warn!("CoinEx deal missing price, skipping");
            continue;
        };
        let Some(quantity) = field_f64(raw, "amount") else {
            warn!("CoinEx deal missing amount, skipping");
            continue;
        };
        let Some(ts) = field_f64(raw, "date_ms") else {
            warn!("CoinEx deal missing date_ms, skipping");
            continue;
        };
        let event_time_ms = ts as i64;
        if price <= 0.0 || quantity <= 0.0 {
            warn!(price, quantity, "CoinEx deal with non-positive fields, skipping");
            continue;
        }

        if !dedup.accept(event_time_ms) {
            debug!(event_time_ms, "skipping replayed CoinEx deal");
            continue;
        }

        let side = raw
            .get("type")
            .and_then(Value::as_str)
            .map(Side::parse)
            .unwrap_or(Side::Unknown);

        out.push(NormalizedTrade::native(TradeEvent {
            venue: VenueId::CoinEx.label().to_string(),
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
    fn deal_update_parses_buy_and_sell() {
        let mut dedup = DedupFilter::since(0);
        let msg = r#"{"method":"deals.update","params":["XBTUSDT",[
            {"price":"0.17","amount":"500","date_ms":1700000000001,"type":"buy"},
            {"price":"0.16","amount":"100","date_ms":1700000000002,"type":"sell"}
        ]],"id":null}"#;

        let trades = parse_update(msg, &mut dedup);
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].trade.side, Side::Buy);
        assert!((trades[0].canonical_gross - 85.0).abs() < 1e-9);
        assert_eq!(trades[1].trade.side, Side::Sell);
        assert_eq!(trades[0].trade.venue, "CoinEx");
        assert_eq!(trades[0].trade.pair, Pair::XbtUsdt);
    }

    #[test]
    fn subscribe_ack_is_ignored() {
        let mut dedup = DedupFilter::since(0);
        let msg = r#"{"error":null,"result":{"status":"success"},"id":2}"#;
        assert!(parse_update(msg, &mut dedup).is_empty());
    }

    #[test]
    fn out_of_order_deals_are_dropped() {
        let mut dedup = DedupFilter::since(0);
        let newer = r#"{"method":"deals.update","params":["XBTUSDT",[
            {"price":"0.17","amount":"1","date_ms":1700000000005,"type":"buy"}
        ]],"id":null}"#;
        let older = r#"{"method":"deals.update","params":["XBTUSDT",[
            {"price":"0.17","amount":"1","date_ms":1700000000004,"type":"buy"}
        ]],"id":null}"#;

        assert_eq!(parse_update(newer, &mut dedup).len(), 1);
        assert!(parse_update(older, &mut dedup).is_empty());
    }

    #[test]
    fn malformed_deals_are_skipped() {
        let mut dedup = DedupFilter::since(0);
        let msg = r#"{"method":"deals.update","params":["XBTUSDT",[
            {"amount":"1","date_ms":1700000000001,"type":"buy"},
            {"price":"-1","amount":"1","date_ms":1700000000002,"type":"buy"},
            {"price":"0.2","amount":"2","date_ms":1700000000003,"type":"buy"}
        ]],"id":null}"#;

        let trades = parse_update(msg, &mut dedup);
        assert_eq!(trades.len(), 1);
        assert!((trades[0].trade.quantity - 2.0).abs() < 1e-9);
    }
}
