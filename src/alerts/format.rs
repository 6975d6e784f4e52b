// =============================================================================
// Alert Formatting — HTML message blocks for Telegram delivery
// =============================================================================
//
// Formatting contract: USDT prices carry 6 fractional digits, BTC prices 8,
// quantities 4. Aggregated alerts list at most five member trades followed
// by a tail summary. Every alert ends with the market-context footer.
// =============================================================================

use chrono::{TimeZone, Utc};

use crate::types::{AlertKind, AlertRecord, MarketContext, Pair};

/// Format a price with the fractional digits of the pair's quote.
pub fn format_price(price: f64, pair: Pair) -> String {
    format!("{:.*}", pair.price_decimals(), price)
}

pub fn format_usdt_price(price: f64) -> String {
    format_price(price, Pair::XbtUsdt)
}

pub fn format_btc_price(price: f64) -> String {
    format_price(price, Pair::XbtBtc)
}

pub fn format_quantity(quantity: f64) -> String {
    format!("{quantity:.4}")
}

/// Group an amount's integer part with thousands separators, e.g.
/// `1234567.9` → `1,234,568`.
pub fn format_thousands(value: f64) -> String {
    let rounded = value.round() as i64;
    let digits = rounded.abs().to_string();
    let mut grouped = String::new();
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    if rounded < 0 {
        format!("-{grouped}")
    } else {
        grouped
    }
}

/// `HH:MM:SS UTC` from a millisecond epoch timestamp. Second-resolution
/// stamps are tolerated.
pub fn format_alert_time(timestamp: i64) -> String {
    let ms = if timestamp > 10_i64.pow(10) {
        timestamp
    } else {
        timestamp * 1000
    };
    match Utc.timestamp_millis_opt(ms).single() {
        Some(dt) => dt.format("%H:%M:%S UTC").to_string(),
        None => "unknown time".to_string(),
    }
}

/// Build the full HTML alert block for one record plus its market context.
pub fn format_alert_message(alert: &AlertRecord, context: &MarketContext) -> String {
    let mut lines: Vec<String> = Vec::new();

    let headline = match alert.kind {
        AlertKind::Aggregated => format!(
            "🚨 <b>{} BUY ALERT - {} Orders Aggregated</b> 🚨\n",
            alert.pair.symbol(),
            alert.num_trades
        ),
        AlertKind::Single => format!("🚨 <b>{} BUY ALERT</b> 🚨\n", alert.pair.symbol()),
    };
    lines.push(headline);

    let aggregated = alert.kind == AlertKind::Aggregated;
    let value_label = if aggregated { "Total Value" } else { "Value" };
    let quantity_label = if aggregated { "Total Quantity" } else { "Quantity" };
    let price_label = if aggregated { "Avg Price" } else { "Price" };

    match alert.pair {
        Pair::XbtUsdt => {
            lines.push(format!(
                "💰 <b>{value_label}:</b> ${} USDT",
                format_usdt_price(alert.canonical_gross)
            ));
            lines.push(format!(
                "📊 <b>{quantity_label}:</b> {} XBT",
                format_quantity(alert.quantity)
            ));
            lines.push(format!(
                "💵 <b>{price_label}:</b> ${} USDT",
                format_usdt_price(alert.weighted_avg_price)
            ));
        }
        Pair::XbtBtc => {
            lines.push(format!(
                "💰 <b>{value_label}:</b> {} BTC",
                format_btc_price(alert.quote_gross)
            ));
            lines.push(format!(
                "💵 <b>USDT Equivalent:</b> ≈ {} USDT",
                format_usdt_price(alert.canonical_gross)
            ));
            lines.push(format!(
                "📊 <b>{quantity_label}:</b> {} XBT",
                format_quantity(alert.quantity)
            ));
            lines.push(format!(
                "💵 <b>{price_label}:</b> {} BTC",
                format_btc_price(alert.weighted_avg_price)
            ));
            lines.push(format!(
                "💱 <b>USDT Equivalent:</b> ≈ {} USDT",
                format_usdt_price(alert.canonical_avg_price)
            ));
        }
    }

    lines.push(format!("🏦 <b>Exchange:</b> {}", alert.venue_label));
    lines.push(format!(
        "⏰ <b>Time:</b> {}",
        format_alert_time(alert.latest_event_time_ms)
    ));
    if let Some(rate) = alert.reference_rate {
        lines.push(format!("📈 <b>BTC Rate:</b> ${rate:.2} USDT"));
    }

    if aggregated && !alert.breakdown.is_empty() {
        lines.push(String::new());
        lines.push("📋 <b>Individual Orders:</b>".to_string());
        for (i, entry) in alert.breakdown.iter().enumerate() {
            let line = match alert.pair {
                Pair::XbtUsdt => format!(
                    "Order {}: {} XBT at ${} USDT",
                    i + 1,
                    format_quantity(entry.quantity),
                    format_usdt_price(entry.price)
                ),
                Pair::XbtBtc => format!(
                    "Order {}: {} XBT at {} BTC (≈ {} USDT)",
                    i + 1,
                    format_quantity(entry.quantity),
                    format_btc_price(entry.price),
                    format_usdt_price(entry.canonical_price)
                ),
            };
            lines.push(line);
        }
        if alert.breakdown_overflow > 0 {
            lines.push(format!(
                "... and {} more orders",
                alert.breakdown_overflow
            ));
        }
    }

    // Market context footer.
    lines.push(String::new());
    lines.push("📈 <b>Current Market:</b>".to_string());
    if let Some(price) = context.last_price_usdt {
        lines.push(format!(
            "💲 <b>XBT/USDT:</b> ${} USDT",
            format_usdt_price(price)
        ));
    }
    if let Some(cap) = context.market_cap {
        if cap > 0.0 {
            lines.push(format!("🏛️ <b>Market Cap:</b> ${}", format_thousands(cap)));
        }
    }
    lines.push(String::new());
    lines.push("📊 <b>Volume (24h periods):</b>".to_string());
    lines.push(format!("🕐 <b>15m:</b> {:.2} XBT", context.volume_15m));
    lines.push(format!("🕐 <b>1h:</b> {:.2} XBT", context.volume_1h));
    lines.push(format!("🕐 <b>4h:</b> {:.2} XBT", context.volume_4h));
    lines.push(format!("🕐 <b>24h:</b> {:.2} XBT", context.volume_24h));
    lines.push(String::new());
    lines.push("🔗 <b>Trade XBT:</b>".to_string());
    lines.push(
        "• <a href='https://nonkyc.io/market/XBT_USDT'>XBT/USDT on NonKYC</a>".to_string(),
    );
    lines.push(
        "• <a href='https://nonkyc.io/market/XBT_BTC'>XBT/BTC on NonKYC</a>".to_string(),
    );

    lines.join("\n")
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BreakdownEntry;

    fn context() -> MarketContext {
        MarketContext {
            last_price_usdt: Some(0.17),
            market_cap: Some(1_234_567.0),
            volume_15m: 12.34,
            volume_1h: 100.0,
            volume_4h: 400.5,
            volume_24h: 2400.25,
        }
    }

    fn single_usdt_alert() -> AlertRecord {
        AlertRecord {
            pair: Pair::XbtUsdt,
            kind: AlertKind::Single,
            venue_label: "NonKYC".to_string(),
            venue_url: "https://nonkyc.io/market/XBT_USDT".to_string(),
            canonical_gross: 166.434,
            quote_gross: 166.434,
            quantity: 1000.0,
            weighted_avg_price: 0.166434,
            canonical_avg_price: 0.166434,
            num_trades: 1,
            breakdown: Vec::new(),
            breakdown_overflow: 0,
            reference_rate: None,
            latest_event_time_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn price_formats_pin_decimal_contracts() {
        assert_eq!(format_usdt_price(0.166434), "0.166434");
        assert_eq!(format_usdt_price(0.1), "0.100000");
        assert_eq!(format_btc_price(0.00000164), "0.00000164");
        assert_eq!(format_quantity(1000.0), "1000.0000");
    }

    #[test]
    fn thousands_grouping() {
        assert_eq!(format_thousands(0.0), "0");
        assert_eq!(format_thousands(999.0), "999");
        assert_eq!(format_thousands(1_234_567.9), "1,234,568");
        assert_eq!(format_thousands(-12_000.0), "-12,000");
    }

    #[test]
    fn alert_time_renders_utc() {
        // 2023-11-14 22:13:20 UTC.
        assert_eq!(format_alert_time(1_700_000_000_000), "22:13:20 UTC");
        // Second-resolution stamps are scaled up.
        assert_eq!(format_alert_time(1_700_000_000), "22:13:20 UTC");
    }

    #[test]
    fn single_usdt_message_has_headline_and_values() {
        let msg = format_alert_message(&single_usdt_alert(), &context());
        assert!(msg.contains("<b>XBT/USDT BUY ALERT</b>"));
        assert!(!msg.contains("Aggregated"));
        assert!(msg.contains("💰 <b>Value:</b> $166.434000 USDT"));
        assert!(msg.contains("📊 <b>Quantity:</b> 1000.0000 XBT"));
        assert!(msg.contains("💵 <b>Price:</b> $0.166434 USDT"));
        assert!(msg.contains("🏦 <b>Exchange:</b> NonKYC"));
        assert!(msg.contains("22:13:20 UTC"));
    }

    #[test]
    fn footer_carries_market_context_and_links() {
        let msg = format_alert_message(&single_usdt_alert(), &context());
        assert!(msg.contains("💲 <b>XBT/USDT:</b> $0.170000 USDT"));
        assert!(msg.contains("🏛️ <b>Market Cap:</b> $1,234,568"));
        assert!(msg.contains("🕐 <b>15m:</b> 12.34 XBT"));
        assert!(msg.contains("🕐 <b>24h:</b> 2400.25 XBT"));
        assert!(msg.contains("XBT/USDT on NonKYC"));
        assert!(msg.contains("XBT/BTC on NonKYC"));
    }

    #[test]
    fn unknown_market_fields_are_omitted() {
        let ctx = MarketContext::default();
        let msg = format_alert_message(&single_usdt_alert(), &ctx);
        assert!(!msg.contains("Market Cap"));
        assert!(!msg.contains("💲"));
        // Volumes still render as zeros.
        assert!(msg.contains("🕐 <b>15m:</b> 0.00 XBT"));
    }

    #[test]
    fn aggregated_message_lists_orders_and_tail() {
        let mut alert = single_usdt_alert();
        alert.kind = AlertKind::Aggregated;
        alert.num_trades = 7;
        alert.breakdown = (0..5)
            .map(|i| BreakdownEntry {
                quantity: 100.0 + i as f64,
                price: 0.15,
                canonical_price: 0.15,
            })
            .collect();
        alert.breakdown_overflow = 2;

        let msg = format_alert_message(&alert, &context());
        assert!(msg.contains("<b>XBT/USDT BUY ALERT - 7 Orders Aggregated</b>"));
        assert!(msg.contains("💰 <b>Total Value:</b>"));
        assert!(msg.contains("💵 <b>Avg Price:</b>"));
        assert!(msg.contains("📋 <b>Individual Orders:</b>"));
        assert!(msg.contains("Order 1: 100.0000 XBT at $0.150000 USDT"));
        assert!(msg.contains("Order 5: 104.0000 XBT at $0.150000 USDT"));
        assert!(msg.contains("... and 2 more orders"));
    }

    #[test]
    fn btc_pair_message_shows_both_quotes_and_rate() {
        let alert = AlertRecord {
            pair: Pair::XbtBtc,
            kind: AlertKind::Single,
            venue_label: "NonKYC".to_string(),
            venue_url: "https://nonkyc.io/market/XBT_BTC".to_string(),
            canonical_gross: 11.726,
            quote_gross: 0.0001804,
            quantity: 110.0,
            weighted_avg_price: 0.00000164,
            canonical_avg_price: 0.1066,
            num_trades: 1,
            breakdown: Vec::new(),
            breakdown_overflow: 0,
            reference_rate: Some(65_000.0),
            latest_event_time_ms: 1_700_000_000_000,
        };

        let msg = format_alert_message(&alert, &context());
        assert!(msg.contains("<b>XBT/BTC BUY ALERT</b>"));
        assert!(msg.contains("💰 <b>Value:</b> 0.00018040 BTC"));
        assert!(msg.contains("💵 <b>USDT Equivalent:</b> ≈ 11.726000 USDT"));
        assert!(msg.contains("💵 <b>Price:</b> 0.00000164 BTC"));
        assert!(msg.contains("💱 <b>USDT Equivalent:</b> ≈ 0.106600 USDT"));
        assert!(msg.contains("📈 <b>BTC Rate:</b> $65000.00 USDT"));
    }
}
