// =============================================================================
// Shared types used across the XBT Sentinel pipeline
// =============================================================================

use serde::{Deserialize, Serialize};

/// Taker side of an observed trade.
///
/// Venues report this in several shapes; [`Side::parse`] normalises the
/// string forms and [`Side::from_buy_flag`] maps the boolean form used
/// by AscendEX.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
    Unknown,
}

impl Side {
    /// Normalise a venue-reported side string: `buy`/`b` and `sell`/`s`
    /// (case-insensitive), anything else is `Unknown`.
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "buy" | "b" => Self::Buy,
            "sell" | "s" => Self::Sell,
            _ => Self::Unknown,
        }
    }

    /// Map a boolean side flag (AscendEX `bm`): true is a buy.
    pub fn from_buy_flag(is_buy: bool) -> Self {
        if is_buy {
            Self::Buy
        } else {
            Self::Sell
        }
    }

    /// Whether this trade counts toward the buy-volume threshold.
    /// `Unknown` sides count as buys; some venues omit the side on
    /// rebroadcast and dropping them under-reports real buy pressure.
    pub fn counts_as_buy(self) -> bool {
        matches!(self, Self::Buy | Self::Unknown)
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// A traded pair. USDT is the canonical quote: thresholds and alert totals
/// are always expressed in USDT, and XBT/BTC trades are converted via the
/// live BTC/USDT reference rate before they reach the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Pair {
    XbtUsdt,
    XbtBtc,
}

impl Pair {
    /// Symbol in the `BASE/QUOTE` form used by alert headlines and logs.
    pub fn symbol(self) -> &'static str {
        match self {
            Self::XbtUsdt => "XBT/USDT",
            Self::XbtBtc => "XBT/BTC",
        }
    }

    /// Quote currency label.
    pub fn quote(self) -> &'static str {
        match self {
            Self::XbtUsdt => "USDT",
            Self::XbtBtc => "BTC",
        }
    }

    /// Whether the pair is already quoted in the canonical currency.
    pub fn is_canonical_quote(self) -> bool {
        matches!(self, Self::XbtUsdt)
    }

    /// Fractional digits used when formatting prices in this quote.
    pub fn price_decimals(self) -> usize {
        match self {
            Self::XbtUsdt => 6,
            Self::XbtBtc => 8,
        }
    }

    /// Smallest representable step of the quote currency (one cent for
    /// USDT, one satoshi for BTC).
    pub fn quote_ulp(self) -> f64 {
        match self {
            Self::XbtUsdt => 0.01,
            Self::XbtBtc => 1e-8,
        }
    }

    /// Tolerance for gross-value arithmetic in this quote:
    /// max(quote ulp, 0.1% of the expected gross).
    pub fn gross_tolerance(self, expected_gross: f64) -> f64 {
        let relative = expected_gross.abs() * 0.001;
        self.quote_ulp().max(relative)
    }
}

impl std::fmt::Display for Pair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

// =============================================================================
// Trade events
// =============================================================================

/// A single observed trade, canonicalised from a venue's wire shape.
#[derive(Debug, Clone, Serialize)]
pub struct TradeEvent {
    /// Venue label as shown in alerts, e.g. "NonKYC" or "CoinEx".
    pub venue: String,
    pub pair: Pair,
    pub side: Side,
    /// Price in the pair's quote currency.
    pub price: f64,
    /// Quantity in XBT.
    pub quantity: f64,
    /// price × quantity, in the pair's quote currency.
    pub gross: f64,
    /// Venue-reported trade time, ms since epoch. Monotonic per venue.
    pub event_time_ms: i64,
    /// Local wall-clock at receipt, ms since epoch.
    pub receive_time_ms: i64,
    /// Market page for the venue, used in alert links.
    pub venue_url: String,
}

impl TradeEvent {
    /// Validate `gross ≈ price × quantity` within the pair's tolerance.
    ///
    /// On violation, logs at error level and substitutes the recomputed
    /// value. The event is never dropped for an arithmetic mismatch.
    pub fn validate_gross(&mut self, context: &str) -> bool {
        let expected = self.price * self.quantity;
        let tolerance = self.pair.gross_tolerance(expected);
        if (self.gross - expected).abs() > tolerance {
            tracing::error!(
                context,
                pair = %self.pair,
                quote = self.pair.quote(),
                price = self.price,
                quantity = self.quantity,
                reported_gross = self.gross,
                expected_gross = expected,
                tolerance,
                "gross value mismatch, substituting computed value"
            );
            self.gross = expected;
            false
        } else {
            true
        }
    }
}

/// A [`TradeEvent`] carrying canonical-quote (USDT) values.
///
/// For native USDT trades the canonical fields equal the originals and
/// `reference_rate` is absent. For XBT/BTC trades they are the BTC values
/// multiplied by the BTC/USDT rate in effect when the trade arrived.
#[derive(Debug, Clone, Serialize)]
pub struct NormalizedTrade {
    pub trade: TradeEvent,
    pub canonical_price: f64,
    pub canonical_gross: f64,
    /// BTC/USDT rate used for the conversion, absent for native pairs.
    pub reference_rate: Option<f64>,
}

impl NormalizedTrade {
    /// Wrap a trade already quoted in the canonical currency.
    pub fn native(trade: TradeEvent) -> Self {
        let canonical_price = trade.price;
        let canonical_gross = trade.gross;
        Self {
            trade,
            canonical_price,
            canonical_gross,
            reference_rate: None,
        }
    }

    /// Convert a non-canonical trade using `rate` (canonical per quote unit).
    pub fn converted(trade: TradeEvent, rate: f64) -> Self {
        let canonical_price = trade.price * rate;
        let canonical_gross = canonical_price * trade.quantity;
        Self {
            trade,
            canonical_price,
            canonical_gross,
            reference_rate: Some(rate),
        }
    }
}

// =============================================================================
// Alerts
// =============================================================================

/// How an alert was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    /// One trade crossed the threshold with aggregation disabled.
    Single,
    /// A closed aggregation bucket crossed the threshold.
    Aggregated,
}

/// One member trade shown in an aggregated alert's breakdown.
#[derive(Debug, Clone, Serialize)]
pub struct BreakdownEntry {
    pub quantity: f64,
    /// Price in the pair's original quote.
    pub price: f64,
    /// USDT-equivalent price (equal to `price` for USDT pairs).
    pub canonical_price: f64,
}

/// The payload handed to the alert dispatcher. Side is implicitly buy:
/// sells never produce alerts.
#[derive(Debug, Clone, Serialize)]
pub struct AlertRecord {
    pub pair: Pair,
    pub kind: AlertKind,
    pub venue_label: String,
    pub venue_url: String,
    /// Total value in the canonical quote (USDT).
    pub canonical_gross: f64,
    /// Total value in the pair's own quote (equals `canonical_gross` for
    /// USDT pairs).
    pub quote_gross: f64,
    pub quantity: f64,
    /// Volume-weighted average price in the pair's own quote.
    pub weighted_avg_price: f64,
    /// Volume-weighted average price in USDT.
    pub canonical_avg_price: f64,
    pub num_trades: usize,
    /// Up to the first five member trades of an aggregated alert.
    pub breakdown: Vec<BreakdownEntry>,
    /// Member trades beyond the breakdown limit.
    pub breakdown_overflow: usize,
    /// BTC/USDT rate used, for cross-pair alerts.
    pub reference_rate: Option<f64>,
    /// Timestamp shown on the alert, ms since epoch.
    pub latest_event_time_ms: i64,
}

/// Market snapshot appended to every alert, fetched at dispatch time.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MarketContext {
    /// Current XBT/USDT last price, if the ticker was reachable.
    pub last_price_usdt: Option<f64>,
    /// Market cap in USD, if known.
    pub market_cap: Option<f64>,
    /// Combined venue volume in XBT over trailing windows.
    pub volume_15m: f64,
    pub volume_1h: f64,
    pub volume_4h: f64,
    pub volume_24h: f64,
}

/// Current wall-clock in milliseconds since the epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_parse_normalises_known_forms() {
        assert_eq!(Side::parse("buy"), Side::Buy);
        assert_eq!(Side::parse("B"), Side::Buy);
        assert_eq!(Side::parse("sell"), Side::Sell);
        assert_eq!(Side::parse("S"), Side::Sell);
        assert_eq!(Side::parse("BUY"), Side::Buy);
        assert_eq!(Side::parse(""), Side::Unknown);
        assert_eq!(Side::parse("bid"), Side::Unknown);
    }

    #[test]
    fn buy_flag_maps_to_side() {
        assert_eq!(Side::from_buy_flag(true), Side::Buy);
        assert_eq!(Side::from_buy_flag(false), Side::Sell);
    }

    #[test]
    fn unknown_counts_toward_buy_volume() {
        assert!(Side::Buy.counts_as_buy());
        assert!(Side::Unknown.counts_as_buy());
        assert!(!Side::Sell.counts_as_buy());
    }

    #[test]
    fn tolerance_floors_at_quote_ulp() {
        // Tiny USDT gross: relative part is below one cent.
        assert!((Pair::XbtUsdt.gross_tolerance(1.0) - 0.01).abs() < f64::EPSILON);
        // Tiny BTC gross: floors at one satoshi.
        assert!((Pair::XbtBtc.gross_tolerance(1e-6) - 1e-8).abs() < 1e-12);
    }

    #[test]
    fn tolerance_scales_with_large_gross() {
        // 0.1% of 100_000 USDT = 100.
        assert!((Pair::XbtUsdt.gross_tolerance(100_000.0) - 100.0).abs() < 1e-9);
        // 0.1% of 2 BTC = 0.002.
        assert!((Pair::XbtBtc.gross_tolerance(2.0) - 0.002).abs() < 1e-12);
    }

    fn event(pair: Pair, price: f64, quantity: f64, gross: f64) -> TradeEvent {
        TradeEvent {
            venue: "NonKYC".to_string(),
            pair,
            side: Side::Buy,
            price,
            quantity,
            gross,
            event_time_ms: 1_700_000_000_000,
            receive_time_ms: 1_700_000_000_050,
            venue_url: "https://nonkyc.io/market/XBT_USDT".to_string(),
        }
    }

    #[test]
    fn consistent_gross_passes_validation() {
        let mut ev = event(Pair::XbtUsdt, 0.166434, 1000.0, 166.434);
        assert!(ev.validate_gross("test"));
        assert!((ev.gross - 166.434).abs() < 1e-9);
    }

    #[test]
    fn inflated_gross_is_replaced_with_computed_value() {
        let mut ev = event(Pair::XbtUsdt, 0.15, 100.0, 150.0);
        assert!(!ev.validate_gross("test"));
        assert!((ev.gross - 15.0).abs() < 1e-9);
    }

    #[test]
    fn btc_gross_validated_at_satoshi_precision() {
        let mut ev = event(Pair::XbtBtc, 0.00000164, 110.0, 0.0001804);
        assert!(ev.validate_gross("test"));
        // Off by well over the 0.1% tolerance on an 18 040 satoshi gross.
        let mut bad = event(Pair::XbtBtc, 0.00000164, 110.0, 0.00018240);
        assert!(!bad.validate_gross("test"));
        assert!((bad.gross - 0.0001804).abs() < 1e-12);
    }

    #[test]
    fn native_normalisation_is_identity() {
        let ev = event(Pair::XbtUsdt, 0.2, 500.0, 100.0);
        let norm = NormalizedTrade::native(ev);
        assert!((norm.canonical_price - 0.2).abs() < f64::EPSILON);
        assert!((norm.canonical_gross - 100.0).abs() < f64::EPSILON);
        assert!(norm.reference_rate.is_none());
    }

    #[test]
    fn btc_trade_converts_through_reference_rate() {
        let ev = event(Pair::XbtBtc, 0.00000164, 110.0, 0.00000164 * 110.0);
        let norm = NormalizedTrade::converted(ev, 65_000.0);
        assert!((norm.canonical_price - 0.1066).abs() < 1e-9);
        assert!((norm.canonical_gross - 11.726).abs() < 1e-9);
        assert_eq!(norm.reference_rate, Some(65_000.0));
    }
}
