// =============================================================================
// Market Data Client — read-only REST access to venue endpoints
// =============================================================================
//
// Snapshots only: ticker, recent trades, reference-asset ticker. Every call
// has a bounded 10 s timeout and classifies its failure so that callers can
// pick a policy. No retries happen at this layer.
// =============================================================================

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Bounded timeout for every REST call.
const HTTP_TIMEOUT_SECS: u64 = 10;

/// Classified failure of a market-data call.
#[derive(Debug, Error)]
pub enum MarketDataError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("rate limited (HTTP 429)")]
    RateLimited,

    #[error("authentication failed (HTTP 401)")]
    AuthFailed,

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for MarketDataError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Connection(err.to_string())
        }
    }
}

/// Parsed ticker snapshot for a single market.
#[derive(Debug, Clone)]
pub struct TickerSnapshot {
    pub last_price: f64,
    /// 24 h base-asset volume, when the venue reports one.
    pub volume_24h: Option<f64>,
    /// Market cap in USD, when the venue reports one.
    pub market_cap: Option<f64>,
}

/// One historical trade from a venue's recent-trades endpoint. Only the
/// fields needed for rolling-volume math are kept.
#[derive(Debug, Clone)]
pub struct RecentTrade {
    pub quantity: f64,
    pub timestamp_ms: i64,
}

/// REST client shared by the availability probe, the reference-rate cache,
/// the threshold controller, and alert enrichment.
pub struct MarketDataClient {
    client: reqwest::Client,
    nonkyc_base: String,
    coinex_base: String,
    ascendex_base: String,
}

impl MarketDataClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");

        Self {
            client,
            nonkyc_base: "https://api.nonkyc.io".to_string(),
            coinex_base: "https://api.coinex.com".to_string(),
            ascendex_base: "https://ascendex.com".to_string(),
        }
    }

    // -------------------------------------------------------------------------
    // NonKYC
    // -------------------------------------------------------------------------

    /// GET /api/v2/market/ticker/{market}, e.g. `XBT_USDT` or `BTC_USDT`.
    #[instrument(skip(self), name = "market_data::nonkyc_ticker")]
    pub async fn nonkyc_ticker(&self, market: &str) -> Result<TickerSnapshot, MarketDataError> {
        let url = format!("{}/api/v2/market/ticker/{}", self.nonkyc_base, market);
        let body = self.get_json(&url).await?;

        let last_price = field_f64(&body, "lastPriceNumber")
            .ok_or_else(|| MarketDataError::Parse("missing lastPriceNumber".to_string()))?;

        let snapshot = TickerSnapshot {
            last_price,
            volume_24h: field_f64(&body, "volumeNumber"),
            market_cap: field_f64(&body, "marketcapNumber"),
        };
        debug!(market, last_price = snapshot.last_price, "NonKYC ticker fetched");
        Ok(snapshot)
    }

    /// GET /api/v2/market/trades/XBT_USDT — recent trade history.
    #[instrument(skip(self), name = "market_data::nonkyc_trades")]
    pub async fn nonkyc_recent_trades(&self) -> Result<Vec<RecentTrade>, MarketDataError> {
        let url = format!("{}/api/v2/market/trades/XBT_USDT", self.nonkyc_base);
        let body = self.get_json(&url).await?;

        let raw = body
            .as_array()
            .ok_or_else(|| MarketDataError::Parse("trades response is not an array".to_string()))?;

        let trades = parse_recent_trades(raw);
        debug!(count = trades.len(), "NonKYC recent trades fetched");
        Ok(trades)
    }

    /// Last BTC/USDT price from NonKYC, used as the cross-pair reference rate.
    pub async fn btc_usdt_rate(&self) -> Result<f64, MarketDataError> {
        let ticker = self.nonkyc_ticker("BTC_USDT").await?;
        Ok(ticker.last_price)
    }

    // -------------------------------------------------------------------------
    // CoinEx
    // -------------------------------------------------------------------------

    /// GET /v1/market/deals?market=XBTUSDT&limit=100 — recent trade history.
    ///
    /// CoinEx wraps every payload in `{code, data, message}`; `code == 0`
    /// means success.
    #[instrument(skip(self), name = "market_data::coinex_deals")]
    pub async fn coinex_recent_deals(&self) -> Result<Vec<RecentTrade>, MarketDataError> {
        let url = format!("{}/v1/market/deals?market=XBTUSDT&limit=100", self.coinex_base);
        let body = self.get_json(&url).await?;

        let code = body.get("code").and_then(Value::as_i64).unwrap_or(-1);
        if code != 0 {
            return Err(MarketDataError::Parse(format!(
                "CoinEx error code {code}"
            )));
        }

        let raw = body
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| MarketDataError::Parse("missing data array".to_string()))?;

        let trades = parse_recent_trades(raw);
        debug!(count = trades.len(), "CoinEx recent deals fetched");
        Ok(trades)
    }

    /// GET /v1/market/ticker?market=XBTUSDT — used as an availability probe.
    #[instrument(skip(self), name = "market_data::coinex_ticker")]
    pub async fn coinex_ticker_ok(&self) -> Result<(), MarketDataError> {
        let url = format!("{}/v1/market/ticker?market=XBTUSDT", self.coinex_base);
        let body = self.get_json(&url).await?;
        let code = body.get("code").and_then(Value::as_i64).unwrap_or(-1);
        if code != 0 {
            return Err(MarketDataError::Parse(format!(
                "CoinEx error code {code}"
            )));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // AscendEX
    // -------------------------------------------------------------------------

    /// GET /api/pro/v1/ticker?symbol=XBT/USDT — used as an availability probe.
    #[instrument(skip(self), name = "market_data::ascendex_ticker")]
    pub async fn ascendex_ticker_ok(&self) -> Result<(), MarketDataError> {
        let url = format!("{}/api/pro/v1/ticker?symbol=XBT/USDT", self.ascendex_base);
        self.get_json(&url).await.map(|_| ())
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    /// GET `url`, classify the status, parse the JSON body.
    async fn get_json(&self, url: &str) -> Result<Value, MarketDataError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();

        match status.as_u16() {
            200..=299 => {}
            429 => {
                warn!(url, "venue rate limit hit");
                return Err(MarketDataError::RateLimited);
            }
            401 => return Err(MarketDataError::AuthFailed),
            code => {
                let body = resp.text().await.unwrap_or_default();
                return Err(MarketDataError::Status { status: code, body });
            }
        }

        resp.json::<Value>()
            .await
            .map_err(|e| MarketDataError::Parse(e.to_string()))
    }
}

impl Default for MarketDataClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Read a numeric field that venues serialise either as a number or a
/// numeric string. Shared with the stream adapters, whose wire shapes have
/// the same quirk.
pub(crate) fn field_f64(value: &Value, key: &str) -> Option<f64> {
    match value.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Extract `{quantity, timestamp_ms}` pairs from a heterogeneous trade list.
///
/// Quantity lives under `quantity`, `amount`, or `volume`; timestamps under
/// `timestamp` or `date_ms`, in seconds or milliseconds. Entries missing
/// either field are skipped.
fn parse_recent_trades(raw: &[Value]) -> Vec<RecentTrade> {
    raw.iter()
        .filter_map(|entry| {
            let quantity = field_f64(entry, "quantity")
                .or_else(|| field_f64(entry, "amount"))
                .or_else(|| field_f64(entry, "volume"))?;
            let ts = field_f64(entry, "timestamp").or_else(|| field_f64(entry, "date_ms"))?;
            // Normalise second-resolution stamps to milliseconds.
            let timestamp_ms = if ts > 1e10 { ts as i64 } else { (ts * 1000.0) as i64 };
            Some(RecentTrade {
                quantity,
                timestamp_ms,
            })
        })
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn field_f64_accepts_numbers_and_strings() {
        let v = json!({"a": 1.5, "b": "2.25", "c": true});
        assert_eq!(field_f64(&v, "a"), Some(1.5));
        assert_eq!(field_f64(&v, "b"), Some(2.25));
        assert_eq!(field_f64(&v, "c"), None);
        assert_eq!(field_f64(&v, "missing"), None);
    }

    #[test]
    fn recent_trades_handle_nonkyc_shape() {
        let raw = vec![
            json!({"price": "0.17", "quantity": "120.5", "timestamp": 1700000000000i64}),
            json!({"price": "0.18", "quantity": "10.0", "timestamp": "1700000030000"}),
        ];
        let trades = parse_recent_trades(&raw);
        assert_eq!(trades.len(), 2);
        assert!((trades[0].quantity - 120.5).abs() < 1e-9);
        assert_eq!(trades[0].timestamp_ms, 1_700_000_000_000);
        assert_eq!(trades[1].timestamp_ms, 1_700_000_030_000);
    }

    #[test]
    fn recent_trades_handle_coinex_shape() {
        let raw = vec![json!({"price": "0.17", "amount": "42.0", "date_ms": 1700000000123i64})];
        let trades = parse_recent_trades(&raw);
        assert_eq!(trades.len(), 1);
        assert!((trades[0].quantity - 42.0).abs() < 1e-9);
        assert_eq!(trades[0].timestamp_ms, 1_700_000_000_123);
    }

    #[test]
    fn recent_trades_normalise_second_stamps() {
        let raw = vec![json!({"amount": 1.0, "timestamp": 1700000000})];
        let trades = parse_recent_trades(&raw);
        assert_eq!(trades[0].timestamp_ms, 1_700_000_000_000);
    }

    #[test]
    fn malformed_entries_are_skipped() {
        let raw = vec![
            json!({"timestamp": 1700000000000i64}),
            json!({"amount": "nope", "timestamp": 1700000000000i64}),
            json!({"amount": 3.0, "timestamp": 1700000000000i64}),
        ];
        let trades = parse_recent_trades(&raw);
        assert_eq!(trades.len(), 1);
        assert!((trades[0].quantity - 3.0).abs() < 1e-9);
    }
}
