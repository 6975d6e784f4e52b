// =============================================================================
// Rolling Volume Periods — trailing-window XBT volume for alert context
// =============================================================================

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use super::client::{MarketDataClient, RecentTrade};
use crate::types::now_ms;

/// Combined base-asset volume over the trailing windows shown in alerts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct VolumePeriods {
    pub m15: f64,
    pub h1: f64,
    pub h4: f64,
    pub h24: f64,
}

impl VolumePeriods {
    fn add(&mut self, other: VolumePeriods) {
        self.m15 += other.m15;
        self.h1 += other.h1;
        self.h4 += other.h4;
        self.h24 += other.h24;
    }
}

/// Sum trade quantities falling inside each trailing window ending at
/// `now_ms`. Totals are rounded to two decimals for display.
pub fn volume_periods(trades: &[RecentTrade], now_ms: i64) -> VolumePeriods {
    const WINDOWS_MS: [(i64, usize); 4] = [
        (15 * 60 * 1000, 0),
        (60 * 60 * 1000, 1),
        (4 * 60 * 60 * 1000, 2),
        (24 * 60 * 60 * 1000, 3),
    ];

    let mut sums = [0.0f64; 4];
    for trade in trades {
        let age = now_ms - trade.timestamp_ms;
        for (window_ms, idx) in WINDOWS_MS {
            if age <= window_ms {
                sums[idx] += trade.quantity;
            }
        }
    }

    let round2 = |v: f64| (v * 100.0).round() / 100.0;
    VolumePeriods {
        m15: round2(sums[0]),
        h1: round2(sums[1]),
        h4: round2(sums[2]),
        h24: round2(sums[3]),
    }
}

/// Combined rolling volumes across NonKYC and CoinEx recent-trade history.
/// A venue whose fetch fails simply contributes nothing.
pub async fn combined_volume_periods(client: &Arc<MarketDataClient>) -> VolumePeriods {
    let now = now_ms();
    let mut combined = VolumePeriods::default();

    match client.nonkyc_recent_trades().await {
        Ok(trades) => combined.add(volume_periods(&trades, now)),
        Err(e) => debug!(error = %e, "NonKYC recent trades unavailable for volume context"),
    }

    match client.coinex_recent_deals().await {
        Ok(trades) => combined.add(volume_periods(&trades, now)),
        Err(e) => debug!(error = %e, "CoinEx recent deals unavailable for volume context"),
    }

    combined
}
