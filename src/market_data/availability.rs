// =============================================================================
// Venue Availability Probe — gates stream adapters per venue
// =============================================================================
//
// XBT is not guaranteed to be listed everywhere at all times. A single probe
// task checks each venue's ticker endpoint on a fixed cadence, logs
// gained/lost transitions, and publishes the map over a watch channel that
// the stream adapters wait on. A failed probe marks the venue unavailable
// until a later probe succeeds.
// =============================================================================

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::client::MarketDataClient;

/// Seconds between availability sweeps. Probes never run more often.
pub const PROBE_INTERVAL_SECS: u64 = 300;

/// The venues the pipeline knows how to stream from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VenueId {
    NonKyc,
    CoinEx,
    AscendEx,
}

impl VenueId {
    pub const ALL: [VenueId; 3] = [VenueId::NonKyc, VenueId::CoinEx, VenueId::AscendEx];

    /// Label used in logs and alerts.
    pub fn label(self) -> &'static str {
        match self {
            Self::NonKyc => "NonKYC",
            Self::CoinEx => "CoinEx",
            Self::AscendEx => "AscendEX",
        }
    }
}

impl std::fmt::Display for VenueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Snapshot of which venues currently list XBT.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VenueAvailability {
    pub nonkyc: bool,
    pub coinex: bool,
    pub ascendex: bool,
}

impl VenueAvailability {
    pub fn venue(&self, id: VenueId) -> bool {
        match id {
            VenueId::NonKyc => self.nonkyc,
            VenueId::CoinEx => self.coinex,
            VenueId::AscendEx => self.ascendex,
        }
    }

    fn set(&mut self, id: VenueId, available: bool) {
        match id {
            VenueId::NonKyc => self.nonkyc = available,
            VenueId::CoinEx => self.coinex = available,
            VenueId::AscendEx => self.ascendex = available,
        }
    }

    /// Labels of the venues currently available, for log lines.
    pub fn available_labels(&self) -> Vec<&'static str> {
        VenueId::ALL
            .into_iter()
            .filter(|id| self.venue(*id))
            .map(VenueId::label)
            .collect()
    }
}

/// Owns the probe loop and the watch channel adapters subscribe to.
pub struct AvailabilityProbe {
    client: Arc<MarketDataClient>,
    tx: watch::Sender<VenueAvailability>,
}

impl AvailabilityProbe {
    /// Returns the probe plus the receiver handed to every adapter. The
    /// initial snapshot marks all venues unavailable; adapters stay idle
    /// until the first sweep succeeds.
    pub fn new(client: Arc<MarketDataClient>) -> (Self, watch::Receiver<VenueAvailability>) {
        let (tx, rx) = watch::channel(VenueAvailability::default());
        (Self { client, tx }, rx)
    }

    /// Probe every venue once and return the fresh snapshot.
    async fn sweep(&self) -> VenueAvailability {
        let mut snapshot = VenueAvailability::default();

        snapshot.set(
            VenueId::NonKyc,
            match self.client.nonkyc_ticker("XBT_USDT").await {
                Ok(_) => true,
                Err(e) => {
                    debug!(venue = %VenueId::NonKyc, error = %e, "availability check failed");
                    false
                }
            },
        );

        snapshot.set(
            VenueId::CoinEx,
            match self.client.coinex_ticker_ok().await {
                Ok(()) => true,
                Err(e) => {
                    debug!(venue = %VenueId::CoinEx, error = %e, "availability check failed");
                    false
                }
            },
        );

        snapshot.set(
            VenueId::AscendEx,
            match self.client.ascendex_ticker_ok().await {
                Ok(()) => true,
                Err(e) => {
                    debug!(venue = %VenueId::AscendEx, error = %e, "availability check failed");
                    false
                }
            },
        );

        snapshot
    }

    /// Run until shutdown: sweep, log transitions, publish, sleep.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_s = PROBE_INTERVAL_SECS, "availability probe started");

        let mut previous = VenueAvailability::default();
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(PROBE_INTERVAL_SECS));

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let current = self.sweep().await;
                    log_transitions(previous, current);
                    previous = current;
                    // Receivers may all be waiting in Idle; a lagging send
                    // only means shutdown already started.
                    let _ = self.tx.send(current);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("availability probe stopped");
    }
}

fn log_transitions(previous: VenueAvailability, current: VenueAvailability) {
    for id in VenueId::ALL {
        let was = previous.venue(id);
        let now = current.venue(id);
        if now && !was {
            info!(venue = %id, "XBT is now available");
        } else if !now && was {
            warn!(venue = %id, "XBT is no longer available");
        }
    }
}
