// =============================================================================
// Venue Stream Adapters — one persistent subscription per (venue, pair)
// =============================================================================
//
// Each adapter waits for its venue to list XBT, connects, subscribes, and
// feeds canonical trades into the engine channel. The connect/subscribe/
// recv-with-ping skeleton and the reconnect policy are shared here; the
// per-venue message shapes live in the sibling modules.
// =============================================================================

pub mod ascendex;
pub mod backoff;
pub mod coinex;
pub mod nonkyc;
pub mod sweep;

pub use backoff::Backoff;

use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::market_data::{ReferenceRateCache, VenueAvailability, VenueId};
use crate::types::NormalizedTrade;

use backoff::is_rate_limit_error;

/// Seconds without a message before an application-level ping is sent.
const RECV_TIMEOUT_SECS: u64 = 5;
/// Seconds between availability re-checks while an adapter is idle.
const IDLE_RECHECK_SECS: u64 = 60;

/// Handles shared by every stream adapter.
#[derive(Clone)]
pub struct StreamContext {
    /// Fan-in channel into the aggregation engine. Bounded: a full channel
    /// suspends the adapter's read loop instead of dropping trades.
    pub trades: mpsc::Sender<NormalizedTrade>,
    pub availability: watch::Receiver<VenueAvailability>,
    pub shutdown: watch::Receiver<bool>,
    pub rates: Arc<ReferenceRateCache>,
}

impl StreamContext {
    pub fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// A venue subscription: where to connect and what to send after the
/// handshake.
pub struct Subscription {
    pub venue: VenueId,
    pub label: &'static str,
    pub url: &'static str,
    pub subscribe: serde_json::Value,
}

/// Park until `venue` lists XBT. Returns false when shutdown arrives first.
pub async fn wait_until_available(venue: VenueId, ctx: &mut StreamContext) -> bool {
    loop {
        if ctx.availability.borrow().venue(venue) {
            info!(venue = %venue, "XBT detected, starting stream");
            return true;
        }
        debug!(venue = %venue, "XBT not yet available, waiting");

        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs(IDLE_RECHECK_SECS)) => {}
            _ = ctx.availability.changed() => {}
            _ = ctx.shutdown.changed() => {
                if *ctx.shutdown.borrow() {
                    return false;
                }
            }
        }
    }
}

/// Sleep that wakes early on shutdown. Returns false when shutdown arrived.
pub async fn sleep_unless_shutdown(
    delay: std::time::Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown.changed() => !*shutdown.borrow(),
    }
}

/// One connection lifetime: connect, subscribe, then pump messages through
/// `handle_text` until the stream errors, ends, or shutdown arrives.
///
/// `handle_text` does the venue-specific parse, duplicate suppression, and
/// normalisation; whatever it returns is pushed into the engine channel
/// (awaiting when the channel is full, which is the backpressure point).
async fn run_stream<F>(
    sub: &Subscription,
    ctx: &mut StreamContext,
    backoff: &mut Backoff,
    handle_text: &mut F,
) -> Result<()>
where
    F: FnMut(&str) -> Vec<NormalizedTrade>,
{
    let (ws_stream, _response) = connect_async(sub.url)
        .await
        .with_context(|| format!("failed to connect to {} stream", sub.label))?;
    debug!(venue = %sub.venue, url = sub.url, "stream connected");

    let (mut write, mut read) = ws_stream.split();

    let payload = sub.subscribe.to_string();
    write
        .send(Message::Text(payload))
        .await
        .with_context(|| format!("failed to subscribe on {}", sub.label))?;
    info!(venue = %sub.venue, label = sub.label, "subscribed");

    // Handshake and subscribe both succeeded.
    backoff.reset();

    loop {
        let next = tokio::select! {
            next = tokio::time::timeout(
                std::time::Duration::from_secs(RECV_TIMEOUT_SECS),
                read.next(),
            ) => next,
            _ = ctx.shutdown.changed() => {
                if *ctx.shutdown.borrow() {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                continue;
            }
        };

        match next {
            Ok(Some(Ok(Message::Text(text)))) => {
                for trade in handle_text(&text) {
                    if ctx.trades.send(trade).await.is_err() {
                        warn!(venue = %sub.venue, "trade channel closed, ending stream");
                        return Ok(());
                    }
                }
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
                    .with_context(|| format!("{} stream read error", sub.label));
            }
            Ok(None) => {
                warn!(venue = %sub.venue, label = sub.label, "stream ended");
                return Ok(());
            }
            Err(_elapsed) => {
                // Quiet connection: probe liveness with a ping. A failed
                // send means the socket is gone.
                write
                    .send(Message::Ping(Vec::new()))
                    .await
                    .with_context(|| format!("failed to ping {} stream", sub.label))?;
            }
        }
    }
}

/// Full adapter lifecycle: availability gate, then reconnect-with-backoff
/// around [`run_stream`] until shutdown.
pub async fn run_adapter<F>(sub: Subscription, mut ctx: StreamContext, mut handle_text: F)
where
    F: FnMut(&str) -> Vec<NormalizedTrade>,
{
    if !wait_until_available(sub.venue, &mut ctx).await {
        return;
    }

    let mut backoff = Backoff::new();

    loop {
        if ctx.shutting_down() || ctx.trades.is_closed() {
            break;
        }

        match run_stream(&sub, &mut ctx, &mut backoff, &mut handle_text).await {
            Ok(()) => {
                if ctx.shutting_down() || ctx.trades.is_closed() {
                    break;
                }
                let delay = backoff.next_delay();
                info!(venue = %sub.venue, label = sub.label, delay_s = delay.as_secs(),
                    "reconnecting after stream end");
                if !sleep_unless_shutdown(delay, &mut ctx.shutdown).await {
                    break;
                }
            }
            Err(e) if is_rate_limit_error(&e) => {
                let (delay, first) = backoff.next_delay_rate_limited();
                if first {
                    warn!(venue = %sub.venue, error = %e, delay_s = delay.as_secs(),
                        "venue rate limited, extending backoff");
                }
                if !sleep_unless_shutdown(delay, &mut ctx.shutdown).await {
                    break;
                }
            }
            Err(e) => {
                error!(venue = %sub.venue, label = sub.label, error = format!("{e:#}"),
                    "stream failed");
                let delay = backoff.next_delay();
                info!(venue = %sub.venue, delay_s = delay.as_secs(), "reconnecting");
                if !sleep_unless_shutdown(delay, &mut ctx.shutdown).await {
                    break;
                }
            }
        }
    }

    info!(venue = %sub.venue, label = sub.label, "adapter stopped");
}

/// Strictly-increasing event-time filter, kept across reconnects so venues
/// that re-broadcast recent history on subscribe do not double-alert.
#[derive(Debug)]
pub struct DedupFilter {
    last_event_time_ms: i64,
}

impl DedupFilter {
    /// Start at `since_ms`; events at or before it are dropped. Adapters
    /// seed this with their start time so the history replayed on the
    /// first subscribe is ignored.
    pub fn since(since_ms: i64) -> Self {
        Self {
            last_event_time_ms: since_ms,
        }
    }

    /// Accept and remember a strictly newer event time, reject the rest.
    pub fn accept(&mut self, event_time_ms: i64) -> bool {
        if event_time_ms > self.last_event_time_ms {
            self.last_event_time_ms = event_time_ms;
            true
        } else {
            false
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_requires_strictly_increasing_times() {
        let mut filter = DedupFilter::since(1_000);
        assert!(!filter.accept(1_000));
        assert!(filter.accept(1_001));
        assert!(!filter.accept(1_001));
        assert!(!filter.accept(999));
        assert!(filter.accept(2_000));
    }

    #[test]
    fn dedup_survives_replayed_history() {
        let mut filter = DedupFilter::since(0);
        let replay = [10, 20, 30];
        for t in replay {
            assert!(filter.accept(t));
        }
        // Reconnect replays the same trades.
        for t in replay {
            assert!(!filter.accept(t));
        }
        assert!(filter.accept(31));
    }
}
