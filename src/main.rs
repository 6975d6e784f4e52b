// =============================================================================
// XBT Sentinel — Main Entry Point
// =============================================================================
//
// Multi-venue buy-alert pipeline for XBT. Streams trades from NonKYC,
// CoinEx and AscendEX, aggregates bursts per (venue, pair, window), and
// pushes formatted alerts to Telegram chats.
//
// Startup fails fast: an invalid configuration or a bot token rejected by
// Telegram exits non-zero before any stream adapter starts.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod alerts;
mod api;
mod app_state;
mod config;
mod engine;
mod market_data;
mod threshold;
mod types;
mod venues;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Context;
use teloxide::prelude::*;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::alerts::{AlertDispatcher, ImageCollection};
use crate::app_state::AppState;
use crate::config::ConfigStore;
use crate::engine::AggregationEngine;
use crate::market_data::{reference_rate, AvailabilityProbe, MarketDataClient, ReferenceRateCache};
use crate::types::Pair;
use crate::venues::StreamContext;

/// Path of the persisted configuration document.
const CONFIG_PATH: &str = "config.json";

/// Capacity of the adapter → engine fan-in channel. A full channel pauses
/// the adapters' read loops instead of dropping trades.
const TRADE_CHANNEL_CAPACITY: usize = 1024;

/// Capacity of the engine → dispatcher channel.
const ALERT_CHANNEL_CAPACITY: usize = 64;

/// Grace period for the engine and dispatcher to drain at shutdown.
const SHUTDOWN_GRACE_SECS: u64 = 10;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║            XBT Sentinel — Starting Up                    ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // ── 2. Configuration (fatal on invalid) ──────────────────────────────
    let config = Arc::new(
        ConfigStore::load(CONFIG_PATH)
            .context("configuration is invalid — edit config.json and restart")?,
    );
    let snapshot = config.snapshot();

    // ── 3. Telegram bot (fatal on rejected token) ────────────────────────
    let bot = Bot::new(snapshot.bot_token.clone());
    let me = bot
        .get_me()
        .await
        .context("Telegram rejected the configured bot token")?;
    info!(
        bot = %me.username(),
        chats = snapshot.active_chat_ids.len(),
        "Telegram connection verified"
    );
    if snapshot.active_chat_ids.is_empty() {
        warn!("no active chats configured — alerts will be computed but not delivered");
    }

    // ── 4. Shared infrastructure ─────────────────────────────────────────
    let market_client = Arc::new(MarketDataClient::new());
    let rates = Arc::new(ReferenceRateCache::new(market_client.clone()));
    let (probe, availability_rx) = AvailabilityProbe::new(market_client.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (trades_tx, trades_rx) = mpsc::channel(TRADE_CHANNEL_CAPACITY);
    let (alerts_tx, alerts_rx) = mpsc::channel(ALERT_CHANNEL_CAPACITY);

    let images = Arc::new(ImageCollection::new(
        alerts::images::IMAGES_DIR,
        snapshot.image_path.clone(),
    ));
    let running = Arc::new(AtomicBool::new(true));

    let state = Arc::new(AppState {
        config: config.clone(),
        rates: rates.clone(),
        availability: availability_rx.clone(),
        images: images.clone(),
        running: running.clone(),
        trades_tx: trades_tx.clone(),
        start_time: std::time::Instant::now(),
    });

    // ── 5. Control API (bind before streams so failures stay fatal) ──────
    let bind_addr =
        std::env::var("XBT_BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:3001".to_string());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind control API to {bind_addr}"))?;
    info!(addr = %bind_addr, "control API listening");

    let api_state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, api::rest::router(api_state)).await {
            error!(error = %e, "control API server failed");
        }
    });

    // ── 6. Availability probe & reference rate refresher ─────────────────
    tokio::spawn(probe.run(shutdown_rx.clone()));
    tokio::spawn(reference_rate::run_refresher(rates.clone(), shutdown_rx.clone()));

    // ── 7. Venue stream adapters ─────────────────────────────────────────
    let ctx = StreamContext {
        trades: trades_tx.clone(),
        availability: availability_rx.clone(),
        shutdown: shutdown_rx.clone(),
        rates: rates.clone(),
    };

    tokio::spawn(venues::nonkyc::run_trades(Pair::XbtUsdt, ctx.clone()));
    tokio::spawn(venues::nonkyc::run_trades(Pair::XbtBtc, ctx.clone()));
    tokio::spawn(venues::coinex::run_trades(ctx.clone()));
    tokio::spawn(venues::ascendex::run_trades(ctx.clone()));
    tokio::spawn(venues::sweep::run_sweep_detector(config.clone(), ctx.clone()));
    info!("venue stream adapters launched");

    // ── 8. Engine & dispatcher ───────────────────────────────────────────
    let engine = AggregationEngine::new(config.clone(), running.clone());
    let engine_handle = tokio::spawn(engine::run_engine(
        engine,
        trades_rx,
        alerts_tx,
        shutdown_rx.clone(),
    ));

    let dispatcher =
        AlertDispatcher::new(bot, config.clone(), market_client.clone(), images.clone());
    let dispatcher_handle = tokio::spawn(alerts::run_dispatcher(dispatcher, alerts_rx));

    // ── 9. Threshold controller & heartbeat ──────────────────────────────
    tokio::spawn(threshold::run_threshold_controller(
        config.clone(),
        market_client.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(run_heartbeat(state.clone(), shutdown_rx.clone()));

    info!("all subsystems running — press Ctrl+C to stop");

    // ── 10. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    warn!("shutdown signal received — stopping gracefully");

    let _ = shutdown_tx.send(true);

    // The engine drains its open buckets into the alert channel, then the
    // dispatcher finishes delivering them. Both are bounded by the grace
    // period; anything slower is abandoned with the process.
    let grace = std::time::Duration::from_secs(SHUTDOWN_GRACE_SECS);
    if tokio::time::timeout(grace, engine_handle).await.is_err() {
        warn!("engine did not drain within the grace period");
    }
    if tokio::time::timeout(grace, dispatcher_handle).await.is_err() {
        warn!("dispatcher did not finish within the grace period");
    }

    info!("XBT Sentinel shut down complete");
    Ok(())
}

/// Once-a-minute liveness log naming the venues being watched and the
/// current threshold.
async fn run_heartbeat(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
    // The first tick fires immediately; skip it so beats start a minute in.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let venues = state.availability.borrow().available_labels();
                let threshold = state.config.threshold();
                if venues.is_empty() {
                    info!(threshold_usdt = threshold, "bot running — waiting for venue availability");
                } else {
                    info!(
                        venues = ?venues,
                        threshold_usdt = threshold,
                        "bot running"
                    );
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
