// =============================================================================
// Alert Dispatcher — Telegram delivery with image-first, text-fallback
// =============================================================================
//
// Consumes alert records from the engine channel, enriches each with a
// market snapshot, and delivers to every active chat. An image send that
// fails for any reason falls back to a text-only message with the same
// body; a chat that fails entirely is logged and never blocks the others.
// Delivery is at-most-once per alert per chat: no retries.
// =============================================================================

use std::path::Path;
use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::types::{InputFile, LinkPreviewOptions, ParseMode};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::alerts::format::format_alert_message;
use crate::alerts::images::{is_animation, ImageCollection};
use crate::config::ConfigStore;
use crate::market_data::{volume, MarketDataClient};
use crate::types::{AlertRecord, MarketContext};

fn no_preview() -> LinkPreviewOptions {
    LinkPreviewOptions {
        is_disabled: true,
        url: None,
        prefer_small_media: false,
        prefer_large_media: false,
        show_above_text: false,
    }
}

/// Owns the Telegram bot handle and everything needed to enrich and send
/// one alert.
pub struct AlertDispatcher {
    bot: Bot,
    config: Arc<ConfigStore>,
    client: Arc<MarketDataClient>,
    images: Arc<ImageCollection>,
}

impl AlertDispatcher {
    pub fn new(
        bot: Bot,
        config: Arc<ConfigStore>,
        client: Arc<MarketDataClient>,
        images: Arc<ImageCollection>,
    ) -> Self {
        Self {
            bot,
            config,
            client,
            images,
        }
    }

    /// Deliver one alert to every active chat.
    pub async fn dispatch(&self, alert: AlertRecord) {
        let context = self.market_context(&alert).await;
        let message = format_alert_message(&alert, &context);

        let chat_ids = self.config.snapshot().active_chat_ids;
        if chat_ids.is_empty() {
            warn!("no active chats configured, alert not delivered");
            return;
        }

        let image = self.images.pick_random();

        for chat_id in chat_ids {
            match self.send_to_chat(chat_id, &message, image.as_deref()).await {
                Ok(with_image) => {
                    info!(
                        chat_id,
                        venue = %alert.venue_label,
                        pair = %alert.pair,
                        with_image,
                        "alert delivered"
                    );
                }
                Err(e) => {
                    // A failed chat never blocks the rest.
                    error!(chat_id, error = %e, "failed to deliver alert");
                }
            }
        }
    }

    /// Image-first delivery. Returns whether the image variant went out.
    async fn send_to_chat(
        &self,
        chat_id: i64,
        message: &str,
        image: Option<&Path>,
    ) -> Result<bool, teloxide::RequestError> {
        let chat = ChatId(chat_id);

        if let Some(path) = image {
            let result = if is_animation(path) {
                self.bot
                    .send_animation(chat, InputFile::file(path))
                    .caption(message.to_string())
                    .parse_mode(ParseMode::Html)
                    .await
            } else {
                self.bot
                    .send_photo(chat, InputFile::file(path))
                    .caption(message.to_string())
                    .parse_mode(ParseMode::Html)
                    .await
            };

            match result {
                Ok(_) => return Ok(true),
                Err(e) => {
                    warn!(chat_id, error = %e, "image send failed, falling back to text");
                }
            }
        }

        self.bot
            .send_message(chat, message.to_string())
            .parse_mode(ParseMode::Html)
            .link_preview_options(no_preview())
            .await?;
        Ok(false)
    }

    /// Best-effort market snapshot for the alert footer. Every piece is
    /// optional: a venue outage leaves its fields empty rather than
    /// blocking the alert.
    async fn market_context(&self, alert: &AlertRecord) -> MarketContext {
        let ticker = match self.client.nonkyc_ticker("XBT_USDT").await {
            Ok(t) => Some(t),
            Err(e) => {
                warn!(error = %e, "market context ticker unavailable");
                None
            }
        };

        let volumes = volume::combined_volume_periods(&self.client).await;

        MarketContext {
            last_price_usdt: ticker
                .as_ref()
                .map(|t| t.last_price)
                .or(Some(alert.canonical_avg_price)),
            market_cap: ticker.as_ref().and_then(|t| t.market_cap),
            volume_15m: volumes.m15,
            volume_1h: volumes.h1,
            volume_4h: volumes.h4,
            volume_24h: volumes.h24,
        }
    }
}

/// Run the dispatcher until the alert channel closes. The engine holds the
/// only sender: at shutdown it drains its open buckets, drops the channel,
/// and the dispatcher finishes whatever was flushed before exiting. New
/// work cannot arrive after that point.
pub async fn run_dispatcher(dispatcher: AlertDispatcher, mut alerts: mpsc::Receiver<AlertRecord>) {
    info!("alert dispatcher started");

    while let Some(alert) = alerts.recv().await {
        dispatcher.dispatch(alert).await;
    }

    info!("alert dispatcher stopped");
}
