// =============================================================================
// Configuration Store — validated, persisted bot settings
// =============================================================================
//
// Single mutable document for the whole pipeline. Every tunable lives here so
// the bot can be reconfigured at runtime without a restart.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields never
// breaks loading an older config file.
//
// Updates are replace-all with validation: the mutation is applied to a copy,
// validated, persisted, and only then published to readers. A failed persist
// leaves the published document untouched.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_value_require() -> f64 {
    300.0
}

fn default_image_path() -> String {
    "xbt_buy_alert.gif".to_string()
}

fn default_base_value() -> f64 {
    300.0
}

fn default_volume_multiplier() -> f64 {
    0.05
}

fn default_price_check_interval() -> u64 {
    3600
}

fn default_min_threshold() -> f64 {
    100.0
}

fn default_max_threshold() -> f64 {
    1000.0
}

fn default_window_seconds() -> u64 {
    8
}

fn default_sweep_min_value() -> f64 {
    80.0
}

fn default_sweep_check_interval() -> u64 {
    2
}

fn default_min_orders_filled() -> u32 {
    2
}

// =============================================================================
// Config sections
// =============================================================================

/// Volume-driven threshold adjustment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicThreshold {
    #[serde(default)]
    pub enabled: bool,

    /// Floor component of the computed threshold, in USDT.
    #[serde(default = "default_base_value")]
    pub base_value: f64,

    /// USDT of threshold added per XBT of 24 h volume.
    #[serde(default = "default_volume_multiplier")]
    pub volume_multiplier: f64,

    /// Seconds between refreshes of the 24 h volume.
    #[serde(default = "default_price_check_interval")]
    pub price_check_interval: u64,

    #[serde(default = "default_min_threshold")]
    pub min_threshold: f64,

    #[serde(default = "default_max_threshold")]
    pub max_threshold: f64,
}

impl Default for DynamicThreshold {
    fn default() -> Self {
        Self {
            enabled: false,
            base_value: default_base_value(),
            volume_multiplier: default_volume_multiplier(),
            price_check_interval: default_price_check_interval(),
            min_threshold: default_min_threshold(),
            max_threshold: default_max_threshold(),
        }
    }
}

/// Windowed coalescing of trade bursts into one alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeAggregation {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Alignment window for grouping trades, in seconds.
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
}

impl Default for TradeAggregation {
    fn default() -> Self {
        Self {
            enabled: true,
            window_seconds: default_window_seconds(),
        }
    }
}

/// Order-book sweep detection on venues that expose an incremental book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepOrders {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Minimum summed value of swept ask levels, in USDT.
    #[serde(default = "default_sweep_min_value")]
    pub min_value: f64,

    /// Seconds between book comparisons.
    #[serde(default = "default_sweep_check_interval")]
    pub check_interval: u64,

    /// Minimum number of ask levels consumed to count as a sweep.
    #[serde(default = "default_min_orders_filled")]
    pub min_orders_filled: u32,
}

impl Default for SweepOrders {
    fn default() -> Self {
        Self {
            enabled: true,
            min_value: default_sweep_min_value(),
            check_interval: default_sweep_check_interval(),
            min_orders_filled: default_min_orders_filled(),
        }
    }
}

// =============================================================================
// BotConfig
// =============================================================================

/// The persisted configuration document.
///
/// Every field has a serde default so that older JSON files missing new
/// fields still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Telegram bot token, shaped `<numeric id>:<secret>`.
    #[serde(default)]
    pub bot_token: String,

    /// Alert threshold in USDT. Mutated by the dynamic-threshold
    /// controller when enabled.
    #[serde(default = "default_value_require")]
    pub value_require: f64,

    /// Chats that receive alerts.
    #[serde(default)]
    pub active_chat_ids: Vec<i64>,

    /// Telegram user id of the bot owner.
    #[serde(default)]
    pub bot_owner: i64,

    /// Secondary user id granted admin commands.
    #[serde(default)]
    pub by_pass: i64,

    /// Fallback alert image when the collection directory is empty.
    #[serde(default = "default_image_path")]
    pub image_path: String,

    #[serde(default)]
    pub dynamic_threshold: DynamicThreshold,

    #[serde(default)]
    pub trade_aggregation: TradeAggregation,

    #[serde(default)]
    pub sweep_orders: SweepOrders,

    // Venue credentials. Unused for public trade data, kept so operators
    // can store them alongside the rest of the bot's settings.
    #[serde(default)]
    pub coinex_access_id: String,
    #[serde(default)]
    pub coinex_secret_key: String,
    #[serde(default)]
    pub ascendex_access_id: String,
    #[serde(default)]
    pub ascendex_secret_key: String,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            value_require: default_value_require(),
            active_chat_ids: Vec::new(),
            bot_owner: 0,
            by_pass: 0,
            image_path: default_image_path(),
            dynamic_threshold: DynamicThreshold::default(),
            trade_aggregation: TradeAggregation::default(),
            sweep_orders: SweepOrders::default(),
            coinex_access_id: String::new(),
            coinex_secret_key: String::new(),
            ascendex_access_id: String::new(),
            ascendex_secret_key: String::new(),
        }
    }
}

impl BotConfig {
    /// Validate the whole document. Called on load and before every
    /// persisted update; a document that fails here is never published.
    pub fn validate(&self) -> Result<()> {
        if self.bot_token.is_empty() || self.bot_token == "YOUR_BOT_TOKEN" {
            bail!("bot_token must be set to a valid Telegram bot token");
        }
        let parts: Vec<&str> = self.bot_token.split(':').collect();
        if parts.len() != 2 || parts[0].len() < 8 || !parts[0].chars().all(|c| c.is_ascii_digit())
        {
            bail!("bot_token format appears invalid (expected '<numeric id>:<secret>')");
        }

        if !self.value_require.is_finite() || self.value_require <= 0.0 {
            bail!("value_require must be a positive number");
        }

        if self.bot_owner <= 0 {
            bail!("bot_owner must be a positive integer (Telegram user id)");
        }

        if self.image_path.is_empty() {
            bail!("image_path must be a non-empty string");
        }

        let dt = &self.dynamic_threshold;
        if dt.min_threshold > dt.max_threshold {
            bail!(
                "dynamic_threshold.min_threshold ({}) exceeds max_threshold ({})",
                dt.min_threshold,
                dt.max_threshold
            );
        }
        if dt.price_check_interval == 0 {
            bail!("dynamic_threshold.price_check_interval must be positive");
        }

        if self.trade_aggregation.window_seconds == 0 {
            bail!("trade_aggregation.window_seconds must be positive");
        }

        let so = &self.sweep_orders;
        if so.min_orders_filled == 0 {
            bail!("sweep_orders.min_orders_filled must be positive");
        }
        if so.check_interval == 0 {
            bail!("sweep_orders.check_interval must be positive");
        }

        Ok(())
    }
}

// =============================================================================
// ConfigStore
// =============================================================================

/// Owns the published [`BotConfig`] and its file on disk.
///
/// Readers take cheap snapshots; writers go through [`ConfigStore::update`],
/// which serialises them behind the write lock.
pub struct ConfigStore {
    path: PathBuf,
    inner: RwLock<BotConfig>,
}

impl ConfigStore {
    /// Load the document from `path`, creating a default file when absent.
    ///
    /// A freshly created default fails validation on purpose (the token and
    /// owner are placeholders): the operator gets a file to edit and the
    /// process exits non-zero before any stream starts.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if !path.exists() {
            let default = BotConfig::default();
            persist(&path, &default)?;
            info!(path = %path.display(), "created default configuration file");
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let config: BotConfig = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("invalid configuration in {}", path.display()))?;

        info!(
            path = %path.display(),
            threshold = config.value_require,
            chats = config.active_chat_ids.len(),
            aggregation = config.trade_aggregation.enabled,
            "configuration loaded"
        );

        Ok(Self {
            path,
            inner: RwLock::new(config),
        })
    }

    /// Build a store around an already-validated document without touching
    /// the filesystem until the first update.
    pub fn with_config(path: impl AsRef<Path>, config: BotConfig) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            inner: RwLock::new(config),
        }
    }

    /// Consistent snapshot of the current document.
    pub fn snapshot(&self) -> BotConfig {
        self.inner.read().clone()
    }

    /// Current alert threshold in USDT.
    pub fn threshold(&self) -> f64 {
        self.inner.read().value_require
    }

    /// Apply `mutate` to a copy, validate, persist, then publish.
    ///
    /// The write lock is held across persist so concurrent updates cannot
    /// interleave their file writes. No in-memory mutation happens when
    /// validation or the file write fails.
    pub fn update(&self, mutate: impl FnOnce(&mut BotConfig)) -> Result<()> {
        let mut guard = self.inner.write();

        let mut candidate = guard.clone();
        mutate(&mut candidate);
        candidate
            .validate()
            .context("rejected configuration update")?;

        persist(&self.path, &candidate)?;
        *guard = candidate;

        info!(path = %self.path.display(), "configuration updated");
        Ok(())
    }
}

/// Atomic write: serialise to a temporary sibling file, then rename.
fn persist(path: &Path, config: &BotConfig) -> Result<()> {
    let content =
        serde_json::to_string_pretty(config).context("failed to serialise config to JSON")?;

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &content)
        .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> BotConfig {
        BotConfig {
            bot_token: "123456789:ABC-DEF1234ghIkl".to_string(),
            bot_owner: 42,
            active_chat_ids: vec![-1001234567890, 777],
            ..BotConfig::default()
        }
    }

    fn temp_config_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "xbt-sentinel-test-{tag}-{}.json",
            std::process::id()
        ))
    }

    #[test]
    fn default_config_has_original_defaults() {
        let cfg = BotConfig::default();
        assert!((cfg.value_require - 300.0).abs() < f64::EPSILON);
        assert!(cfg.trade_aggregation.enabled);
        assert_eq!(cfg.trade_aggregation.window_seconds, 8);
        assert!(!cfg.dynamic_threshold.enabled);
        assert!((cfg.dynamic_threshold.min_threshold - 100.0).abs() < f64::EPSILON);
        assert!((cfg.dynamic_threshold.max_threshold - 1000.0).abs() < f64::EPSILON);
        assert!(cfg.sweep_orders.enabled);
        assert_eq!(cfg.sweep_orders.min_orders_filled, 2);
    }

    #[test]
    fn default_config_fails_validation_until_edited() {
        // Placeholder token and owner: the operator must fill these in.
        assert!(BotConfig::default().validate().is_err());
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "bot_token": "123456789:tok", "bot_owner": 7, "value_require": 150 }"#;
        let cfg: BotConfig = serde_json::from_str(json).unwrap();
        assert!((cfg.value_require - 150.0).abs() < f64::EPSILON);
        assert_eq!(cfg.trade_aggregation.window_seconds, 8);
        assert!(cfg.sweep_orders.enabled);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn token_format_is_checked() {
        let mut cfg = valid_config();
        cfg.bot_token = "no-colon-here".to_string();
        assert!(cfg.validate().is_err());

        cfg.bot_token = "123:short-id".to_string();
        assert!(cfg.validate().is_err());

        cfg.bot_token = "12345678x:secret".to_string();
        assert!(cfg.validate().is_err());

        cfg.bot_token = "123456789:secret".to_string();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn threshold_must_be_positive() {
        let mut cfg = valid_config();
        cfg.value_require = 0.0;
        assert!(cfg.validate().is_err());
        cfg.value_require = -5.0;
        assert!(cfg.validate().is_err());
        cfg.value_require = f64::NAN;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn dynamic_bounds_must_be_ordered() {
        let mut cfg = valid_config();
        cfg.dynamic_threshold.min_threshold = 500.0;
        cfg.dynamic_threshold.max_threshold = 100.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_window_is_rejected() {
        let mut cfg = valid_config();
        cfg.trade_aggregation.window_seconds = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn update_persists_and_publishes() {
        let path = temp_config_path("update");
        let store = ConfigStore::with_config(&path, valid_config());

        store
            .update(|c| c.value_require = 500.0)
            .expect("valid update should succeed");

        assert!((store.threshold() - 500.0).abs() < f64::EPSILON);

        // The file reflects the update.
        let on_disk: BotConfig =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!((on_disk.value_require - 500.0).abs() < f64::EPSILON);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn rejected_update_preserves_previous_document() {
        let path = temp_config_path("reject");
        let store = ConfigStore::with_config(&path, valid_config());

        let result = store.update(|c| c.value_require = -1.0);
        assert!(result.is_err());
        assert!((store.threshold() - 300.0).abs() < f64::EPSILON);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = valid_config();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: BotConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.bot_token, cfg2.bot_token);
        assert_eq!(cfg.active_chat_ids, cfg2.active_chat_ids);
        assert_eq!(
            cfg.trade_aggregation.window_seconds,
            cfg2.trade_aggregation.window_seconds
        );
    }
}
