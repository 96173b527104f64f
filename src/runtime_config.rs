// =============================================================================
// Runtime Configuration - typed settings with atomic save
// =============================================================================
//
// Every tunable of the runner lives here: exchange endpoints, cache and
// orchestrator constants, the default strategy parameter set and the list
// of instances to start on boot.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry serde defaults so that adding new fields never
// breaks loading an older config file.
//
// =============================================================================

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::ExecutionMode;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_database_path() -> String {
    "data/candles.db".to_string()
}

fn default_rest_base_url() -> String {
    "https://fapi.binance.com".to_string()
}

fn default_ws_base_url() -> String {
    "wss://fstream.binance.com".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_density_threshold() -> f64 {
    0.95
}

fn default_seed_lookback_days() -> u32 {
    50
}

fn default_min_required_candles() -> usize {
    250
}

fn default_buffer_retention_multiple() -> usize {
    2
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_ema_short_len() -> usize {
    9
}

fn default_ema_long_len() -> usize {
    26
}

fn default_rsi_len() -> usize {
    12
}

fn default_vol_sma_len() -> usize {
    20
}

fn default_atr_len() -> usize {
    14
}

fn default_ema_trend_filter_len() -> Option<usize> {
    Some(200)
}

fn default_ema_daily_len() -> usize {
    20
}

fn default_breakout_window() -> usize {
    2
}

fn default_volume_surge_multiplier() -> f64 {
    1.5
}

fn default_rsi_buy_threshold() -> f64 {
    60.0
}

fn default_rsi_sell_threshold() -> f64 {
    40.0
}

fn default_daily_trend_lookback() -> usize {
    3
}

fn default_atr_multiplier_sl() -> f64 {
    1.5
}

fn default_rr_factor_tp() -> f64 {
    2.0
}

fn default_risk_percent_per_trade() -> f64 {
    0.02
}

fn default_initial_balance() -> f64 {
    10_000.0
}

fn default_min_bars_between_trades() -> usize {
    3
}

fn default_min_position_size() -> f64 {
    0.001
}

// =============================================================================
// StrategyParams
// =============================================================================

/// Fully typed parameter set for the signal pipeline and the trade state
/// machine. Resolved once when an instance or backtest starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyParams {
    // --- Indicator lengths ---------------------------------------------------
    #[serde(default = "default_ema_short_len")]
    pub ema_short_len: usize,

    #[serde(default = "default_ema_long_len")]
    pub ema_long_len: usize,

    #[serde(default = "default_rsi_len")]
    pub rsi_len: usize,

    #[serde(default = "default_vol_sma_len")]
    pub vol_sma_len: usize,

    #[serde(default = "default_atr_len")]
    pub atr_len: usize,

    /// Long-horizon trend EMA. `None` disables the trend filter.
    #[serde(default = "default_ema_trend_filter_len")]
    pub ema_trend_filter_len: Option<usize>,

    /// EMA length over daily closes.
    #[serde(default = "default_ema_daily_len")]
    pub ema_daily_len: usize,

    // --- Signal thresholds ---------------------------------------------------

    /// Number of preceding bars a breakout must clear.
    #[serde(default = "default_breakout_window")]
    pub breakout_window: usize,

    #[serde(default = "default_volume_surge_multiplier")]
    pub volume_surge_multiplier: f64,

    #[serde(default = "default_rsi_buy_threshold")]
    pub rsi_buy_threshold: f64,

    #[serde(default = "default_rsi_sell_threshold")]
    pub rsi_sell_threshold: f64,

    /// Bars back the daily EMA is compared against for the rising/falling
    /// check.
    #[serde(default = "default_daily_trend_lookback")]
    pub daily_trend_lookback: usize,

    // --- Risk & sizing -------------------------------------------------------

    /// Stop distance = ATR * this.
    #[serde(default = "default_atr_multiplier_sl")]
    pub atr_multiplier_sl: f64,

    /// Target distance = stop distance * this.
    #[serde(default = "default_rr_factor_tp")]
    pub rr_factor_tp: f64,

    /// Fraction of capital risked per trade (0.02 = 2 %).
    #[serde(default = "default_risk_percent_per_trade")]
    pub risk_percent_per_trade: f64,

    #[serde(default = "default_initial_balance")]
    pub initial_balance: f64,

    #[serde(default = "default_min_bars_between_trades")]
    pub min_bars_between_trades: usize,

    #[serde(default = "default_min_position_size")]
    pub min_position_size: f64,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            ema_short_len: default_ema_short_len(),
            ema_long_len: default_ema_long_len(),
            rsi_len: default_rsi_len(),
            vol_sma_len: default_vol_sma_len(),
            atr_len: default_atr_len(),
            ema_trend_filter_len: default_ema_trend_filter_len(),
            ema_daily_len: default_ema_daily_len(),
            breakout_window: default_breakout_window(),
            volume_surge_multiplier: default_volume_surge_multiplier(),
            rsi_buy_threshold: default_rsi_buy_threshold(),
            rsi_sell_threshold: default_rsi_sell_threshold(),
            daily_trend_lookback: default_daily_trend_lookback(),
            atr_multiplier_sl: default_atr_multiplier_sl(),
            rr_factor_tp: default_rr_factor_tp(),
            risk_percent_per_trade: default_risk_percent_per_trade(),
            initial_balance: default_initial_balance(),
            min_bars_between_trades: default_min_bars_between_trades(),
            min_position_size: default_min_position_size(),
        }
    }
}

impl StrategyParams {
    /// Reject parameter sets the pipeline or the trade book cannot use.
    pub fn validate(&self) -> Result<()> {
        let lengths = [
            ("ema_short_len", self.ema_short_len),
            ("ema_long_len", self.ema_long_len),
            ("rsi_len", self.rsi_len),
            ("vol_sma_len", self.vol_sma_len),
            ("atr_len", self.atr_len),
            ("ema_daily_len", self.ema_daily_len),
            ("breakout_window", self.breakout_window),
        ];
        for (name, value) in lengths {
            if value == 0 {
                bail!("{name} must be at least 1");
            }
        }
        if self.ema_trend_filter_len == Some(0) {
            bail!("ema_trend_filter_len must be at least 1 when set");
        }
        if !(self.initial_balance.is_finite() && self.initial_balance > 0.0) {
            bail!("initial_balance must be positive, got {}", self.initial_balance);
        }
        if !(self.risk_percent_per_trade > 0.0 && self.risk_percent_per_trade <= 1.0) {
            bail!(
                "risk_percent_per_trade must be in (0, 1], got {}",
                self.risk_percent_per_trade
            );
        }
        if !(self.atr_multiplier_sl.is_finite() && self.atr_multiplier_sl > 0.0) {
            bail!("atr_multiplier_sl must be positive");
        }
        if !(self.rr_factor_tp.is_finite() && self.rr_factor_tp > 0.0) {
            bail!("rr_factor_tp must be positive");
        }
        if !(self.min_position_size.is_finite() && self.min_position_size >= 0.0) {
            bail!("min_position_size must be non-negative");
        }
        Ok(())
    }
}

// =============================================================================
// Cache & orchestrator settings
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Fraction of the expected bar count a cached window must hold before
    /// the fast paths trust it.
    #[serde(default = "default_density_threshold")]
    pub density_threshold: f64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            density_threshold: default_density_threshold(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    /// Days of history loaded into a new instance's buffer.
    #[serde(default = "default_seed_lookback_days")]
    pub seed_lookback_days: u32,

    /// Floor on the history an instance keeps, in bars.
    #[serde(default = "default_min_required_candles")]
    pub min_required_candles: usize,

    /// Buffer length = required history * this.
    #[serde(default = "default_buffer_retention_multiple")]
    pub buffer_retention_multiple: usize,

    /// Pause before resubscribing after the live stream drops.
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            seed_lookback_days: default_seed_lookback_days(),
            min_required_candles: default_min_required_candles(),
            buffer_retention_multiple: default_buffer_retention_multiple(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
        }
    }
}

/// An instance the service starts on boot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub symbol: String,
    pub strategy: String,
    pub timeframe: String,
    /// Overrides for this instance; falls back to the config-wide defaults.
    #[serde(default)]
    pub params: Option<StrategyParams>,
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Endpoints & storage -------------------------------------------------

    /// SQLite candle cache location.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    #[serde(default = "default_rest_base_url")]
    pub rest_base_url: String,

    #[serde(default = "default_ws_base_url")]
    pub ws_base_url: String,

    /// Address the broadcast WebSocket feed listens on.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Paper fills locally; Live sends signed orders to the exchange.
    #[serde(default)]
    pub execution_mode: ExecutionMode,

    // --- Subsystems ----------------------------------------------------------
    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub orchestrator: OrchestratorSettings,

    /// Defaults for any instance or backtest that does not bring its own.
    #[serde(default)]
    pub strategy_params: StrategyParams,

    #[serde(default)]
    pub autostart: Vec<InstanceSpec>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            rest_base_url: default_rest_base_url(),
            ws_base_url: default_ws_base_url(),
            bind_addr: default_bind_addr(),
            execution_mode: ExecutionMode::default(),
            cache: CacheSettings::default(),
            orchestrator: OrchestratorSettings::default(),
            strategy_params: StrategyParams::default(),
            autostart: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// A missing file is an error so the caller can fall back to defaults
    /// with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            execution_mode = %config.execution_mode,
            autostart = config.autostart.len(),
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the configuration using an atomic write (tmp file, then
    /// rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Apply `RUNNER_BIND_ADDR` / `RUNNER_DB_PATH` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("RUNNER_BIND_ADDR") {
            if !addr.trim().is_empty() {
                self.bind_addr = addr;
            }
        }
        if let Ok(path) = std::env::var("RUNNER_DB_PATH") {
            if !path.trim().is_empty() {
                self.database_path = path;
            }
        }
    }
}
