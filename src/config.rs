// =============================================================================
// Configuration — validated engine settings with atomic save
// =============================================================================
//
// Three records: the simulator knobs (PaperBrokerConfig), the per-symbol
// safety limits (SafetyConfig), and the top-level AppConfig that ties them to
// a symbol list and an optional replay section.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry serde defaults so that adding new fields never
// breaks loading an older config file. `validate()` is called on every load;
// a malformed config aborts the process before any order is possible.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::TriggerBy;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string()]
}

fn default_interval() -> String {
    "1m".to_string()
}

fn default_fee_bps() -> f64 {
    5.5
}

fn default_maker_rebate_bps() -> f64 {
    -1.0
}

fn default_slippage_bps() -> f64 {
    1.0
}

fn default_max_slippage_bps() -> f64 {
    15.0
}

fn default_spread_slippage_coeff() -> f64 {
    0.5
}

fn default_ofi_slippage_coeff() -> f64 {
    0.1
}

fn default_latency_mean_ms() -> f64 {
    40.0
}

fn default_latency_p95_ms() -> f64 {
    120.0
}

fn default_partial_fill_min_slice_pct() -> f64 {
    0.15
}

fn default_partial_fill_max_slices() -> u32 {
    3
}

fn default_seed() -> u64 {
    42
}

fn default_dedup_window_secs() -> u64 {
    300
}

fn default_max_margin_ratio() -> f64 {
    0.5
}

fn default_max_daily_loss_pct() -> f64 {
    0.03
}

fn default_drawdown_threshold_pct() -> f64 {
    0.10
}

fn default_requests_per_second() -> f64 {
    5.0
}

fn default_requests_per_minute() -> u32 {
    120
}

fn default_risk_pct() -> f64 {
    0.005
}

fn default_stop_loss_pct() -> f64 {
    0.01
}

fn default_take_profit_pct() -> f64 {
    0.02
}

fn default_cash_deploy_cap_pct() -> f64 {
    0.20
}

fn default_leverage() -> f64 {
    3.0
}

fn default_state_file() -> String {
    "risk_state.json".to_string()
}

fn default_replay_speed() -> f64 {
    1.0
}

// =============================================================================
// PaperBrokerConfig
// =============================================================================

/// Simulator knobs: fees, funding, slippage, latency, partial fills.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperBrokerConfig {
    /// Taker fee in basis points.
    #[serde(default = "default_fee_bps")]
    pub fee_bps: f64,

    /// Maker rebate in basis points (typically negative: a credit).
    #[serde(default = "default_maker_rebate_bps")]
    pub maker_rebate_bps: f64,

    /// Apply funding accrual on each fill.
    #[serde(default = "default_true")]
    pub funding_enabled: bool,

    /// Base slippage floor in basis points.
    #[serde(default = "default_slippage_bps")]
    pub slippage_bps: f64,

    /// Ceiling cap on modeled slippage.
    #[serde(default = "default_max_slippage_bps")]
    pub max_slippage_bps: f64,

    /// Multiplier on the measured spread (in bps) added to slippage.
    #[serde(default = "default_spread_slippage_coeff")]
    pub spread_slippage_coeff: f64,

    /// Multiplier on adverse order-flow pressure added to slippage.
    #[serde(default = "default_ofi_slippage_coeff")]
    pub ofi_slippage_coeff: f64,

    /// Mean acknowledgement latency, milliseconds.
    #[serde(default = "default_latency_mean_ms")]
    pub latency_mean_ms: f64,

    /// 95th-percentile acknowledgement latency, milliseconds.
    #[serde(default = "default_latency_p95_ms")]
    pub latency_p95_ms: f64,

    /// Split resting maker fills into multiple slices.
    #[serde(default = "default_true")]
    pub partial_fill_enabled: bool,

    /// Minimum slice size as a fraction of total quantity.
    #[serde(default = "default_partial_fill_min_slice_pct")]
    pub partial_fill_min_slice_pct: f64,

    /// Upper bound on the number of slices per maker fill.
    #[serde(default = "default_partial_fill_max_slices")]
    pub partial_fill_max_slices: u32,

    /// RNG seed — fixes every stochastic draw for reproducible sessions.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// How long a consumed intent id is remembered for idempotent replies.
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,
}

impl Default for PaperBrokerConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty object deserialises via defaults")
    }
}

impl PaperBrokerConfig {
    /// Range checks. Called on config load and on direct construction in
    /// tests; violations are fatal.
    pub fn validate(&self) -> Result<()> {
        if self.max_slippage_bps < self.slippage_bps {
            anyhow::bail!(
                "max_slippage_bps ({}) must be >= slippage_bps ({})",
                self.max_slippage_bps,
                self.slippage_bps
            );
        }
        if self.latency_p95_ms < self.latency_mean_ms {
            anyhow::bail!(
                "latency_p95_ms ({}) must be >= latency_mean_ms ({})",
                self.latency_p95_ms,
                self.latency_mean_ms
            );
        }
        if self.partial_fill_max_slices < 1 {
            anyhow::bail!("partial_fill_max_slices must be >= 1");
        }
        if !(self.partial_fill_min_slice_pct > 0.0 && self.partial_fill_min_slice_pct <= 1.0) {
            anyhow::bail!(
                "partial_fill_min_slice_pct must be in (0, 1] (got {})",
                self.partial_fill_min_slice_pct
            );
        }
        if self.latency_mean_ms < 0.0 {
            anyhow::bail!("latency_mean_ms must be >= 0");
        }
        Ok(())
    }
}

// =============================================================================
// SafetyConfig
// =============================================================================

/// Per-symbol safety limits consulted by the risk-gated pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Halt entries after this many consecutive losing trades (None = off).
    #[serde(default)]
    pub consecutive_loss_limit: Option<u32>,

    /// Block entries when the account margin ratio exceeds this fraction.
    #[serde(default = "default_max_margin_ratio")]
    pub max_margin_ratio: f64,

    /// Daily realized loss cap as a fraction of equity.
    #[serde(default = "default_max_daily_loss_pct")]
    pub max_daily_loss_pct: f64,

    /// Drawdown-from-peak cap as a fraction of peak equity.
    #[serde(default = "default_drawdown_threshold_pct")]
    pub drawdown_threshold_pct: f64,

    /// Cap on entries per session (None = unlimited).
    #[serde(default)]
    pub session_max_trades: Option<u32>,

    /// Cap on session runtime in minutes (None = unlimited).
    #[serde(default)]
    pub session_max_runtime_minutes: Option<u64>,

    /// Exchange request pacing: minimum spacing is 1/requests_per_second.
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,

    /// Exchange request pacing: sliding one-minute window.
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    /// Fraction of equity risked per trade.
    #[serde(default = "default_risk_pct")]
    pub risk_pct: f64,

    /// Stop-loss distance as a fraction of entry price.
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,

    /// Take-profit distance as a fraction of entry price.
    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: f64,

    /// Ceiling on deployed notional as a fraction of equity.
    #[serde(default = "default_cash_deploy_cap_pct")]
    pub cash_deploy_cap_pct: f64,

    /// Leverage to ensure on the venue before the first entry.
    #[serde(default = "default_leverage")]
    pub leverage: f64,

    /// 0 = one-way, 1 = long leg (hedge), 2 = short leg (hedge).
    #[serde(default)]
    pub position_idx: u8,

    /// Price series used for stop triggers.
    #[serde(default)]
    pub trigger_by: TriggerBy,

    /// Emit a reduce-only exit when a bear cross prints against an open long.
    #[serde(default = "default_true")]
    pub early_exit_on_cross: bool,

    /// Path of the durable risk-state snapshot.
    #[serde(default = "default_state_file")]
    pub state_file: String,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty object deserialises via defaults")
    }
}

impl SafetyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.requests_per_second <= 0.0 {
            anyhow::bail!("requests_per_second must be > 0");
        }
        if self.requests_per_minute == 0 {
            anyhow::bail!("requests_per_minute must be >= 1");
        }
        for (name, v) in [
            ("max_daily_loss_pct", self.max_daily_loss_pct),
            ("drawdown_threshold_pct", self.drawdown_threshold_pct),
            ("risk_pct", self.risk_pct),
            ("stop_loss_pct", self.stop_loss_pct),
            ("take_profit_pct", self.take_profit_pct),
            ("cash_deploy_cap_pct", self.cash_deploy_cap_pct),
        ] {
            if !(0.0..=1.0).contains(&v) {
                anyhow::bail!("{name} must be in [0, 1] (got {v})");
            }
        }
        if self.leverage <= 0.0 {
            anyhow::bail!("leverage must be > 0");
        }
        if self.position_idx > 2 {
            anyhow::bail!("position_idx must be 0, 1 or 2 (got {})", self.position_idx);
        }
        Ok(())
    }
}

// =============================================================================
// Replay section
// =============================================================================

/// Where the replay source reads from and how fast it publishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// CSV file of historical snapshots.
    pub file: String,

    /// Speed-up factor over recorded time (1.0 = real time).
    #[serde(default = "default_replay_speed")]
    pub speed: f64,

    /// Inclusive window start (None = from the first row).
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,

    /// Inclusive window end (None = to the last row).
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

// =============================================================================
// AppConfig
// =============================================================================

/// Top-level configuration loaded from the `--config` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Symbols the pipeline trades. One cycle task is spawned per symbol.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Candle interval driving the pipeline cycle (e.g. "1m", "5m").
    #[serde(default = "default_interval")]
    pub interval: String,

    #[serde(default)]
    pub paper: PaperBrokerConfig,

    /// Safety limits applied to every symbol unless overridden below.
    #[serde(default)]
    pub safety: SafetyConfig,

    /// Per-symbol safety overrides (full records).
    #[serde(default)]
    pub safety_overrides: HashMap<String, SafetyConfig>,

    /// Replay section; required only when running in replay mode.
    #[serde(default)]
    pub replay: Option<ReplayConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty object deserialises via defaults")
    }
}

impl AppConfig {
    /// Load configuration from a JSON file at `path` and validate every
    /// record. Errors here are fatal by design.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        config.validate()?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            interval = %config.interval,
            "config loaded"
        );

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() {
            anyhow::bail!("symbols must not be empty");
        }
        self.paper.validate().context("paper section invalid")?;
        self.safety.validate().context("safety section invalid")?;
        for (sym, s) in &self.safety_overrides {
            s.validate()
                .with_context(|| format!("safety override for {sym} invalid"))?;
        }
        if let Some(replay) = &self.replay {
            if replay.speed <= 0.0 {
                anyhow::bail!("replay.speed must be > 0");
            }
        }
        Ok(())
    }

    /// Effective safety config for `symbol` (override or the shared record).
    pub fn safety_for(&self, symbol: &str) -> SafetyConfig {
        self.safety_overrides
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| self.safety.clone())
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }
}
