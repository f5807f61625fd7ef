// =============================================================================
// Exchange Client — the venue operations the core consumes
// =============================================================================
//
// The pipeline only ever talks to this trait: candles, account equity,
// positions, margin, closed PnL, bracket placement, leverage, and instrument
// precision. The Bybit v5 implementation lives in `bybit.rs`; tests script a
// mock. Transient venue failures are retried here with exponential backoff
// (1 s, 2 s, 4 s); when retries exhaust, the caller's cycle aborts cleanly
// and trading resumes next tick.
// =============================================================================

pub mod bybit;

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// A single OHLCV candle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub start_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Whether the candle's interval has fully elapsed.
    pub confirmed: bool,
}

/// One venue position entry. `size` is signed: positive long, negative short.
#[derive(Debug, Clone)]
pub struct PositionInfo {
    pub symbol: String,
    pub size: f64,
    pub entry_price: f64,
    pub position_idx: u8,
}

/// Margin lookup for one (symbol, position_idx) leg.
#[derive(Debug, Clone, Copy)]
pub struct MarginInfo {
    pub found: bool,
    pub margin_ratio: f64,
}

/// A closed trade as the venue reports it.
#[derive(Debug, Clone)]
pub struct ClosedTrade {
    pub symbol: String,
    pub pnl: f64,
    pub created_time_ms: i64,
    pub order_id: Option<String>,
}

/// Quantity precision limits for one instrument.
#[derive(Debug, Clone, Copy)]
pub struct InstrumentInfo {
    pub qty_step: f64,
    pub min_qty: f64,
}

/// A market order, optionally bundled with protective exits.
#[derive(Debug, Clone)]
pub struct BracketOrder {
    pub symbol: String,
    pub side: crate::types::OrderSide,
    pub qty: f64,
    pub take_profit: Option<f64>,
    pub stop_loss: Option<f64>,
    pub trigger_by: crate::types::TriggerBy,
    pub position_idx: u8,
    pub order_link_id: String,
    pub reduce_only: bool,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Venue REST surface consumed by the pipeline.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Recent candles, oldest first.
    async fn klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>>;

    /// Total wallet equity in the settlement currency.
    async fn wallet_equity(&self) -> Result<f64>;

    /// Open positions for `symbol` (possibly several legs in hedge mode).
    async fn positions(&self, symbol: &str) -> Result<Vec<PositionInfo>>;

    /// Margin state for one position leg.
    async fn margin_info(&self, symbol: &str, position_idx: u8) -> Result<MarginInfo>;

    /// Closed trades for `symbol` since `since_ms`, oldest first.
    async fn closed_pnl(&self, symbol: &str, since_ms: i64) -> Result<Vec<ClosedTrade>>;

    /// Submit a bracketed market order; returns the venue order id.
    async fn place_bracket_market(&self, order: &BracketOrder) -> Result<String>;

    /// Ensure the given leverage on both legs.
    async fn set_leverage(&self, symbol: &str, leverage: f64) -> Result<()>;

    /// Quantity step and minimum for `symbol`.
    async fn instrument_info(&self, symbol: &str) -> Result<InstrumentInfo>;
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

/// Run `op`, retrying transient failures up to three times with 1/2/4 s
/// backoff. The final error propagates to the caller.
pub async fn with_retry<T, F, Fut>(label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_err = None;
    for (attempt, delay) in RETRY_DELAYS.iter().enumerate() {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                warn!(
                    label,
                    attempt = attempt + 1,
                    backoff_s = delay.as_secs(),
                    error = %e,
                    "exchange call failed — retrying"
                );
                last_err = Some(e);
                tokio::time::sleep(*delay).await;
            }
        }
    }
    match op().await {
        Ok(v) => Ok(v),
        Err(e) => {
            warn!(label, error = %e, "exchange call failed — retries exhausted");
            Err(e).with_context(|| format!("{label}: retries exhausted"))
        }
    }
}
