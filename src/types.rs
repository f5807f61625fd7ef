// =============================================================================
// Shared types used across the Polaris trading engine
// =============================================================================
//
// Everything that crosses the message bus lives here: order intents, execution
// reports, market snapshots, and replay control commands. Wire field names are
// part of the external contract — do not rename without versioning the
// subjects.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Process-wide execution mode, surfaced as a label on every report and metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Live,
    Paper,
    Replay,
}

impl Default for Mode {
    fn default() -> Self {
        Self::Paper
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::Paper => write!(f, "paper"),
            Self::Replay => write!(f, "replay"),
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "live" => Ok(Self::Live),
            "paper" => Ok(Self::Paper),
            "replay" => Ok(Self::Replay),
            other => anyhow::bail!("unknown mode '{other}' (expected live|paper|replay)"),
        }
    }
}

/// Order direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// +1.0 for buy, -1.0 for sell — the sign folded into fill quantities.
    pub fn sign(&self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Supported order types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    StopMarket,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "market"),
            Self::Limit => write!(f, "limit"),
            Self::StopMarket => write!(f, "stop_market"),
        }
    }
}

/// Which price series the venue uses to evaluate stop triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerBy {
    LastPrice,
    MarkPrice,
    IndexPrice,
}

impl Default for TriggerBy {
    fn default() -> Self {
        Self::LastPrice
    }
}

impl std::fmt::Display for TriggerBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LastPrice => write!(f, "LastPrice"),
            Self::MarkPrice => write!(f, "MarkPrice"),
            Self::IndexPrice => write!(f, "IndexPrice"),
        }
    }
}

// ---------------------------------------------------------------------------
// Order intent (subject: trading.orders)
// ---------------------------------------------------------------------------

/// An order request produced by the strategy pipeline (or a manual operator),
/// consumed exactly once by the broker. `id` doubles as the idempotency key
/// and is stable across retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub id: String,
    pub client_id: String,
    pub symbol: String,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub side: OrderSide,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub stop_price: Option<f64>,
    pub quantity: f64,
    #[serde(default)]
    pub reduce_only: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_shadow: bool,
}

impl OrderIntent {
    /// Structural validation: quantity must be positive, limit orders need a
    /// price, stop orders need a trigger price.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.quantity > 0.0) {
            return Err(format!("quantity must be > 0 (got {})", self.quantity));
        }
        if self.order_type == OrderType::Limit && self.price.is_none() {
            return Err("limit order requires a price".to_string());
        }
        if self.order_type == OrderType::StopMarket && self.stop_price.is_none() {
            return Err("stop_market order requires a stop_price".to_string());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Execution report (subject: trading.executions)
// ---------------------------------------------------------------------------

/// Per-fill execution outcome. One intent produces 1..N reports (partial
/// fills) or exactly one rejection. Immutable once published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    /// Id of the originating intent.
    pub intent_id: String,
    pub symbol: String,
    pub executed: bool,
    /// Fill price (0.0 on rejection).
    pub price: f64,
    /// Mark price at the moment of the fill.
    pub mark_price: f64,
    pub quantity: f64,
    pub fees: f64,
    pub funding: f64,
    /// Net realized PnL from this fill (after fees and funding).
    pub realized_pnl: f64,
    /// Slippage vs mid at acknowledgement, basis points.
    pub slippage_bps: f64,
    pub maker: bool,
    pub ack_latency_ms: f64,
    pub fill_latency_ms: f64,
    pub mode: Mode,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_shadow: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub stop_price: Option<f64>,
    /// Price carried on the intent, echoed for audit.
    #[serde(default)]
    pub initial_price: Option<f64>,
}

// ---------------------------------------------------------------------------
// Market snapshot (subject: market.data)
// ---------------------------------------------------------------------------

/// Top-of-book + last-trade snapshot for a single symbol.
///
/// A bid or ask of `0.0` means that side is currently undefined; consumers
/// fall back to the last trade price for mark computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    #[serde(default)]
    pub best_bid: f64,
    #[serde(default)]
    pub best_ask: f64,
    #[serde(default)]
    pub bid_size: f64,
    #[serde(default)]
    pub ask_size: f64,
    #[serde(default)]
    pub last_price: f64,
    pub last_side: OrderSide,
    #[serde(default)]
    pub last_size: f64,
    #[serde(default)]
    pub funding_rate: f64,
    pub timestamp: DateTime<Utc>,
    /// Producer-side OFI, optional; consumers maintain their own accumulator.
    #[serde(default)]
    pub order_flow_imbalance: f64,
}

impl MarketSnapshot {
    /// Mid price: `(bid+ask)/2` when both sides exist, otherwise the last
    /// trade price.
    pub fn mid(&self) -> f64 {
        if self.best_bid > 0.0 && self.best_ask > 0.0 {
            (self.best_bid + self.best_ask) / 2.0
        } else {
            self.last_price
        }
    }

    /// Spread in basis points relative to mid; 0.0 when undefined.
    pub fn spread_bps(&self) -> f64 {
        let mid = self.mid();
        if self.best_bid > 0.0 && self.best_ask > 0.0 && mid > 0.0 {
            ((self.best_ask - self.best_bid) / mid) * 10_000.0
        } else {
            0.0
        }
    }
}

// ---------------------------------------------------------------------------
// Replay control (subject: replay.control)
// ---------------------------------------------------------------------------

/// Command verbs accepted by the replay publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayCommandKind {
    Pause,
    Resume,
    Seek,
}

/// Control message for the replay source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayCommand {
    pub command: ReplayCommandKind,
    /// Target timestamp; required for `seek`.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn intent(order_type: OrderType, price: Option<f64>, stop: Option<f64>, qty: f64) -> OrderIntent {
        OrderIntent {
            id: "i-1".into(),
            client_id: "c-1".into(),
            symbol: "BTCUSDT".into(),
            order_type,
            side: OrderSide::Buy,
            price,
            stop_price: stop,
            quantity: qty,
            reduce_only: false,
            timestamp: Utc::now(),
            is_shadow: false,
        }
    }

    #[test]
    fn market_intent_valid() {
        assert!(intent(OrderType::Market, None, None, 1.0).validate().is_ok());
    }

    #[test]
    fn zero_quantity_rejected() {
        assert!(intent(OrderType::Market, None, None, 0.0).validate().is_err());
        assert!(intent(OrderType::Market, None, None, -2.0).validate().is_err());
    }

    #[test]
    fn limit_requires_price() {
        assert!(intent(OrderType::Limit, None, None, 1.0).validate().is_err());
        assert!(intent(OrderType::Limit, Some(100.0), None, 1.0).validate().is_ok());
    }

    #[test]
    fn stop_requires_trigger() {
        assert!(intent(OrderType::StopMarket, None, None, 1.0).validate().is_err());
        assert!(intent(OrderType::StopMarket, None, Some(95.0), 1.0).validate().is_ok());
    }

    #[test]
    fn intent_wire_field_names() {
        let i = intent(OrderType::StopMarket, None, Some(95.0), 1.0);
        let v: serde_json::Value = serde_json::from_str(&serde_json::to_string(&i).unwrap()).unwrap();
        assert_eq!(v["type"], "stop_market");
        assert_eq!(v["side"], "buy");
        assert!(v["reduce_only"].is_boolean());
    }

    #[test]
    fn snapshot_mid_falls_back_to_last() {
        let snap = MarketSnapshot {
            symbol: "BTCUSDT".into(),
            best_bid: 0.0,
            best_ask: 0.0,
            bid_size: 0.0,
            ask_size: 0.0,
            last_price: 101.5,
            last_side: OrderSide::Buy,
            last_size: 1.0,
            funding_rate: 0.0,
            timestamp: Utc::now(),
            order_flow_imbalance: 0.0,
        };
        assert!((snap.mid() - 101.5).abs() < 1e-12);
        assert_eq!(snap.spread_bps(), 0.0);
    }

    #[test]
    fn snapshot_spread_bps() {
        let snap = MarketSnapshot {
            symbol: "BTCUSDT".into(),
            best_bid: 99.95,
            best_ask: 100.05,
            bid_size: 1.0,
            ask_size: 1.0,
            last_price: 100.0,
            last_side: OrderSide::Sell,
            last_size: 0.5,
            funding_rate: 0.0001,
            timestamp: Utc::now(),
            order_flow_imbalance: 0.0,
        };
        // spread 0.10 on mid 100.0 => 10 bps
        assert!((snap.spread_bps() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn mode_parses_and_displays() {
        assert_eq!("paper".parse::<Mode>().unwrap(), Mode::Paper);
        assert_eq!(Mode::Replay.to_string(), "replay");
        assert!("turbo".parse::<Mode>().is_err());
    }
}
