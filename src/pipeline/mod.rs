// =============================================================================
// Trade Pipeline — risk-gated cycle driver, one instance per symbol
// =============================================================================
//
// Every candle interval the pipeline runs one cycle:
//
//   1. enablement          5. session caps        9.  occupancy
//   2. account refresh     6. market data         10. pre-order checks
//   3. closed-PnL sync     7. duplicate guard     11. placement
//   4. risk gates          8. signal / early exit
//
// Gates are strict and ordered; the first refusal ends the cycle with a
// tagged SAFETY_* log plus its structured alert. Gate refusals are normal
// safety behavior, not errors — nothing escapes the top of a cycle. Two
// cycles for the same symbol never overlap: each pipeline runs on its own
// sequential interval loop.
// =============================================================================

pub mod reconcile;
pub mod sizing;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::alerts::{AlertCategory, AlertSink};
use crate::bus::MessageBus;
use crate::config::SafetyConfig;
use crate::exchange::{with_retry, BracketOrder, ExchangeClient, InstrumentInfo};
use crate::execution::{ExecutionGateway, RouteResult};
use crate::rate_limit::RequestPacer;
use crate::risk_state::RiskStateStore;
use crate::signals::Signals;
use crate::types::Mode;

use reconcile::{startup_reconciliation, ReconcileOutcome};

/// Closed-PnL ingestion happens at most this often.
const PNL_SYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Closed trades are pulled over this lookback window.
const PNL_LOOKBACK_MS: i64 = 24 * 60 * 60 * 1000;

/// Minimum closed candles required before a signal is computed.
const MIN_CANDLES: usize = 35;

/// Candles requested per cycle.
const CANDLE_FETCH_LIMIT: u32 = 100;

// ---------------------------------------------------------------------------
// Cycle outcome
// ---------------------------------------------------------------------------

/// How one cycle ended. Gate refusals carry their own variants so scenarios
/// can assert on exact behavior.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Disabled,
    NoEquity,
    CircuitBreaker,
    DailyLoss,
    Drawdown,
    ReconBlocked,
    SessionTrades,
    SessionRuntime,
    InsufficientData,
    DuplicateCandle,
    NoSignal,
    EarlyExit,
    PositionOccupied,
    MarginBlocked,
    BelowMinQty,
    Entered,
    Failed(String),
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

struct CycleState {
    current_position_qty: f64,
    entry_equity: f64,
    leverage_set: bool,
    recon_blocked: bool,
    last_candle_ts: Option<i64>,
    last_pnl_sync: Option<Instant>,
    session_trades: u32,
    session_start: Instant,
    instrument: Option<InstrumentInfo>,
}

pub struct TradePipeline {
    symbol: String,
    interval: String,
    mode: Mode,
    cfg: SafetyConfig,
    client_id: String,
    exchange: Arc<dyn ExchangeClient>,
    gateway: ExecutionGateway,
    signals: Arc<dyn Signals>,
    risk_state: Arc<RiskStateStore>,
    alerts: Arc<dyn AlertSink>,
    pacer: RequestPacer,
    bus: Arc<dyn MessageBus>,
    risk_subject: String,
    enabled: AtomicBool,
    state: Mutex<CycleState>,
}

impl TradePipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: impl Into<String>,
        interval: impl Into<String>,
        mode: Mode,
        cfg: SafetyConfig,
        exchange: Arc<dyn ExchangeClient>,
        gateway: ExecutionGateway,
        signals: Arc<dyn Signals>,
        risk_state: Arc<RiskStateStore>,
        alerts: Arc<dyn AlertSink>,
        bus: Arc<dyn MessageBus>,
        risk_subject: impl Into<String>,
    ) -> Self {
        let symbol = symbol.into();
        let pacer = RequestPacer::new(cfg.requests_per_second, cfg.requests_per_minute);
        Self {
            client_id: format!("pipeline-{symbol}"),
            symbol,
            interval: interval.into(),
            mode,
            cfg,
            exchange,
            gateway,
            signals,
            risk_state,
            alerts,
            pacer,
            bus,
            risk_subject: risk_subject.into(),
            enabled: AtomicBool::new(true),
            state: Mutex::new(CycleState {
                current_position_qty: 0.0,
                entry_equity: 0.0,
                leverage_set: false,
                recon_blocked: false,
                last_candle_ts: None,
                last_pnl_sync: None,
                session_trades: 0,
                session_start: Instant::now(),
                instrument: None,
            }),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Startup reconciliation: must run once before the first cycle.
    pub async fn initialize(&self) {
        let outcome = startup_reconciliation(
            self.exchange.as_ref(),
            &self.symbol,
            self.cfg.position_idx,
            &self.alerts,
        )
        .await;

        let mut state = self.state.lock();
        match outcome {
            ReconcileOutcome::Clear => {}
            ReconcileOutcome::Adopted(size) => {
                state.current_position_qty = size;
            }
            ReconcileOutcome::Blocked => {
                state.recon_blocked = true;
            }
        }
    }

    /// Drive cycles forever at the candle interval.
    pub async fn run(self: Arc<Self>) {
        let period = interval_duration(&self.interval);
        info!(
            symbol = %self.symbol,
            interval = %self.interval,
            period_s = period.as_secs(),
            "pipeline loop starting"
        );
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let outcome = self.run_cycle().await;
            debug!(symbol = %self.symbol, outcome = ?outcome, "cycle finished");
        }
    }

    // -------------------------------------------------------------------------
    // One cycle
    // -------------------------------------------------------------------------

    pub async fn run_cycle(&self) -> CycleOutcome {
        // ── 1. Enablement ────────────────────────────────────────────────
        if !self.enabled.load(Ordering::Relaxed) {
            return CycleOutcome::Disabled;
        }

        // ── 2. Account refresh ───────────────────────────────────────────
        self.pacer.acquire().await;
        let equity = match with_retry("wallet_equity", || self.exchange.wallet_equity()).await {
            Ok(e) => e,
            Err(e) => return self.cycle_failed("account refresh failed", e),
        };
        if equity <= 0.0 {
            warn!(symbol = %self.symbol, equity, "non-positive equity — aborting cycle");
            return CycleOutcome::NoEquity;
        }

        // In live mode the venue owns position truth; paper fills live in the
        // simulator, so the internal counter is authoritative there.
        if self.mode == Mode::Live {
            self.pacer.acquire().await;
            match with_retry("positions", || self.exchange.positions(&self.symbol)).await {
                Ok(positions) => {
                    let size: f64 = positions
                        .iter()
                        .filter(|p| p.position_idx == self.cfg.position_idx)
                        .map(|p| p.size)
                        .sum();
                    self.state.lock().current_position_qty = size.max(0.0);
                }
                Err(e) => return self.cycle_failed("position refresh failed", e),
            }
        }

        // ── 3. Closed-PnL ingestion (throttled) + peak update ────────────
        if self.pnl_sync_due() {
            if let Err(e) = self.ingest_closed_pnl().await {
                // Ingestion failures skip this sync but do not kill the cycle.
                warn!(symbol = %self.symbol, error = %e, "closed-PnL sync failed");
            }
        }
        self.risk_state.update_peak(equity);

        // ── 4. Risk gates (strict order) ─────────────────────────────────
        if let Some(limit) = self.cfg.consecutive_loss_limit {
            let losses = self.risk_state.consecutive_losses();
            if losses >= limit {
                warn!(
                    symbol = %self.symbol,
                    losses,
                    limit,
                    "SAFETY_CIRCUIT_BREAKER: consecutive-loss limit reached"
                );
                self.alerts.emit(
                    AlertCategory::SafetyCircuitBreaker,
                    "consecutive-loss circuit breaker tripped",
                    &[
                        ("symbol", self.symbol.clone()),
                        ("losses", losses.to_string()),
                        ("limit", limit.to_string()),
                    ],
                );
                return CycleOutcome::CircuitBreaker;
            }
        }

        let daily = self.risk_state.daily_pnl_today();
        let daily_loss_frac = (-daily.min(0.0)) / equity;
        if daily_loss_frac > self.cfg.max_daily_loss_pct {
            warn!(
                symbol = %self.symbol,
                daily_pnl = daily,
                loss_frac = daily_loss_frac,
                limit = self.cfg.max_daily_loss_pct,
                "SAFETY_DAILY_LOSS: daily loss limit breached"
            );
            self.alerts.emit(
                AlertCategory::SafetyDailyLoss,
                "daily loss limit breached",
                &[
                    ("symbol", self.symbol.clone()),
                    ("daily_pnl", format!("{daily:.2}")),
                    ("equity", format!("{equity:.2}")),
                ],
            );
            return CycleOutcome::DailyLoss;
        }

        let peak = self.risk_state.peak_equity();
        let drawdown = self.risk_state.drawdown(equity);
        if peak > 0.0 && drawdown > self.cfg.drawdown_threshold_pct {
            warn!(
                symbol = %self.symbol,
                peak,
                equity,
                drawdown,
                limit = self.cfg.drawdown_threshold_pct,
                "SAFETY_DRAWDOWN: drawdown limit breached"
            );
            self.alerts.emit(
                AlertCategory::SafetyDrawdown,
                "drawdown limit breached",
                &[
                    ("symbol", self.symbol.clone()),
                    ("peak", format!("{peak:.2}")),
                    ("equity", format!("{equity:.2}")),
                ],
            );
            return CycleOutcome::Drawdown;
        }

        if self.state.lock().recon_blocked {
            warn!(
                symbol = %self.symbol,
                "SAFETY_RECON_BLOCK: reconciliation latch active — no new entries"
            );
            self.alerts.emit(
                AlertCategory::SafetyReconBlock,
                "reconciliation latch active",
                &[("symbol", self.symbol.clone())],
            );
            return CycleOutcome::ReconBlocked;
        }

        // ── 5. Session gates ─────────────────────────────────────────────
        if let Some(max_trades) = self.cfg.session_max_trades {
            let trades = self.state.lock().session_trades;
            if trades >= max_trades {
                warn!(
                    symbol = %self.symbol,
                    trades,
                    max_trades,
                    "SAFETY_SESSION_TRADES: session trade cap reached"
                );
                self.alerts.emit(
                    AlertCategory::SafetySessionTrades,
                    "session trade cap reached",
                    &[
                        ("symbol", self.symbol.clone()),
                        ("trades", trades.to_string()),
                    ],
                );
                return CycleOutcome::SessionTrades;
            }
        }
        if let Some(max_minutes) = self.cfg.session_max_runtime_minutes {
            let elapsed = self.state.lock().session_start.elapsed();
            if elapsed >= Duration::from_secs(max_minutes * 60) {
                warn!(
                    symbol = %self.symbol,
                    elapsed_min = elapsed.as_secs() / 60,
                    max_minutes,
                    "SAFETY_SESSION_RUNTIME: session runtime cap reached"
                );
                self.alerts.emit(
                    AlertCategory::SafetySessionRuntime,
                    "session runtime cap reached",
                    &[("symbol", self.symbol.clone())],
                );
                return CycleOutcome::SessionRuntime;
            }
        }

        // ── 6. Market data ───────────────────────────────────────────────
        self.pacer.acquire().await;
        let candles = match with_retry("klines", || {
            self.exchange
                .klines(&self.symbol, &self.interval, CANDLE_FETCH_LIMIT)
        })
        .await
        {
            Ok(c) => c,
            Err(e) => return self.cycle_failed("kline fetch failed", e),
        };
        let closed: Vec<_> = candles.into_iter().filter(|c| c.confirmed).collect();
        if closed.len() < MIN_CANDLES {
            debug!(
                symbol = %self.symbol,
                closed = closed.len(),
                needed = MIN_CANDLES,
                "insufficient closed candles"
            );
            return CycleOutcome::InsufficientData;
        }

        // ── 7. Duplicate-candle guard ────────────────────────────────────
        let last_ts = closed.last().map(|c| c.start_ms).unwrap_or(0);
        {
            let mut state = self.state.lock();
            if state.last_candle_ts == Some(last_ts) {
                return CycleOutcome::DuplicateCandle;
            }
            state.last_candle_ts = Some(last_ts);
        }

        // ── 8. Signal + early exit ───────────────────────────────────────
        let Some(reading) = self.signals.evaluate(&closed) else {
            return CycleOutcome::NoSignal;
        };

        if self.cfg.early_exit_on_cross && reading.bear_cross {
            let held = self.state.lock().current_position_qty;
            if held > 0.0 {
                // Exactly one reduce-only exit per detected cross; the same
                // cycle never also enters.
                info!(
                    symbol = %self.symbol,
                    qty = held,
                    prev_fast = reading.prev_fast,
                    prev_slow = reading.prev_slow,
                    "bear cross against open long — exiting early"
                );
                let link = format!("{}-exit-{last_ts}", self.client_id);
                let result = self
                    .gateway
                    .submit_reduce_only_exit(&self.symbol, held, link)
                    .await;
                if result.is_success() {
                    self.state.lock().current_position_qty = 0.0;
                } else {
                    warn!(symbol = %self.symbol, result = %result, "early exit routing failed");
                }
                self.publish_risk_snapshot().await;
                return CycleOutcome::EarlyExit;
            }
        }

        // ── 9. Position occupancy ────────────────────────────────────────
        if self.state.lock().current_position_qty > 0.0 {
            return CycleOutcome::PositionOccupied;
        }

        if !reading.enter_long {
            self.publish_risk_snapshot().await;
            return CycleOutcome::NoSignal;
        }

        // ── 10. Pre-order checks ─────────────────────────────────────────
        self.pacer.acquire().await;
        match with_retry("margin_info", || {
            self.exchange.margin_info(&self.symbol, self.cfg.position_idx)
        })
        .await
        {
            Ok(margin) => {
                if margin.found && margin.margin_ratio > self.cfg.max_margin_ratio {
                    warn!(
                        symbol = %self.symbol,
                        margin_ratio = margin.margin_ratio,
                        limit = self.cfg.max_margin_ratio,
                        "SAFETY_MARGIN_BLOCK: margin ratio too high"
                    );
                    self.alerts.emit(
                        AlertCategory::SafetyMarginBlock,
                        "margin ratio above limit",
                        &[
                            ("symbol", self.symbol.clone()),
                            ("margin_ratio", format!("{:.4}", margin.margin_ratio)),
                            ("limit", format!("{:.4}", self.cfg.max_margin_ratio)),
                        ],
                    );
                    return CycleOutcome::MarginBlocked;
                }
            }
            Err(e) => return self.cycle_failed("margin lookup failed", e),
        }

        if !self.state.lock().leverage_set {
            self.pacer.acquire().await;
            match self.exchange.set_leverage(&self.symbol, self.cfg.leverage).await {
                Ok(()) => self.state.lock().leverage_set = true,
                Err(e) => {
                    // Retried next cycle; entering at current leverage.
                    warn!(symbol = %self.symbol, error = %e, "leverage set failed");
                }
            }
        }

        let instrument = match self.instrument().await {
            Ok(i) => i,
            Err(e) => return self.cycle_failed("instrument lookup failed", e),
        };

        let qty = sizing::position_size(
            equity,
            self.cfg.risk_pct,
            self.cfg.stop_loss_pct,
            reading.price,
            self.cfg.cash_deploy_cap_pct,
            instrument,
        );
        if qty <= 0.0 {
            debug!(
                symbol = %self.symbol,
                equity,
                price = reading.price,
                "sized below venue minimum — skipping entry"
            );
            return CycleOutcome::BelowMinQty;
        }

        // ── 11. Order placement ──────────────────────────────────────────
        let (take_profit, stop_loss) =
            sizing::bracket_prices(reading.price, self.cfg.take_profit_pct, self.cfg.stop_loss_pct);
        let order = BracketOrder {
            symbol: self.symbol.clone(),
            side: crate::types::OrderSide::Buy,
            qty,
            take_profit: Some(take_profit),
            stop_loss: Some(stop_loss),
            trigger_by: self.cfg.trigger_by,
            position_idx: self.cfg.position_idx,
            order_link_id: format!("{}-{last_ts}", self.client_id),
            reduce_only: false,
        };

        let result = self.gateway.submit_bracket(&order).await;
        match result {
            RouteResult::Routed(_) | RouteResult::Placed(_) => {
                {
                    let mut state = self.state.lock();
                    state.current_position_qty = qty;
                    state.entry_equity = equity;
                    state.session_trades += 1;
                }
                info!(
                    symbol = %self.symbol,
                    qty,
                    price = reading.price,
                    take_profit,
                    stop_loss,
                    "entry placed"
                );
                self.publish_risk_snapshot().await;
                CycleOutcome::Entered
            }
            RouteResult::Error(e) => {
                self.cycle_failed("order placement failed", anyhow::anyhow!(e))
            }
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn cycle_failed(&self, context: &str, e: anyhow::Error) -> CycleOutcome {
        error!(symbol = %self.symbol, error = %e, "{context} — cycle aborted");
        CycleOutcome::Failed(format!("{context}: {e}"))
    }

    fn pnl_sync_due(&self) -> bool {
        let state = self.state.lock();
        match state.last_pnl_sync {
            Some(last) => last.elapsed() >= PNL_SYNC_INTERVAL,
            None => true,
        }
    }

    async fn ingest_closed_pnl(&self) -> anyhow::Result<()> {
        self.state.lock().last_pnl_sync = Some(Instant::now());

        self.pacer.acquire().await;
        let since = Utc::now().timestamp_millis() - PNL_LOOKBACK_MS;
        let trades =
            with_retry("closed_pnl", || self.exchange.closed_pnl(&self.symbol, since)).await?;

        let mut accepted = 0;
        for trade in &trades {
            if self
                .risk_state
                .record_trade(trade.pnl, trade.created_time_ms, trade.order_id.as_deref())
            {
                accepted += 1;
            }
        }
        if accepted > 0 {
            info!(symbol = %self.symbol, accepted, "closed trades ingested");
        }
        Ok(())
    }

    async fn instrument(&self) -> anyhow::Result<InstrumentInfo> {
        if let Some(i) = self.state.lock().instrument {
            return Ok(i);
        }
        self.pacer.acquire().await;
        let info =
            with_retry("instrument_info", || self.exchange.instrument_info(&self.symbol)).await?;
        self.state.lock().instrument = Some(info);
        Ok(info)
    }

    /// Observability snapshot on `risk.state`; best-effort.
    async fn publish_risk_snapshot(&self) {
        let snap = self.risk_state.snapshot();
        let (qty, entry_equity, trades, blocked) = {
            let state = self.state.lock();
            (
                state.current_position_qty,
                state.entry_equity,
                state.session_trades,
                state.recon_blocked,
            )
        };
        let payload = serde_json::json!({
            "symbol": self.symbol,
            "mode": self.mode.to_string(),
            "peak_equity": snap.peak_equity,
            "daily_pnl": self.risk_state.daily_pnl_today(),
            "consecutive_losses": snap.consecutive_losses,
            "current_position_qty": qty,
            "entry_equity": entry_equity,
            "session_trades": trades,
            "recon_blocked": blocked,
            "timestamp": Utc::now().to_rfc3339(),
        });
        if let Err(e) = self
            .bus
            .publish(&self.risk_subject, payload.to_string().into_bytes())
            .await
        {
            debug!(error = %e, "risk snapshot publication failed");
        }
    }
}

/// Candle interval token to wall-clock period.
pub fn interval_duration(interval: &str) -> Duration {
    match interval {
        "1m" => Duration::from_secs(60),
        "3m" => Duration::from_secs(180),
        "5m" => Duration::from_secs(300),
        "15m" => Duration::from_secs(900),
        "30m" => Duration::from_secs(1800),
        "1h" => Duration::from_secs(3600),
        "4h" => Duration::from_secs(4 * 3600),
        "1d" => Duration::from_secs(24 * 3600),
        _ => Duration::from_secs(60),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::RecordingAlertSink;
    use crate::bus::LocalBus;
    use crate::exchange::{Candle, ClosedTrade, MarginInfo, PositionInfo};
    use crate::risk_state::RiskStateStore;
    use crate::signals::SignalReading;
    use crate::types::{OrderIntent, OrderSide};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    const ORDERS: &str = "trading.orders";
    const RISK: &str = "risk.state";

    // -- scripted collaborators ---------------------------------------------

    struct MockExchange {
        equity: Mutex<f64>,
        candles: Mutex<Vec<Candle>>,
        positions: Mutex<Vec<PositionInfo>>,
        margin: Mutex<MarginInfo>,
        closed: Mutex<Vec<ClosedTrade>>,
        instrument: Mutex<InstrumentInfo>,
        closed_pnl_calls: AtomicU32,
    }

    impl Default for MockExchange {
        fn default() -> Self {
            Self {
                equity: Mutex::new(1_000.0),
                candles: Mutex::new(confirmed_candles(40, 100.0)),
                positions: Mutex::new(vec![]),
                margin: Mutex::new(MarginInfo {
                    found: false,
                    margin_ratio: 0.0,
                }),
                closed: Mutex::new(vec![]),
                instrument: Mutex::new(InstrumentInfo {
                    qty_step: 0.001,
                    min_qty: 0.001,
                }),
                closed_pnl_calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ExchangeClient for MockExchange {
        async fn klines(&self, _: &str, _: &str, _: u32) -> Result<Vec<Candle>> {
            Ok(self.candles.lock().clone())
        }
        async fn wallet_equity(&self) -> Result<f64> {
            Ok(*self.equity.lock())
        }
        async fn positions(&self, _: &str) -> Result<Vec<PositionInfo>> {
            Ok(self.positions.lock().clone())
        }
        async fn margin_info(&self, _: &str, _: u8) -> Result<MarginInfo> {
            Ok(*self.margin.lock())
        }
        async fn closed_pnl(&self, _: &str, _: i64) -> Result<Vec<ClosedTrade>> {
            self.closed_pnl_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.closed.lock().clone())
        }
        async fn place_bracket_market(&self, _: &BracketOrder) -> Result<String> {
            Ok("venue-order-1".into())
        }
        async fn set_leverage(&self, _: &str, _: f64) -> Result<()> {
            Ok(())
        }
        async fn instrument_info(&self, _: &str) -> Result<InstrumentInfo> {
            Ok(*self.instrument.lock())
        }
    }

    struct ScriptedSignals {
        reading: Mutex<Option<SignalReading>>,
    }

    impl ScriptedSignals {
        fn entering(price: f64) -> Self {
            Self {
                reading: Mutex::new(Some(SignalReading {
                    enter_long: true,
                    bear_cross: false,
                    prev_fast: 99.0,
                    prev_slow: 99.5,
                    fast: 100.5,
                    slow: 100.0,
                    price,
                })),
            }
        }

        fn idle() -> Self {
            Self {
                reading: Mutex::new(Some(SignalReading {
                    enter_long: false,
                    bear_cross: false,
                    prev_fast: 100.0,
                    prev_slow: 99.0,
                    fast: 100.0,
                    slow: 99.0,
                    price: 100.0,
                })),
            }
        }

        fn bearish() -> Self {
            Self {
                reading: Mutex::new(Some(SignalReading {
                    enter_long: false,
                    bear_cross: true,
                    prev_fast: 100.0,
                    prev_slow: 99.5,
                    fast: 99.0,
                    slow: 99.5,
                    price: 99.0,
                })),
            }
        }
    }

    impl Signals for ScriptedSignals {
        fn evaluate(&self, _: &[Candle]) -> Option<SignalReading> {
            *self.reading.lock()
        }
    }

    fn confirmed_candles(n: usize, close: f64) -> Vec<Candle> {
        (0..n)
            .map(|i| Candle {
                start_ms: 1_700_000_000_000 + i as i64 * 60_000,
                open: close,
                high: close,
                low: close,
                close,
                volume: 1.0,
                confirmed: true,
            })
            .collect()
    }

    struct Harness {
        pipeline: Arc<TradePipeline>,
        exchange: Arc<MockExchange>,
        alerts: Arc<RecordingAlertSink>,
        bus: Arc<LocalBus>,
        store_dir: tempfile::TempDir,
    }

    async fn harness(cfg: SafetyConfig, signals: Arc<dyn Signals>) -> Harness {
        harness_with(cfg, signals, Arc::new(MockExchange::default())).await
    }

    async fn harness_with(
        mut cfg: SafetyConfig,
        signals: Arc<dyn Signals>,
        exchange: Arc<MockExchange>,
    ) -> Harness {
        cfg.requests_per_second = 10_000.0;
        cfg.requests_per_minute = 1_000_000;

        let alerts = Arc::new(RecordingAlertSink::default());
        let alerts_dyn: Arc<dyn AlertSink> = alerts.clone();
        let bus = Arc::new(LocalBus::new());
        let store_dir = tempfile::tempdir().unwrap();
        let (store, _) =
            RiskStateStore::open(store_dir.path().join("risk_state.json"), alerts_dyn.clone());
        let risk_state = Arc::new(store);

        let gateway = ExecutionGateway::new(
            Mode::Paper,
            "pipeline-BTCUSDT",
            bus.clone(),
            ORDERS,
            exchange.clone(),
        );

        let pipeline = Arc::new(TradePipeline::new(
            "BTCUSDT",
            "1m",
            Mode::Paper,
            cfg,
            exchange.clone(),
            gateway,
            signals,
            risk_state,
            alerts_dyn,
            bus.clone(),
            RISK,
        ));

        Harness {
            pipeline,
            exchange,
            alerts,
            bus,
            store_dir,
        }
    }

    async fn next_intent(rx: &mut tokio::sync::mpsc::Receiver<Vec<u8>>) -> OrderIntent {
        let payload = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("no intent published")
            .unwrap();
        serde_json::from_slice(&payload).unwrap()
    }

    // -- scenarios ----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn bull_cross_enters_with_risk_sized_bracket() {
        let h = harness(SafetyConfig::default(), Arc::new(ScriptedSignals::entering(100.0))).await;
        let mut rx = h.bus.subscribe(ORDERS).await.unwrap();

        h.pipeline.initialize().await;
        assert_eq!(h.pipeline.run_cycle().await, CycleOutcome::Entered);

        let intent = next_intent(&mut rx).await;
        // equity 1000, risk 0.5%, SL 1%, cap 20% -> min(500, 200)/100 = 2.0
        assert!((intent.quantity - 2.0).abs() < 1e-9);
        assert_eq!(intent.side, OrderSide::Buy);
        assert_eq!(intent.client_id, "pipeline-BTCUSDT");
        // SL echoed on the intent: 100 * (1 - 0.01)
        assert!((intent.stop_price.unwrap() - 99.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn circuit_breaker_blocks_with_single_alert() {
        let mut cfg = SafetyConfig::default();
        cfg.consecutive_loss_limit = Some(3);
        let h = harness(cfg, Arc::new(ScriptedSignals::entering(100.0))).await;
        let mut rx = h.bus.subscribe(ORDERS).await.unwrap();

        for i in 0..3 {
            h.pipeline
                .risk_state
                .record_trade(-10.0, 1_700_000_000_000 + i, None);
        }

        h.pipeline.initialize().await;
        assert_eq!(h.pipeline.run_cycle().await, CycleOutcome::CircuitBreaker);
        assert_eq!(h.alerts.count(AlertCategory::SafetyCircuitBreaker), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn circuit_breaker_recurs_after_state_restore() {
        let mut cfg = SafetyConfig::default();
        cfg.consecutive_loss_limit = Some(3);
        let h = harness(cfg.clone(), Arc::new(ScriptedSignals::entering(100.0))).await;

        for i in 0..3 {
            h.pipeline
                .risk_state
                .record_trade(-10.0, 1_700_000_000_000 + i, None);
        }
        h.pipeline.initialize().await;
        assert_eq!(h.pipeline.run_cycle().await, CycleOutcome::CircuitBreaker);

        // Reload the persisted state into a fresh store: the same abort
        // recurs without any new trade.
        let alerts: Arc<dyn AlertSink> = Arc::new(RecordingAlertSink::default());
        let (restored, status) = RiskStateStore::open(
            h.store_dir.path().join("risk_state.json"),
            alerts,
        );
        assert_eq!(status, crate::risk_state::LoadStatus::Loaded);
        assert_eq!(restored.consecutive_losses(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn daily_loss_gate_blocks() {
        let h = harness(SafetyConfig::default(), Arc::new(ScriptedSignals::entering(100.0))).await;
        // 5% of equity lost today (limit 3%).
        h.pipeline
            .risk_state
            .record_trade(-50.0, Utc::now().timestamp_millis(), None);

        h.pipeline.initialize().await;
        assert_eq!(h.pipeline.run_cycle().await, CycleOutcome::DailyLoss);
        assert_eq!(h.alerts.count(AlertCategory::SafetyDailyLoss), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn drawdown_gate_blocks() {
        let h = harness(SafetyConfig::default(), Arc::new(ScriptedSignals::entering(100.0))).await;
        // Peak 2000 vs equity 1000: 50% drawdown against a 10% limit.
        h.pipeline.risk_state.update_peak(2_000.0);

        h.pipeline.initialize().await;
        assert_eq!(h.pipeline.run_cycle().await, CycleOutcome::Drawdown);
        assert_eq!(h.alerts.count(AlertCategory::SafetyDrawdown), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn margin_block_refuses_entry() {
        let mut cfg = SafetyConfig::default();
        cfg.max_margin_ratio = 0.10;
        let exchange = Arc::new(MockExchange::default());
        *exchange.margin.lock() = MarginInfo {
            found: true,
            margin_ratio: 0.85,
        };
        let h = harness_with(cfg, Arc::new(ScriptedSignals::entering(100.0)), exchange).await;
        let mut rx = h.bus.subscribe(ORDERS).await.unwrap();

        h.pipeline.initialize().await;
        assert_eq!(h.pipeline.run_cycle().await, CycleOutcome::MarginBlocked);
        assert_eq!(h.alerts.count(AlertCategory::SafetyMarginBlock), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn short_on_venue_latches_recon_block() {
        let exchange = Arc::new(MockExchange::default());
        exchange.positions.lock().push(PositionInfo {
            symbol: "BTCUSDT".into(),
            size: -1.0,
            entry_price: 100.0,
            position_idx: 0,
        });
        let h = harness_with(
            SafetyConfig::default(),
            Arc::new(ScriptedSignals::entering(100.0)),
            exchange,
        )
        .await;

        h.pipeline.initialize().await;
        assert_eq!(h.alerts.count(AlertCategory::SafetyReconAdopt), 1);
        assert_eq!(h.alerts.count(AlertCategory::SafetyReconBlock), 1);

        // Every subsequent cycle aborts on the latch.
        assert_eq!(h.pipeline.run_cycle().await, CycleOutcome::ReconBlocked);
        assert_eq!(h.pipeline.run_cycle().await, CycleOutcome::ReconBlocked);
        assert_eq!(h.alerts.count(AlertCategory::SafetyReconBlock), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn adopted_long_occupies_the_slot() {
        let exchange = Arc::new(MockExchange::default());
        exchange.positions.lock().push(PositionInfo {
            symbol: "BTCUSDT".into(),
            size: 1.5,
            entry_price: 100.0,
            position_idx: 0,
        });
        let h = harness_with(
            SafetyConfig::default(),
            Arc::new(ScriptedSignals::entering(100.0)),
            exchange,
        )
        .await;

        h.pipeline.initialize().await;
        assert_eq!(h.pipeline.run_cycle().await, CycleOutcome::PositionOccupied);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_candle_is_skipped() {
        let h = harness(SafetyConfig::default(), Arc::new(ScriptedSignals::idle())).await;

        h.pipeline.initialize().await;
        assert_eq!(h.pipeline.run_cycle().await, CycleOutcome::NoSignal);
        // Same candle set again: guard short-circuits before the signal.
        assert_eq!(h.pipeline.run_cycle().await, CycleOutcome::DuplicateCandle);

        // A fresh candle unblocks the cycle.
        h.exchange
            .candles
            .lock()
            .push(Candle {
                start_ms: 1_800_000_000_000,
                open: 100.0,
                high: 100.0,
                low: 100.0,
                close: 100.0,
                volume: 1.0,
                confirmed: true,
            });
        assert_eq!(h.pipeline.run_cycle().await, CycleOutcome::NoSignal);
    }

    #[tokio::test(start_paused = true)]
    async fn bear_cross_emits_exactly_one_reduce_only_exit() {
        let exchange = Arc::new(MockExchange::default());
        exchange.positions.lock().push(PositionInfo {
            symbol: "BTCUSDT".into(),
            size: 1.5,
            entry_price: 100.0,
            position_idx: 0,
        });
        let h = harness_with(
            SafetyConfig::default(),
            Arc::new(ScriptedSignals::bearish()),
            exchange,
        )
        .await;
        let mut rx = h.bus.subscribe(ORDERS).await.unwrap();

        h.pipeline.initialize().await;
        assert_eq!(h.pipeline.run_cycle().await, CycleOutcome::EarlyExit);

        let intent = next_intent(&mut rx).await;
        assert!(intent.reduce_only);
        assert_eq!(intent.side, OrderSide::Sell);
        assert!((intent.quantity - 1.5).abs() < 1e-9);

        // The cross produced one exit and no entry.
        assert!(rx.try_recv().is_err());
        assert_eq!(h.pipeline.state.lock().current_position_qty, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn session_trade_cap_halts_entries() {
        let mut cfg = SafetyConfig::default();
        cfg.session_max_trades = Some(0);
        let h = harness(cfg, Arc::new(ScriptedSignals::entering(100.0))).await;

        h.pipeline.initialize().await;
        assert_eq!(h.pipeline.run_cycle().await, CycleOutcome::SessionTrades);
        assert_eq!(h.alerts.count(AlertCategory::SafetySessionTrades), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn below_minimum_quantity_skips_entry() {
        let exchange = Arc::new(MockExchange::default());
        *exchange.instrument.lock() = InstrumentInfo {
            qty_step: 0.001,
            min_qty: 50.0,
        };
        let h = harness_with(
            SafetyConfig::default(),
            Arc::new(ScriptedSignals::entering(100.0)),
            exchange,
        )
        .await;

        h.pipeline.initialize().await;
        assert_eq!(h.pipeline.run_cycle().await, CycleOutcome::BelowMinQty);
    }

    #[tokio::test(start_paused = true)]
    async fn insufficient_candles_abort() {
        let exchange = Arc::new(MockExchange::default());
        *exchange.candles.lock() = confirmed_candles(10, 100.0);
        let h = harness_with(
            SafetyConfig::default(),
            Arc::new(ScriptedSignals::entering(100.0)),
            exchange,
        )
        .await;

        h.pipeline.initialize().await;
        assert_eq!(h.pipeline.run_cycle().await, CycleOutcome::InsufficientData);
    }

    #[tokio::test(start_paused = true)]
    async fn nonpositive_equity_aborts() {
        let exchange = Arc::new(MockExchange::default());
        *exchange.equity.lock() = 0.0;
        let h = harness_with(
            SafetyConfig::default(),
            Arc::new(ScriptedSignals::entering(100.0)),
            exchange,
        )
        .await;

        h.pipeline.initialize().await;
        assert_eq!(h.pipeline.run_cycle().await, CycleOutcome::NoEquity);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_pnl_sync_is_throttled() {
        let exchange = Arc::new(MockExchange::default());
        exchange.closed.lock().push(ClosedTrade {
            symbol: "BTCUSDT".into(),
            pnl: -12.5,
            created_time_ms: Utc::now().timestamp_millis(),
            order_id: Some("ord-1".into()),
        });
        let h = harness_with(SafetyConfig::default(), Arc::new(ScriptedSignals::idle()), exchange)
            .await;

        h.pipeline.initialize().await;
        h.pipeline.run_cycle().await;
        // Second cycle lands inside the 5-minute window: no second query.
        h.exchange.candles.lock().push(Candle {
            start_ms: 1_800_000_000_000,
            open: 100.0,
            high: 100.0,
            low: 100.0,
            close: 100.0,
            volume: 1.0,
            confirmed: true,
        });
        h.pipeline.run_cycle().await;

        assert_eq!(h.exchange.closed_pnl_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.pipeline.risk_state.consecutive_losses(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_pipeline_returns_silently() {
        let h = harness(SafetyConfig::default(), Arc::new(ScriptedSignals::entering(100.0))).await;
        h.pipeline.set_enabled(false);
        assert_eq!(h.pipeline.run_cycle().await, CycleOutcome::Disabled);
        assert_eq!(h.alerts.emitted.lock().len(), 0);
    }
}
