// =============================================================================
// Paper Broker — microstructure-aware execution simulator
// =============================================================================
//
// Consumes order intents and market snapshots, owns the market book and the
// position map, and publishes one execution report per fill slice.
//
// Life-cycle of one intent:
//
//   RECEIVED -> (validate) -> REJECTED            -> publish rejection, end
//                          -> ROUTED(maker|taker) -> SCHEDULED(slices)
//                             each slice: WAIT -> LOCK -> APPLY -> PUBLISH
//
// Pricing, routing, and every random draw happen at acknowledgement time
// under the books lock, so a fixed seed and input sequence replays an
// identical report stream. Slice completions run as independent delayed
// tasks; the only serialization point is the books lock, held across the
// complete bookkeeping of a single slice — including report publication, so
// downstream consumers observe position-consistent ordering per symbol.
// =============================================================================

pub mod fill_plan;
pub mod latency;
pub mod position;
pub mod slippage;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::bus::{MessageBus, Subjects};
use crate::config::PaperBrokerConfig;
use crate::market_data::MarketBook;
use crate::metrics;
use crate::types::{ExecutionReport, MarketSnapshot, Mode, OrderIntent, OrderType};

use latency::LatencyModel;
use position::PositionBook;

/// Broker-owned mutable state: the market book and the position map, guarded
/// together so a slice's bookkeeping is one atomic step.
#[derive(Default)]
pub struct Books {
    pub market: MarketBook,
    pub positions: PositionBook,
}

/// Idempotency record for a consumed intent id.
enum SeenOutcome {
    /// Slices scheduled, first report not yet published.
    Pending,
    /// First published report, replayed verbatim on a duplicate.
    Executed(Box<ExecutionReport>),
    /// Original was rejected; duplicates are dropped silently.
    Rejected,
}

struct SeenEntry {
    outcome: SeenOutcome,
    at: Instant,
}

/// One scheduled fill slice, fully priced at acknowledgement.
struct SliceJob {
    intent: OrderIntent,
    qty: f64,
    price: f64,
    maker: bool,
    slippage_bps: f64,
    ack_ms: f64,
    fill_ms: f64,
    /// Funding rate and mark captured at ack, used if the symbol's snapshot
    /// disappears before the slice lands.
    funding_rate_at_ack: f64,
    mark_at_ack: f64,
}

pub struct PaperBroker {
    cfg: PaperBrokerConfig,
    mode: Mode,
    run_id: String,
    bus: Arc<dyn MessageBus>,
    exec_subject: String,
    latency: LatencyModel,
    books: AsyncMutex<Books>,
    rng: parking_lot::Mutex<ChaCha8Rng>,
    seen: parking_lot::Mutex<HashMap<String, SeenEntry>>,
    maker_fills: AtomicU64,
    total_fills: AtomicU64,
}

impl PaperBroker {
    pub fn new(
        cfg: PaperBrokerConfig,
        mode: Mode,
        run_id: impl Into<String>,
        bus: Arc<dyn MessageBus>,
        exec_subject: impl Into<String>,
    ) -> Arc<Self> {
        let latency = LatencyModel::from_config(&cfg);
        let rng = ChaCha8Rng::seed_from_u64(cfg.seed);
        Arc::new(Self {
            cfg,
            mode,
            run_id: run_id.into(),
            bus,
            exec_subject: exec_subject.into(),
            latency,
            books: AsyncMutex::new(Books::default()),
            rng: parking_lot::Mutex::new(rng),
            seen: parking_lot::Mutex::new(HashMap::new()),
            maker_fills: AtomicU64::new(0),
            total_fills: AtomicU64::new(0),
        })
    }

    /// Subscribe to market data and order intents; one dispatcher task per
    /// subscription.
    pub async fn start(self: &Arc<Self>, subjects: &Subjects) -> Result<()> {
        let mut market_rx = self.bus.subscribe(&subjects.market_data).await?;
        let broker = self.clone();
        tokio::spawn(async move {
            while let Some(payload) = market_rx.recv().await {
                match serde_json::from_slice::<MarketSnapshot>(&payload) {
                    Ok(snap) => broker.on_snapshot(snap).await,
                    Err(e) => warn!(error = %e, "dropping malformed market snapshot"),
                }
            }
            warn!("market data subscription ended");
        });

        let mut orders_rx = self.bus.subscribe(&subjects.orders).await?;
        let broker = self.clone();
        tokio::spawn(async move {
            while let Some(payload) = orders_rx.recv().await {
                match serde_json::from_slice::<OrderIntent>(&payload) {
                    Ok(intent) => broker.submit_intent(intent).await,
                    // Unknown side / unsupported type parse as errors here.
                    Err(e) => warn!(error = %e, "dropping malformed order intent"),
                }
            }
            warn!("order intent subscription ended");
        });

        info!(mode = %self.mode, run_id = %self.run_id, "paper broker started");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Market data
    // -------------------------------------------------------------------------

    /// Fold a snapshot into the book and refresh the mark of any held
    /// position on that symbol.
    pub async fn on_snapshot(&self, snapshot: MarketSnapshot) {
        let mut books = self.books.lock().await;
        let symbol = snapshot.symbol.clone();
        let mark = snapshot.mid();
        books.market.apply(snapshot);
        if mark > 0.0 {
            books.positions.refresh_mark(&symbol, mark);
        }
    }

    // -------------------------------------------------------------------------
    // Intent intake
    // -------------------------------------------------------------------------

    /// Entry point for one order intent. Never panics and never errors out:
    /// every failure path resolves to a log, a rejection report, or both.
    pub async fn submit_intent(self: &Arc<Self>, intent: OrderIntent) {
        // Idempotency: an id seen inside the window answers with a replay of
        // the prior report (or silence if it was rejected / still pending).
        if let Some(previous) = self.check_seen(&intent.id) {
            match previous {
                Some(report) => {
                    debug!(intent_id = %intent.id, "duplicate intent — replaying first report");
                    self.publish_report(&report).await;
                }
                None => {
                    debug!(intent_id = %intent.id, "duplicate intent — dropping");
                }
            }
            return;
        }

        if let Err(reason) = intent.validate() {
            warn!(intent_id = %intent.id, reason = %reason, "order intent rejected");
            metrics::record_reject(self.mode);
            self.mark_seen(&intent.id, SeenOutcome::Rejected);
            // A rejection report is only owed to intents that carry a client id.
            if !intent.client_id.is_empty() {
                let report = self.rejection_report(&intent, &reason);
                self.publish_report(&report).await;
            }
            return;
        }

        if self.mode == Mode::Live {
            warn!(intent_id = %intent.id, "live execution not configured — rejecting");
            metrics::record_reject(self.mode);
            self.mark_seen(&intent.id, SeenOutcome::Rejected);
            let report = self.rejection_report(&intent, "live execution not configured");
            self.publish_report(&report).await;
            return;
        }

        // Price against the book as of acknowledgement.
        let (snapshot, ofi) = {
            let books = self.books.lock().await;
            match books.market.get(&intent.symbol) {
                Some(state) => (state.snapshot.clone(), state.ofi),
                None => {
                    warn!(
                        intent_id = %intent.id,
                        symbol = %intent.symbol,
                        "no market snapshot for symbol — dropping intent"
                    );
                    return;
                }
            }
        };
        let jobs = self.schedule_slices(&intent, &snapshot, ofi);

        self.mark_seen(&intent.id, SeenOutcome::Pending);

        for job in jobs {
            let broker = self.clone();
            let delay = Duration::from_secs_f64((job.ack_ms + job.fill_ms) / 1_000.0);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                broker.complete_slice(job).await;
            });
        }
    }

    /// Route the intent, price it against the book at acknowledgement, and
    /// draw every random quantity the slices will need.
    fn schedule_slices(
        &self,
        intent: &OrderIntent,
        snapshot: &MarketSnapshot,
        ofi: f64,
    ) -> Vec<SliceJob> {
        let mut rng = self.rng.lock();

        let ack_ms = self.latency.sample_ms(&mut *rng);

        let (maker, price, slip, slice_qtys) = match intent.order_type {
            OrderType::Market | OrderType::StopMarket => {
                let slip = slippage::slippage_bps(&self.cfg, intent.side, snapshot.spread_bps(), ofi);
                let price = slippage::taker_fill_price(intent.side, snapshot, slip);
                (false, price, slip, fill_plan::plan_taker(intent.quantity))
            }
            OrderType::Limit => {
                // validate() guarantees the price is present.
                let limit = intent.price.unwrap_or(snapshot.mid());
                if slippage::limit_crosses(intent.side, limit, snapshot) {
                    let slip =
                        slippage::slippage_bps(&self.cfg, intent.side, snapshot.spread_bps(), ofi);
                    let price = slippage::taker_fill_price(intent.side, snapshot, slip);
                    (false, price, slip, fill_plan::plan_taker(intent.quantity))
                } else {
                    let qtys = fill_plan::plan_maker_slices(intent.quantity, &self.cfg, &mut *rng);
                    (true, limit, 0.0, qtys)
                }
            }
        };

        debug!(
            intent_id = %intent.id,
            maker,
            price,
            slippage_bps = slip,
            slices = slice_qtys.len(),
            ack_ms,
            "intent routed"
        );

        slice_qtys
            .into_iter()
            .enumerate()
            .map(|(i, qty)| SliceJob {
                intent: intent.clone(),
                qty,
                price,
                maker,
                slippage_bps: slip,
                ack_ms,
                fill_ms: self.latency.slice_delay_ms(&mut *rng, i),
                funding_rate_at_ack: snapshot.funding_rate,
                mark_at_ack: snapshot.mid(),
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // Slice completion
    // -------------------------------------------------------------------------

    /// Apply one slice: position math, fees, funding, metrics, publication —
    /// all inside the books lock.
    async fn complete_slice(&self, job: SliceJob) {
        let mut books = self.books.lock().await;

        let (funding_rate, mark) = books
            .market
            .get(&job.intent.symbol)
            .map(|s| (s.snapshot.funding_rate, s.snapshot.mid()))
            .unwrap_or((job.funding_rate_at_ack, job.mark_at_ack));

        let signed_qty = job.qty * job.intent.side.sign();
        let gross_realized = books
            .positions
            .apply_fill(&job.intent.symbol, signed_qty, job.price);
        books.positions.refresh_mark(&job.intent.symbol, mark);

        let rate_bps = if job.maker {
            self.cfg.maker_rebate_bps
        } else {
            self.cfg.fee_bps
        };
        let fees = job.price * job.qty * rate_bps / 10_000.0;
        let funding = if self.cfg.funding_enabled {
            job.price * job.qty * funding_rate
        } else {
            0.0
        };
        let realized_pnl = gross_realized - fees - funding;

        let report = ExecutionReport {
            intent_id: job.intent.id.clone(),
            symbol: job.intent.symbol.clone(),
            executed: true,
            price: job.price,
            mark_price: mark,
            quantity: job.qty,
            fees,
            funding,
            realized_pnl,
            slippage_bps: job.slippage_bps,
            maker: job.maker,
            ack_latency_ms: job.ack_ms,
            fill_latency_ms: job.fill_ms,
            mode: self.mode,
            run_id: self.run_id.clone(),
            timestamp: Utc::now(),
            is_shadow: job.intent.is_shadow,
            error: None,
            order_type: job.intent.order_type,
            reduce_only: job.intent.reduce_only,
            stop_price: job.intent.stop_price,
            initial_price: job.intent.price,
        };

        let total = self.total_fills.fetch_add(1, Ordering::Relaxed) + 1;
        let makers = if job.maker {
            self.maker_fills.fetch_add(1, Ordering::Relaxed) + 1
        } else {
            self.maker_fills.load(Ordering::Relaxed)
        };
        metrics::record_report(&report, makers as f64 / total as f64);

        self.remember_first_report(&report);

        // Publication stays inside the lock: consumers see reports in the
        // same order the position mutated.
        self.publish_report(&report).await;
    }

    // -------------------------------------------------------------------------
    // Idempotency window
    // -------------------------------------------------------------------------

    /// Outer None: unseen. Inner Option: the report to replay, if any.
    #[allow(clippy::option_option)]
    fn check_seen(&self, intent_id: &str) -> Option<Option<ExecutionReport>> {
        let window = Duration::from_secs(self.cfg.dedup_window_secs);
        let mut seen = self.seen.lock();
        seen.retain(|_, entry| entry.at.elapsed() < window);
        seen.get(intent_id).map(|entry| match &entry.outcome {
            SeenOutcome::Executed(report) => Some(*report.clone()),
            SeenOutcome::Pending | SeenOutcome::Rejected => None,
        })
    }

    fn mark_seen(&self, intent_id: &str, outcome: SeenOutcome) {
        self.seen.lock().insert(
            intent_id.to_string(),
            SeenEntry {
                outcome,
                at: Instant::now(),
            },
        );
    }

    /// Keep the first published report so a duplicate intent can be answered
    /// idempotently.
    fn remember_first_report(&self, report: &ExecutionReport) {
        let mut seen = self.seen.lock();
        if let Some(entry) = seen.get_mut(&report.intent_id) {
            if matches!(entry.outcome, SeenOutcome::Pending) {
                entry.outcome = SeenOutcome::Executed(Box::new(report.clone()));
            }
        }
    }

    // -------------------------------------------------------------------------
    // Reports
    // -------------------------------------------------------------------------

    fn rejection_report(&self, intent: &OrderIntent, error: &str) -> ExecutionReport {
        ExecutionReport {
            intent_id: intent.id.clone(),
            symbol: intent.symbol.clone(),
            executed: false,
            price: 0.0,
            mark_price: 0.0,
            quantity: intent.quantity,
            fees: 0.0,
            funding: 0.0,
            realized_pnl: 0.0,
            slippage_bps: 0.0,
            maker: false,
            ack_latency_ms: 0.0,
            fill_latency_ms: 0.0,
            mode: self.mode,
            run_id: self.run_id.clone(),
            timestamp: Utc::now(),
            is_shadow: intent.is_shadow,
            error: Some(error.to_string()),
            order_type: intent.order_type,
            reduce_only: intent.reduce_only,
            stop_price: intent.stop_price,
            initial_price: intent.price,
        }
    }

    async fn publish_report(&self, report: &ExecutionReport) {
        let payload = match serde_json::to_vec(report) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to serialise execution report");
                return;
            }
        };
        if let Err(e) = self.bus.publish(&self.exec_subject, payload).await {
            warn!(error = %e, "failed to publish execution report");
        }
    }

    // -------------------------------------------------------------------------
    // Queries (used by tests and the launcher's shutdown log)
    // -------------------------------------------------------------------------

    /// Signed position size for `symbol`.
    pub async fn position_size(&self, symbol: &str) -> f64 {
        self.books.lock().await.positions.size(symbol)
    }

    /// Share of fills that rested as maker (0.0 before the first fill).
    pub fn maker_ratio(&self) -> f64 {
        let total = self.total_fills.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            self.maker_fills.load(Ordering::Relaxed) as f64 / total as f64
        }
    }
}

impl std::fmt::Debug for PaperBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaperBroker")
            .field("mode", &self.mode)
            .field("run_id", &self.run_id)
            .field("total_fills", &self.total_fills.load(Ordering::Relaxed))
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use crate::types::OrderSide;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    const EXEC: &str = "trading.executions";

    fn fast_cfg() -> PaperBrokerConfig {
        let mut cfg = PaperBrokerConfig::default();
        cfg.latency_mean_ms = 1.0;
        cfg.latency_p95_ms = 2.0;
        cfg.seed = 42;
        cfg
    }

    async fn setup(cfg: PaperBrokerConfig, mode: Mode) -> (Arc<PaperBroker>, mpsc::Receiver<Vec<u8>>) {
        let bus = Arc::new(LocalBus::new());
        let rx = bus.subscribe(EXEC).await.unwrap();
        let broker = PaperBroker::new(cfg, mode, "test-run", bus, EXEC);
        (broker, rx)
    }

    fn snapshot(bid: f64, ask: f64) -> MarketSnapshot {
        MarketSnapshot {
            symbol: "BTCUSDT".into(),
            best_bid: bid,
            best_ask: ask,
            bid_size: 5.0,
            ask_size: 5.0,
            last_price: (bid + ask) / 2.0,
            last_side: OrderSide::Buy,
            last_size: 0.0, // keep OFI neutral unless a test wants pressure
            funding_rate: 0.0001,
            timestamp: Utc::now(),
            order_flow_imbalance: 0.0,
        }
    }

    fn market_buy(id: &str, qty: f64) -> OrderIntent {
        OrderIntent {
            id: id.into(),
            client_id: "pipeline".into(),
            symbol: "BTCUSDT".into(),
            order_type: OrderType::Market,
            side: OrderSide::Buy,
            price: None,
            stop_price: None,
            quantity: qty,
            reduce_only: false,
            timestamp: Utc::now(),
            is_shadow: false,
        }
    }

    fn limit(id: &str, side: OrderSide, price: f64, qty: f64) -> OrderIntent {
        let mut i = market_buy(id, qty);
        i.side = side;
        i.order_type = OrderType::Limit;
        i.price = Some(price);
        i
    }

    async fn collect(rx: &mut mpsc::Receiver<Vec<u8>>, n: usize) -> Vec<ExecutionReport> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            let payload = timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for report")
                .expect("bus closed");
            out.push(serde_json::from_slice(&payload).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn market_order_without_snapshot_is_dropped() {
        let (broker, mut rx) = setup(fast_cfg(), Mode::Paper).await;
        broker.submit_intent(market_buy("i-1", 1.0)).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(broker.position_size("BTCUSDT").await, 0.0);
    }

    #[tokio::test]
    async fn market_buy_fills_against_ask_with_bounded_slippage() {
        let (broker, mut rx) = setup(fast_cfg(), Mode::Paper).await;
        broker.on_snapshot(snapshot(99.95, 100.05)).await;
        broker.submit_intent(market_buy("i-1", 2.0)).await;

        let reports = collect(&mut rx, 1).await;
        let r = &reports[0];
        assert!(r.executed);
        assert!(!r.maker);
        assert!((r.quantity - 2.0).abs() < 1e-12);
        assert!(r.slippage_bps >= 0.0 && r.slippage_bps <= broker.cfg.max_slippage_bps);
        let expected = 100.05 * (1.0 + r.slippage_bps / 10_000.0);
        assert!((r.price - expected).abs() < 1e-9);
        assert!((broker.position_size("BTCUSDT").await - 2.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn non_crossing_limit_rests_as_maker_slices() {
        let mut cfg = fast_cfg();
        cfg.partial_fill_enabled = true;
        cfg.partial_fill_min_slice_pct = 0.15;
        cfg.partial_fill_max_slices = 4;
        let (broker, mut rx) = setup(cfg, Mode::Paper).await;
        broker.on_snapshot(snapshot(99.50, 99.60)).await;
        broker
            .submit_intent(limit("i-1", OrderSide::Buy, 99.00, 10.0))
            .await;

        // Drain until the full quantity is accounted for.
        let mut reports: Vec<ExecutionReport> = Vec::new();
        let mut total = 0.0;
        while total < 10.0 - 1e-9 {
            let r = collect(&mut rx, 1).await.remove(0);
            total += r.quantity;
            reports.push(r);
        }

        assert!((1..=4).contains(&reports.len()));
        assert!((total - 10.0).abs() < 1e-9);
        for r in &reports {
            assert!(r.maker);
            assert_eq!(r.slippage_bps, 0.0);
            assert!((r.price - 99.00).abs() < 1e-12);
            assert!(r.quantity >= 1.5 - 1e-9);
        }
        assert!((broker.position_size("BTCUSDT").await - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn crossing_limit_takes_with_slippage() {
        let (broker, mut rx) = setup(fast_cfg(), Mode::Paper).await;
        broker.on_snapshot(snapshot(99.50, 99.60)).await;
        broker
            .submit_intent(limit("i-1", OrderSide::Buy, 99.80, 1.0))
            .await;

        let r = collect(&mut rx, 1).await.remove(0);
        assert!(!r.maker);
        assert!(r.price >= 99.60);
    }

    #[tokio::test]
    async fn live_mode_rejects_with_error_report() {
        let (broker, mut rx) = setup(fast_cfg(), Mode::Live).await;
        broker.on_snapshot(snapshot(99.95, 100.05)).await;
        broker.submit_intent(market_buy("i-1", 1.0)).await;

        let r = collect(&mut rx, 1).await.remove(0);
        assert!(!r.executed);
        assert_eq!(r.error.as_deref(), Some("live execution not configured"));
        assert_eq!(broker.position_size("BTCUSDT").await, 0.0);
    }

    #[tokio::test]
    async fn invalid_intent_rejected_once() {
        let (broker, mut rx) = setup(fast_cfg(), Mode::Paper).await;
        broker.on_snapshot(snapshot(99.95, 100.05)).await;
        broker.submit_intent(market_buy("i-1", 0.0)).await;

        let r = collect(&mut rx, 1).await.remove(0);
        assert!(!r.executed);
        assert!(r.error.is_some());

        // Duplicate of a rejected intent: silence.
        broker.submit_intent(market_buy("i-1", 0.0)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_intent_replays_without_new_position_mutation() {
        let (broker, mut rx) = setup(fast_cfg(), Mode::Paper).await;
        broker.on_snapshot(snapshot(99.95, 100.05)).await;
        broker.submit_intent(market_buy("i-1", 2.0)).await;
        let first = collect(&mut rx, 1).await.remove(0);
        assert!((broker.position_size("BTCUSDT").await - 2.0).abs() < 1e-12);

        broker.submit_intent(market_buy("i-1", 2.0)).await;
        let replay = collect(&mut rx, 1).await.remove(0);
        assert_eq!(replay.price, first.price);
        assert_eq!(replay.timestamp, first.timestamp);
        // Position unchanged by the duplicate.
        assert!((broker.position_size("BTCUSDT").await - 2.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn maker_rebate_flips_fee_sign() {
        let mut cfg = fast_cfg();
        cfg.partial_fill_enabled = false;
        cfg.maker_rebate_bps = -1.0;
        let (broker, mut rx) = setup(cfg, Mode::Paper).await;
        broker.on_snapshot(snapshot(99.50, 99.60)).await;
        broker
            .submit_intent(limit("i-1", OrderSide::Buy, 99.00, 10.0))
            .await;

        let r = collect(&mut rx, 1).await.remove(0);
        assert!(r.maker);
        // Rebate: negative fee = credit, so the net realized gains it back.
        assert!(r.fees < 0.0);
        assert!((r.fees - 99.00 * 10.0 * (-1.0) / 10_000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn position_flips_through_zero_across_intents() {
        let (broker, mut rx) = setup(fast_cfg(), Mode::Paper).await;
        broker.on_snapshot(snapshot(99.95, 100.05)).await;

        broker.submit_intent(market_buy("i-1", 2.0)).await;
        collect(&mut rx, 1).await;

        let mut sell = market_buy("i-2", 5.0);
        sell.side = OrderSide::Sell;
        broker.submit_intent(sell).await;
        collect(&mut rx, 1).await;

        assert!((broker.position_size("BTCUSDT").await + 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn adverse_ofi_raises_buy_slippage() {
        let mut cfg = fast_cfg();
        cfg.ofi_slippage_coeff = 0.5;
        let (broker, mut rx) = setup(cfg, Mode::Paper).await;

        // Heavy sell-side prints drive OFI negative — adverse for buys.
        let mut s = snapshot(99.95, 100.05);
        s.last_side = OrderSide::Sell;
        s.last_size = 8.0;
        broker.on_snapshot(s).await;

        broker.submit_intent(market_buy("i-1", 1.0)).await;
        let r = collect(&mut rx, 1).await.remove(0);
        // base 1.0 + spread term + 0.5 * 8 pressure, clamped at the cap.
        assert!(r.slippage_bps > broker.cfg.slippage_bps);
        assert!(r.slippage_bps <= broker.cfg.max_slippage_bps);
    }

    #[tokio::test]
    async fn same_seed_replays_identical_report_sequence() {
        async fn run_once() -> Vec<(f64, f64, f64, f64, bool)> {
            let mut cfg = fast_cfg();
            cfg.partial_fill_enabled = true;
            cfg.partial_fill_max_slices = 4;
            let (broker, mut rx) = setup(cfg, Mode::Paper).await;
            broker.on_snapshot(snapshot(99.50, 99.60)).await;
            broker
                .submit_intent(limit("i-1", OrderSide::Buy, 99.00, 10.0))
                .await;

            let mut out = Vec::new();
            let mut total = 0.0;
            while total < 10.0 - 1e-9 {
                let r = collect(&mut rx, 1).await.remove(0);
                total += r.quantity;
                out.push((r.quantity, r.price, r.ack_latency_ms, r.fill_latency_ms, r.maker));
            }
            out.sort_by(|a, b| a.3.partial_cmp(&b.3).unwrap());
            out
        }

        let a = run_once().await;
        let b = run_once().await;
        assert_eq!(a, b);
    }
}
