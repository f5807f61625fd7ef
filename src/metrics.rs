// =============================================================================
// Metrics Surface — Prometheus exporter + recording helpers
// =============================================================================
//
// All series are emitted through the `metrics` facade; the Prometheus
// exporter owns the HTTP listener (METRICS_ADDR). Slippage gets explicit
// buckets so the histogram is readable at sub-bp resolution.
// =============================================================================

use std::net::SocketAddr;

use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram, gauge, histogram, increment_counter};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use tracing::info;

use crate::types::{ExecutionReport, Mode};

/// Bucket edges for `paper_slippage_bps`.
const SLIPPAGE_BUCKETS: &[f64] = &[0.0, 1.0, 2.5, 5.0, 7.5, 10.0, 15.0, 20.0];

/// Install the Prometheus recorder and HTTP listener, register descriptions,
/// and pin the `trading_mode` gauge for the active mode.
///
/// Must be called once, inside the tokio runtime, before any series is
/// recorded.
pub fn install(addr: SocketAddr, mode: Mode) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            Matcher::Full("paper_slippage_bps".to_string()),
            SLIPPAGE_BUCKETS,
        )
        .context("invalid slippage buckets")?
        .install()
        .context("failed to install Prometheus exporter")?;

    describe_gauge!("trading_mode", "1 for the active execution mode label");
    describe_histogram!(
        "signal_ack_latency_seconds",
        "Intent receive to acknowledgement"
    );
    describe_histogram!("paper_fill_latency_seconds", "Acknowledgement to fill");
    describe_histogram!("paper_slippage_bps", "Modeled slippage vs mid at ack");
    describe_gauge!("paper_maker_ratio", "Share of fills that rested as maker");
    describe_counter!("paper_order_rejects_total", "Rejected order intents");
    describe_gauge!(
        "market_spread_atr_percent",
        "Top-of-book spread as a percentage of ATR"
    );

    // One-hot mode gauge: the active label reads 1, the others 0.
    for m in [Mode::Live, Mode::Paper, Mode::Replay] {
        gauge!("trading_mode", if m == mode { 1.0 } else { 0.0 }, "mode" => m.to_string());
    }

    info!(addr = %addr, mode = %mode, "metrics exporter listening");
    Ok(())
}

/// Record the per-report series: slippage, latencies, maker ratio.
///
/// `maker_ratio` is the broker's running share of maker fills, recomputed by
/// the caller after folding this report in.
pub fn record_report(report: &ExecutionReport, maker_ratio: f64) {
    let mode = report.mode.to_string();
    histogram!(
        "paper_slippage_bps",
        report.slippage_bps,
        "mode" => mode.clone(),
        "run_id" => report.run_id.clone()
    );
    histogram!(
        "signal_ack_latency_seconds",
        report.ack_latency_ms / 1_000.0,
        "mode" => mode.clone(),
        "run_id" => report.run_id.clone()
    );
    histogram!(
        "paper_fill_latency_seconds",
        report.fill_latency_ms / 1_000.0,
        "mode" => mode.clone(),
        "run_id" => report.run_id.clone()
    );
    gauge!("paper_maker_ratio", maker_ratio, "mode" => mode);
}

/// Count a rejected intent.
pub fn record_reject(mode: Mode) {
    increment_counter!("paper_order_rejects_total", "mode" => mode.to_string());
}

/// Feed-side gauge: spread as a percentage of ATR for `symbol`.
pub fn set_spread_atr_percent(symbol: &str, value: f64) {
    gauge!("market_spread_atr_percent", value, "symbol" => symbol.to_string());
}
