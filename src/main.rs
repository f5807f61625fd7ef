// =============================================================================
// Polaris Perp Nexus — Main Entry Point
// =============================================================================
//
// Wires the bus, the paper broker, the market feed (or replay source), and
// one risk-gated pipeline per symbol. Live mode must be armed explicitly by
// typing a confirmation string; everything else runs against simulated
// execution.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod alerts;
mod broker;
mod bus;
mod config;
mod exchange;
mod execution;
mod feed;
mod market_data;
mod metrics;
mod pipeline;
mod rate_limit;
mod replay;
mod risk_state;
mod signals;
mod types;

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::alerts::{AlertSink, LogAlertSink};
use crate::broker::PaperBroker;
use crate::bus::{LocalBus, MessageBus, NatsBus, Subjects};
use crate::config::AppConfig;
use crate::exchange::bybit::BybitClient;
use crate::exchange::ExchangeClient;
use crate::execution::ExecutionGateway;
use crate::pipeline::TradePipeline;
use crate::replay::ReplaySource;
use crate::risk_state::RiskStateStore;
use crate::signals::{EmaCrossSignals, Signals};
use crate::types::Mode;

/// Confirmation string required to arm live trading.
const LIVE_CONFIRMATION: &str = "CONFIRM-LIVE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LaunchMode {
    /// Simulated execution, venue testnet for account/market data.
    Paper,
    /// Same as paper; spelled out for operators coming from the venue UI.
    Testnet,
    /// Real orders against the venue. Requires interactive confirmation.
    Live,
}

#[derive(Debug, Parser)]
#[command(name = "polaris-bot", about = "Perpetual-futures trading engine")]
struct Args {
    /// Execution mode.
    #[arg(long, value_enum, default_value = "paper")]
    mode: LaunchMode,

    /// Path to the JSON config file.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Polaris Perp Nexus — Starting Up                 ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let args = Args::parse();
    // A missing file gets defaults written out for the operator to edit; a
    // present-but-malformed file is fatal before any order is possible.
    let config = if args.config.exists() {
        AppConfig::load(&args.config)
            .with_context(|| format!("fatal: config {} unusable", args.config.display()))?
    } else {
        warn!(path = %args.config.display(), "config not found — writing defaults");
        let cfg = AppConfig::default();
        if let Err(e) = cfg.save(&args.config) {
            warn!(error = %e, "could not write default config");
        }
        cfg
    };

    // APP_MODE wins over the CLI flag when both are present.
    let mode: Mode = match std::env::var("APP_MODE") {
        Ok(v) => v.parse()?,
        Err(_) => match args.mode {
            LaunchMode::Paper | LaunchMode::Testnet => Mode::Paper,
            LaunchMode::Live => Mode::Live,
        },
    };

    if mode == Mode::Live {
        confirm_live_interactively()?;
    }

    let run_id = std::env::var("RUN_ID")
        .unwrap_or_else(|_| format!("{mode}-{}", chrono::Utc::now().timestamp()));

    info!(mode = %mode, run_id = %run_id, symbols = ?config.symbols, "engine configuration resolved");

    // ── 2. Metrics ───────────────────────────────────────────────────────
    let metrics_addr = std::env::var("METRICS_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:9100".to_string())
        .parse()
        .context("METRICS_ADDR is not a valid socket address")?;
    metrics::install(metrics_addr, mode)?;

    // ── 3. Message bus ───────────────────────────────────────────────────
    let subjects = Subjects::from_env();
    let bus: Arc<dyn MessageBus> = match std::env::var("NATS_URL") {
        Ok(url) => Arc::new(NatsBus::connect(&url).await?),
        Err(_) => {
            info!("NATS_URL not set — using in-process bus (single-process session)");
            Arc::new(LocalBus::new())
        }
    };

    // ── 4. Paper broker ──────────────────────────────────────────────────
    let broker = PaperBroker::new(
        config.paper.clone(),
        mode,
        run_id.clone(),
        bus.clone(),
        subjects.executions.clone(),
    );
    broker.start(&subjects).await?;

    // ── 5. Exchange client ───────────────────────────────────────────────
    let api_key = std::env::var("BYBIT_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BYBIT_API_SECRET").unwrap_or_default();
    let have_credentials = !api_key.is_empty() && !api_secret.is_empty();
    let testnet = mode != Mode::Live;
    let exchange: Arc<dyn ExchangeClient> =
        Arc::new(BybitClient::new(api_key, api_secret, testnet));

    if !have_credentials {
        warn!("no venue credentials — pipelines disabled, broker and feed still run");
    }

    let alerts: Arc<dyn AlertSink> = Arc::new(LogAlertSink);
    let signals: Arc<dyn Signals> = Arc::new(EmaCrossSignals::default());

    // ── 6. Market data: replay file or live feed ─────────────────────────
    if mode == Mode::Replay {
        let replay_cfg = config
            .replay
            .as_ref()
            .context("replay mode requires a [replay] config section")?;
        let source = ReplaySource::from_config(
            replay_cfg,
            bus.clone(),
            subjects.market_data.clone(),
            subjects.replay_control.clone(),
        )?;
        if source.is_empty() {
            warn!("replay window matched no snapshots — nothing will be published");
        }
        info!(rows = source.len(), "replay source ready");
        tokio::spawn(async move {
            if let Err(e) = source.run().await {
                error!(error = %e, "replay source failed");
            }
        });
    } else {
        let ws_url = if testnet {
            feed::TESTNET_WS_URL
        } else {
            feed::MAINNET_WS_URL
        };
        for symbol in &config.symbols {
            let sym = symbol.clone();
            let feed_bus = bus.clone();
            let market_subject = subjects.market_data.clone();
            tokio::spawn(async move {
                loop {
                    if let Err(e) =
                        feed::run_feed(ws_url, &sym, feed_bus.clone(), &market_subject).await
                    {
                        error!(symbol = %sym, error = %e, "market feed error — reconnecting in 5s");
                    }
                    tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
                }
            });
        }
        info!(count = config.symbols.len(), "market feeds launched");
    }

    // ── 7. Risk-gated pipelines (one per symbol) ─────────────────────────
    // Symbols may share a state file; each distinct path gets one store.
    let mut stores: HashMap<String, Arc<RiskStateStore>> = HashMap::new();
    let mut pipelines = Vec::new();

    for symbol in &config.symbols {
        let safety = config.safety_for(symbol);
        let store = stores
            .entry(safety.state_file.clone())
            .or_insert_with(|| {
                let (store, _status) = RiskStateStore::open(&safety.state_file, alerts.clone());
                Arc::new(store)
            })
            .clone();

        let gateway = ExecutionGateway::new(
            mode,
            format!("pipeline-{symbol}"),
            bus.clone(),
            subjects.orders.clone(),
            exchange.clone(),
        );

        let pipeline = Arc::new(TradePipeline::new(
            symbol.clone(),
            config.interval.clone(),
            mode,
            safety,
            exchange.clone(),
            gateway,
            signals.clone(),
            store,
            alerts.clone(),
            bus.clone(),
            subjects.risk_state.clone(),
        ));

        if have_credentials {
            pipeline.initialize().await;
        } else {
            pipeline.set_enabled(false);
        }

        pipelines.push(pipeline.clone());
        tokio::spawn(pipeline.run());
    }

    info!(count = pipelines.len(), "pipelines running — press Ctrl+C to stop");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    // Give already-scheduled fill slices a moment to land and publish.
    tokio::time::sleep(tokio::time::Duration::from_millis(250)).await;

    for store in stores.values() {
        if let Err(e) = store.persist() {
            error!(error = %e, "risk state flush failed on shutdown");
        }
    }

    for symbol in &config.symbols {
        let size = broker.position_size(symbol).await;
        if size != 0.0 {
            info!(symbol = %symbol, size, "simulated position still open at shutdown");
        }
    }

    info!(maker_ratio = broker.maker_ratio(), "Polaris shut down complete");
    Ok(())
}

/// Live trading must be armed by typing the confirmation string.
fn confirm_live_interactively() -> anyhow::Result<()> {
    print!("Live trading uses REAL funds. Type {LIVE_CONFIRMATION} to continue: ");
    std::io::stdout().flush().ok();

    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .context("failed to read confirmation")?;
    if line.trim() != LIVE_CONFIRMATION {
        anyhow::bail!("live confirmation mismatch — refusing to start");
    }
    warn!("live trading ARMED");
    Ok(())
}
