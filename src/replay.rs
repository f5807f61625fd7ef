// =============================================================================
// Replay Source — paced historical snapshot publisher with remote control
// =============================================================================
//
// Reads an ordered CSV of market snapshots, normalizes timestamps to UTC,
// applies an inclusive [start, end] window and timestamp deduplication, then
// publishes to the market-data subject at a configurable speed-up over
// recorded time. A control subject accepts pause / resume / seek while the
// publisher runs. Output is deterministic for a fixed input file and window:
// the same rows go out in the same order every run.
// =============================================================================

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bus::MessageBus;
use crate::config::ReplayConfig;
use crate::types::{MarketSnapshot, OrderSide, ReplayCommand, ReplayCommandKind};

// ---------------------------------------------------------------------------
// CSV loading
// ---------------------------------------------------------------------------

/// One CSV row. `timestamp` accepts any RFC3339 offset and is normalized to
/// UTC; `last_side` accepts "buy"/"sell" in any case.
#[derive(Debug, Deserialize)]
struct ReplayRow {
    timestamp: String,
    symbol: String,
    #[serde(default)]
    best_bid: f64,
    #[serde(default)]
    best_ask: f64,
    #[serde(default)]
    bid_size: f64,
    #[serde(default)]
    ask_size: f64,
    #[serde(default)]
    last_price: f64,
    last_side: String,
    #[serde(default)]
    last_size: f64,
    #[serde(default)]
    funding_rate: f64,
}

impl ReplayRow {
    fn into_snapshot(self) -> Result<MarketSnapshot> {
        let timestamp = DateTime::parse_from_rfc3339(&self.timestamp)
            .with_context(|| format!("bad timestamp '{}'", self.timestamp))?
            .with_timezone(&Utc);
        let last_side = match self.last_side.to_lowercase().as_str() {
            "buy" => OrderSide::Buy,
            "sell" => OrderSide::Sell,
            other => anyhow::bail!("bad last_side '{other}'"),
        };
        Ok(MarketSnapshot {
            symbol: self.symbol,
            best_bid: self.best_bid,
            best_ask: self.best_ask,
            bid_size: self.bid_size,
            ask_size: self.ask_size,
            last_price: self.last_price,
            last_side,
            last_size: self.last_size,
            funding_rate: self.funding_rate,
            timestamp,
            order_flow_imbalance: 0.0,
        })
    }
}

/// Load, window, order, and deduplicate the snapshot file.
pub fn load_snapshots(
    path: impl AsRef<Path>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> Result<Vec<MarketSnapshot>> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open replay file {}", path.display()))?;

    let mut rows = Vec::new();
    for (line, record) in reader.deserialize::<ReplayRow>().enumerate() {
        let row = record.with_context(|| format!("bad replay row at line {}", line + 2))?;
        let snap = row
            .into_snapshot()
            .with_context(|| format!("bad replay row at line {}", line + 2))?;

        if let Some(start) = start {
            if snap.timestamp < start {
                continue;
            }
        }
        if let Some(end) = end {
            if snap.timestamp > end {
                continue;
            }
        }
        rows.push(snap);
    }

    rows.sort_by_key(|s| s.timestamp);
    rows.dedup_by_key(|s| s.timestamp);

    info!(
        path = %path.display(),
        rows = rows.len(),
        "replay snapshots loaded"
    );
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

pub struct ReplaySource {
    rows: Vec<MarketSnapshot>,
    speed: f64,
    bus: Arc<dyn MessageBus>,
    market_subject: String,
    control_subject: String,
}

impl ReplaySource {
    /// Build a source from the replay config section.
    pub fn from_config(
        cfg: &ReplayConfig,
        bus: Arc<dyn MessageBus>,
        market_subject: impl Into<String>,
        control_subject: impl Into<String>,
    ) -> Result<Self> {
        let rows = load_snapshots(&cfg.file, cfg.start, cfg.end)?;
        Ok(Self {
            rows,
            speed: cfg.speed.max(0.001),
            bus,
            market_subject: market_subject.into(),
            control_subject: control_subject.into(),
        })
    }

    #[cfg(test)]
    fn from_rows(
        rows: Vec<MarketSnapshot>,
        speed: f64,
        bus: Arc<dyn MessageBus>,
        market_subject: &str,
        control_subject: &str,
    ) -> Self {
        Self {
            rows,
            speed,
            bus,
            market_subject: market_subject.to_string(),
            control_subject: control_subject.to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Publish every row in order, honoring recorded gaps scaled by the speed
    /// factor and control commands in between. Returns when the file is
    /// exhausted or the control subscription closes while paused.
    pub async fn run(self) -> Result<()> {
        let mut control_rx = self.bus.subscribe(&self.control_subject).await?;
        info!(
            rows = self.rows.len(),
            speed = self.speed,
            subject = %self.market_subject,
            "replay publisher starting"
        );

        let mut idx = 0usize;
        let mut paused = false;

        while idx < self.rows.len() {
            // Apply any queued commands first.
            while let Ok(payload) = control_rx.try_recv() {
                self.apply_command(&payload, &mut idx, &mut paused);
            }

            if paused {
                match control_rx.recv().await {
                    Some(payload) => {
                        self.apply_command(&payload, &mut idx, &mut paused);
                        continue;
                    }
                    None => {
                        warn!("control subscription closed while paused — stopping replay");
                        return Ok(());
                    }
                }
            }

            let snap = &self.rows[idx];
            let payload = serde_json::to_vec(snap).context("snapshot serialisation failed")?;
            self.bus.publish(&self.market_subject, payload).await?;

            // Pace to the next row, staying responsive to control.
            if let Some(next) = self.rows.get(idx + 1) {
                let gap_ms = (next.timestamp - snap.timestamp)
                    .num_milliseconds()
                    .max(0) as f64;
                let wait = Duration::from_secs_f64(gap_ms / 1_000.0 / self.speed);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    maybe = control_rx.recv() => {
                        if let Some(payload) = maybe {
                            // The command may move idx; the increment below
                            // still advances past the published row unless a
                            // seek repositioned us.
                            let before = idx;
                            self.apply_command(&payload, &mut idx, &mut paused);
                            if idx != before {
                                continue;
                            }
                        }
                    }
                }
            }
            idx += 1;
        }

        info!("replay publisher finished");
        Ok(())
    }

    fn apply_command(&self, payload: &[u8], idx: &mut usize, paused: &mut bool) {
        let cmd: ReplayCommand = match serde_json::from_slice(payload) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "dropping malformed replay command");
                return;
            }
        };
        match cmd.command {
            ReplayCommandKind::Pause => {
                info!("replay paused");
                *paused = true;
            }
            ReplayCommandKind::Resume => {
                info!("replay resumed");
                *paused = false;
            }
            ReplayCommandKind::Seek => {
                let Some(target) = cmd.timestamp else {
                    warn!("seek command without timestamp — ignored");
                    return;
                };
                // First row at or after the target.
                let new_idx = self.rows.partition_point(|s| s.timestamp < target);
                debug!(from = *idx, to = new_idx, target = %target, "replay seek");
                *idx = new_idx;
            }
        }
    }
}
