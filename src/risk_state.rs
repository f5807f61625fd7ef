// =============================================================================
// Risk State Store — durable peak equity, daily PnL, consecutive losses
// =============================================================================
//
// The store survives restarts: every accepted trade and every new peak is
// flushed to disk with a temp-file + rename so a partial write is never
// loadable. Trades are deduplicated by their exchange timestamp, strengthened
// with the order id when the venue provides one (two fills sharing a
// createdTime and no order id will still coalesce).
//
// The file layout is part of the external contract:
//   { peak_equity, daily_pnl_by_date: {"YYYY-MM-DD": pnl}, consecutive_losses,
//     seen_trade_timestamps: [string] }
// =============================================================================

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::alerts::{AlertCategory, AlertSink};

// ---------------------------------------------------------------------------
// Persisted layout
// ---------------------------------------------------------------------------

/// On-disk (and wire) form of the risk state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RiskSnapshot {
    #[serde(default)]
    pub peak_equity: f64,
    #[serde(default)]
    pub daily_pnl_by_date: BTreeMap<String, f64>,
    #[serde(default)]
    pub consecutive_losses: u32,
    #[serde(default)]
    pub seen_trade_timestamps: Vec<String>,
}

/// What `open` found on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    Loaded,
    Missing,
    Corrupt,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

struct Inner {
    snap: RiskSnapshot,
    /// Fast membership for the dedup keys persisted in `seen_trade_timestamps`.
    seen: HashSet<String>,
}

/// Thread-safe durable risk state.
pub struct RiskStateStore {
    path: PathBuf,
    alerts: Arc<dyn AlertSink>,
    inner: RwLock<Inner>,
}

impl RiskStateStore {
    /// Open the store at `path`, seeding from an existing snapshot when one is
    /// present and parseable. The load outcome is surfaced on the alert
    /// channel (`safety_state_load`) so an operator can confirm restoration.
    pub fn open(path: impl AsRef<Path>, alerts: Arc<dyn AlertSink>) -> (Self, LoadStatus) {
        let path = path.as_ref().to_path_buf();

        let (snap, status) = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<RiskSnapshot>(&content) {
                Ok(snap) => {
                    info!(
                        path = %path.display(),
                        peak_equity = snap.peak_equity,
                        consecutive_losses = snap.consecutive_losses,
                        days = snap.daily_pnl_by_date.len(),
                        "SAFETY_STATE_LOAD: risk state restored from disk"
                    );
                    (snap, LoadStatus::Loaded)
                }
                Err(e) => {
                    error!(
                        path = %path.display(),
                        error = %e,
                        "SAFETY_STATE_LOAD: risk state file corrupt — starting empty"
                    );
                    (RiskSnapshot::default(), LoadStatus::Corrupt)
                }
            },
            Err(_) => {
                debug!(path = %path.display(), "no risk state file — starting empty");
                (RiskSnapshot::default(), LoadStatus::Missing)
            }
        };

        match status {
            LoadStatus::Loaded => alerts.emit(
                AlertCategory::SafetyStateLoad,
                "risk state restored from disk",
                &[
                    ("path", path.display().to_string()),
                    ("peak_equity", format!("{:.2}", snap.peak_equity)),
                    ("consecutive_losses", snap.consecutive_losses.to_string()),
                ],
            ),
            LoadStatus::Corrupt => alerts.emit(
                AlertCategory::SafetyStateLoad,
                "risk state file corrupt — treated as empty",
                &[("path", path.display().to_string())],
            ),
            LoadStatus::Missing => {}
        }

        let seen: HashSet<String> = snap.seen_trade_timestamps.iter().cloned().collect();
        let store = Self {
            path,
            alerts,
            inner: RwLock::new(Inner { snap, seen }),
        };
        (store, status)
    }

    // -------------------------------------------------------------------------
    // Trade ingestion
    // -------------------------------------------------------------------------

    /// Ingest a closed trade. Returns `true` when the trade was new.
    ///
    /// The dedup key is the exchange `created_time` (ms), suffixed with the
    /// order id when available. On accept: the day's bucket gains `pnl`, the
    /// consecutive-loss counter advances (`+1` if pnl < 0, reset otherwise),
    /// and the snapshot is persisted.
    pub fn record_trade(
        &self,
        pnl: f64,
        created_time_ms: i64,
        order_id: Option<&str>,
    ) -> bool {
        let key = match order_id {
            Some(id) => format!("{created_time_ms}/{id}"),
            None => created_time_ms.to_string(),
        };

        {
            let mut inner = self.inner.write();
            if inner.seen.contains(&key) {
                return false;
            }
            inner.seen.insert(key.clone());
            inner.snap.seen_trade_timestamps.push(key);

            let date = date_of_ms(created_time_ms);
            *inner.snap.daily_pnl_by_date.entry(date).or_insert(0.0) += pnl;

            if pnl < 0.0 {
                inner.snap.consecutive_losses += 1;
            } else {
                inner.snap.consecutive_losses = 0;
            }

            debug!(
                pnl,
                consecutive_losses = inner.snap.consecutive_losses,
                "closed trade recorded"
            );
        }

        self.persist_guarded();
        true
    }

    /// Raise the peak-equity watermark. Monotone: losses never lower it while
    /// the process holds state. Persists only when the peak actually moved.
    pub fn update_peak(&self, equity: f64) {
        let raised = {
            let mut inner = self.inner.write();
            if equity > inner.snap.peak_equity {
                inner.snap.peak_equity = equity;
                true
            } else {
                false
            }
        };
        if raised {
            debug!(equity, "peak equity raised");
            self.persist_guarded();
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Realized PnL bucket for today (UTC).
    pub fn daily_pnl_today(&self) -> f64 {
        self.daily_pnl_on(&Utc::now().format("%Y-%m-%d").to_string())
    }

    pub fn daily_pnl_on(&self, date: &str) -> f64 {
        self.inner
            .read()
            .snap
            .daily_pnl_by_date
            .get(date)
            .copied()
            .unwrap_or(0.0)
    }

    /// Drawdown from peak as a fraction of peak; 0.0 when no peak is held.
    pub fn drawdown(&self, current_equity: f64) -> f64 {
        let peak = self.inner.read().snap.peak_equity;
        if peak > 0.0 {
            ((peak - current_equity) / peak).max(0.0)
        } else {
            0.0
        }
    }

    pub fn consecutive_losses(&self) -> u32 {
        self.inner.read().snap.consecutive_losses
    }

    pub fn peak_equity(&self) -> f64 {
        self.inner.read().snap.peak_equity
    }

    /// Clone of the full snapshot (for the `risk.state` observability feed).
    pub fn snapshot(&self) -> RiskSnapshot {
        self.inner.read().snap.clone()
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    /// Flush the snapshot to disk atomically (tmp sibling + rename).
    pub fn persist(&self) -> Result<()> {
        let content = {
            let inner = self.inner.read();
            serde_json::to_string_pretty(&inner.snap)
                .context("failed to serialise risk state")?
        };

        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp risk state to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to rename risk state into {}", self.path.display()))?;
        Ok(())
    }

    /// Persist, keeping in-memory state authoritative on failure.
    fn persist_guarded(&self) {
        if let Err(e) = self.persist() {
            error!(error = %e, path = %self.path.display(), "risk state persist failed");
            self.alerts.emit(
                AlertCategory::RuntimeError,
                "risk state persist failed — in-memory state retained",
                &[
                    ("path", self.path.display().to_string()),
                    ("error", e.to_string()),
                ],
            );
        }
    }
}

impl std::fmt::Debug for RiskStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("RiskStateStore")
            .field("path", &self.path)
            .field("peak_equity", &inner.snap.peak_equity)
            .field("consecutive_losses", &inner.snap.consecutive_losses)
            .field("seen_trades", &inner.seen.len())
            .finish()
    }
}

/// UTC calendar date ("%Y-%m-%d") of a millisecond epoch timestamp.
fn date_of_ms(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .unwrap_or_else(Utc::now)
        .format("%Y-%m-%d")
        .to_string()
}
