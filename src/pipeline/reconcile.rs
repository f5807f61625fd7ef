// =============================================================================
// Reconciliation Guard — adopt or block on pre-existing venue positions
// =============================================================================
//
// Runs once at service start, before any cycle. A clean account continues, a
// simple long is adopted (its PnL tracking stays approximate until it
// closes), and anything the strategy cannot reason about — shorts, hedged
// legs, unexpected position shapes — latches the reconciliation block. The
// latch holds until an operator flattens the account and restarts.
//
// SAFETY POLICY: this module never cancels or closes anything on the venue;
// it only decides whether the pipeline may open new entries.
// =============================================================================

use std::sync::Arc;

use tracing::{info, warn};

use crate::alerts::{AlertCategory, AlertSink};
use crate::exchange::ExchangeClient;

/// Result of the startup query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReconcileOutcome {
    /// No position on the venue: trade normally.
    Clear,
    /// A long was found and adopted; carries its absolute size.
    Adopted(f64),
    /// Incompatible position shape: entries stay blocked.
    Blocked,
}

/// Query the venue for `(symbol, position_idx)` and classify what is there.
///
/// Query failures are logged and do **not** advance the guard: the pipeline
/// starts unblocked and unadopted, exactly as if the account were clean.
pub async fn startup_reconciliation(
    exchange: &dyn ExchangeClient,
    symbol: &str,
    position_idx: u8,
    alerts: &Arc<dyn AlertSink>,
) -> ReconcileOutcome {
    let positions = match exchange.positions(symbol).await {
        Ok(p) => p,
        Err(e) => {
            warn!(symbol, error = %e, "reconciliation query failed — guard not advanced");
            return ReconcileOutcome::Clear;
        }
    };

    let legs: Vec<_> = positions
        .iter()
        .filter(|p| p.symbol == symbol && p.size != 0.0)
        .collect();

    if legs.is_empty() {
        info!(symbol, "reconciliation: no pre-existing position");
        return ReconcileOutcome::Clear;
    }

    // One long on the configured leg: adopt it.
    if legs.len() == 1 && legs[0].size > 0.0 && legs[0].position_idx == position_idx {
        let size = legs[0].size;
        warn!(
            symbol,
            size,
            entry_price = legs[0].entry_price,
            "SAFETY_RECON_ADOPT: adopting pre-existing long — PnL tracking approximate until it closes"
        );
        alerts.emit(
            AlertCategory::SafetyReconAdopt,
            "adopted pre-existing long position",
            &[
                ("symbol", symbol.to_string()),
                ("size", format!("{size}")),
                ("entry_price", format!("{}", legs[0].entry_price)),
            ],
        );
        return ReconcileOutcome::Adopted(size);
    }

    // Short, hedged, or an unexpected leg: block new entries.
    let shape = legs
        .iter()
        .map(|p| format!("idx{}:{}", p.position_idx, p.size))
        .collect::<Vec<_>>()
        .join(",");
    warn!(symbol, shape = %shape, "SAFETY_RECON_ADOPT: found incompatible position shape");
    warn!(
        symbol,
        "SAFETY_RECON_BLOCK: blocking new entries until the account is flattened and the service restarted"
    );
    alerts.emit(
        AlertCategory::SafetyReconAdopt,
        "found incompatible pre-existing position",
        &[("symbol", symbol.to_string()), ("shape", shape.clone())],
    );
    alerts.emit(
        AlertCategory::SafetyReconBlock,
        "new entries blocked until flatten + restart",
        &[("symbol", symbol.to_string()), ("shape", shape)],
    );
    ReconcileOutcome::Blocked
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::RecordingAlertSink;
    use crate::exchange::{
        BracketOrder, Candle, ClosedTrade, InstrumentInfo, MarginInfo, PositionInfo,
    };
    use anyhow::Result;
    use async_trait::async_trait;

    struct FixedPositions {
        positions: Result<Vec<PositionInfo>, String>,
    }

    #[async_trait]
    impl ExchangeClient for FixedPositions {
        async fn klines(&self, _: &str, _: &str, _: u32) -> Result<Vec<Candle>> {
            unimplemented!()
        }
        async fn wallet_equity(&self) -> Result<f64> {
            unimplemented!()
        }
        async fn positions(&self, _: &str) -> Result<Vec<PositionInfo>> {
            match &self.positions {
                Ok(p) => Ok(p.clone()),
                Err(e) => anyhow::bail!("{e}"),
            }
        }
        async fn margin_info(&self, _: &str, _: u8) -> Result<MarginInfo> {
            unimplemented!()
        }
        async fn closed_pnl(&self, _: &str, _: i64) -> Result<Vec<ClosedTrade>> {
            unimplemented!()
        }
        async fn place_bracket_market(&self, _: &BracketOrder) -> Result<String> {
            unimplemented!()
        }
        async fn set_leverage(&self, _: &str, _: f64) -> Result<()> {
            unimplemented!()
        }
        async fn instrument_info(&self, _: &str) -> Result<InstrumentInfo> {
            unimplemented!()
        }
    }

    fn sink() -> Arc<RecordingAlertSink> {
        Arc::new(RecordingAlertSink::default())
    }

    fn pos(size: f64, idx: u8) -> PositionInfo {
        PositionInfo {
            symbol: "BTCUSDT".into(),
            size,
            entry_price: 100.0,
            position_idx: idx,
        }
    }

    #[tokio::test]
    async fn clean_account_continues() {
        let exchange = FixedPositions {
            positions: Ok(vec![]),
        };
        let s = sink();
        let alerts: Arc<dyn AlertSink> = s.clone();
        let outcome = startup_reconciliation(&exchange, "BTCUSDT", 0, &alerts).await;
        assert_eq!(outcome, ReconcileOutcome::Clear);
        assert_eq!(s.emitted.lock().len(), 0);
    }

    #[tokio::test]
    async fn simple_long_is_adopted() {
        let exchange = FixedPositions {
            positions: Ok(vec![pos(1.5, 0)]),
        };
        let s = sink();
        let alerts: Arc<dyn AlertSink> = s.clone();
        let outcome = startup_reconciliation(&exchange, "BTCUSDT", 0, &alerts).await;
        assert_eq!(outcome, ReconcileOutcome::Adopted(1.5));
        assert_eq!(s.count(AlertCategory::SafetyReconAdopt), 1);
        assert_eq!(s.count(AlertCategory::SafetyReconBlock), 0);
    }

    #[tokio::test]
    async fn short_position_blocks() {
        let exchange = FixedPositions {
            positions: Ok(vec![pos(-1.0, 0)]),
        };
        let s = sink();
        let alerts: Arc<dyn AlertSink> = s.clone();
        let outcome = startup_reconciliation(&exchange, "BTCUSDT", 0, &alerts).await;
        assert_eq!(outcome, ReconcileOutcome::Blocked);
        assert_eq!(s.count(AlertCategory::SafetyReconAdopt), 1);
        assert_eq!(s.count(AlertCategory::SafetyReconBlock), 1);
    }

    #[tokio::test]
    async fn hedged_legs_block() {
        let exchange = FixedPositions {
            positions: Ok(vec![pos(1.0, 1), pos(-1.0, 2)]),
        };
        let s = sink();
        let alerts: Arc<dyn AlertSink> = s.clone();
        let outcome = startup_reconciliation(&exchange, "BTCUSDT", 0, &alerts).await;
        assert_eq!(outcome, ReconcileOutcome::Blocked);
    }

    #[tokio::test]
    async fn long_on_wrong_leg_blocks() {
        let exchange = FixedPositions {
            positions: Ok(vec![pos(1.0, 2)]),
        };
        let s = sink();
        let alerts: Arc<dyn AlertSink> = s.clone();
        let outcome = startup_reconciliation(&exchange, "BTCUSDT", 0, &alerts).await;
        assert_eq!(outcome, ReconcileOutcome::Blocked);
    }

    #[tokio::test]
    async fn query_failure_does_not_advance_guard() {
        let exchange = FixedPositions {
            positions: Err("timeout".into()),
        };
        let s = sink();
        let alerts: Arc<dyn AlertSink> = s.clone();
        let outcome = startup_reconciliation(&exchange, "BTCUSDT", 0, &alerts).await;
        assert_eq!(outcome, ReconcileOutcome::Clear);
        assert_eq!(s.emitted.lock().len(), 0);
    }
}
