// =============================================================================
// Alert Sink — structured one-line alerts for every safety trigger
// =============================================================================
//
// Every safety gate, reconciliation event, and runtime failure funnels through
// a sink so that trading logic never knows whether alerts land in the log, a
// chat channel, or a pager. The default sink writes a single parseable line:
//
//   ALERT[safety_drawdown]: drawdown limit breached | context={peak=1200,...}
//
// Sink implementations must never acquire broker locks; they receive already
// formatted values only.
// =============================================================================

use tracing::warn;

/// Alert category taxonomy. The wire form is the lowercase snake_case name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertCategory {
    SafetyCircuitBreaker,
    SafetyDailyLoss,
    SafetyDrawdown,
    SafetyMarginBlock,
    SafetySessionTrades,
    SafetySessionRuntime,
    SafetyReconAdopt,
    SafetyReconBlock,
    SafetyStateLoad,
    RuntimeError,
}

impl AlertCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SafetyCircuitBreaker => "safety_circuit_breaker",
            Self::SafetyDailyLoss => "safety_daily_loss",
            Self::SafetyDrawdown => "safety_drawdown",
            Self::SafetyMarginBlock => "safety_margin_block",
            Self::SafetySessionTrades => "safety_session_trades",
            Self::SafetySessionRuntime => "safety_session_runtime",
            Self::SafetyReconAdopt => "safety_recon_adopt",
            Self::SafetyReconBlock => "safety_recon_block",
            Self::SafetyStateLoad => "safety_state_load",
            Self::RuntimeError => "runtime_error",
        }
    }
}

impl std::fmt::Display for AlertCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination-agnostic alert emitter. Implementations may fan out to email,
/// chat, or pagers; they must be cheap enough to call from hot paths or hand
/// off internally.
pub trait AlertSink: Send + Sync {
    fn emit(&self, category: AlertCategory, message: &str, context: &[(&str, String)]);
}

/// Default sink: one warn-level log line per alert.
#[derive(Debug, Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn emit(&self, category: AlertCategory, message: &str, context: &[(&str, String)]) {
        let ctx = context
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        warn!("ALERT[{}]: {} | context={{{}}}", category, message, ctx);
    }
}

/// Test sink that records every emission for assertions.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingAlertSink {
    pub emitted: parking_lot::Mutex<Vec<(AlertCategory, String)>>,
}

#[cfg(test)]
impl RecordingAlertSink {
    pub fn count(&self, category: AlertCategory) -> usize {
        self.emitted
            .lock()
            .iter()
            .filter(|(c, _)| *c == category)
            .count()
    }
}

#[cfg(test)]
impl AlertSink for RecordingAlertSink {
    fn emit(&self, category: AlertCategory, message: &str, _context: &[(&str, String)]) {
        self.emitted.lock().push((category, message.to_string()));
    }
}
