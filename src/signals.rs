// =============================================================================
// Signals — pluggable candle-signal seam
// =============================================================================
//
// The pipeline treats signal mathematics as a pure function over closed
// candles. The default engine is a fast/slow EMA cross:
//
//   multiplier = 2 / (period + 1)
//   EMA_t      = close_t * multiplier + EMA_{t-1} * (1 - multiplier)
//
// seeded with the SMA of the first `period` closes. A bull cross (fast moves
// above slow) proposes an entry; a bear cross is reported so an open long can
// exit early.
// =============================================================================

use crate::exchange::Candle;

/// Output of one signal evaluation over a candle window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalReading {
    /// A bull cross printed on the latest closed candle.
    pub enter_long: bool,
    /// A bear cross printed on the latest closed candle.
    pub bear_cross: bool,
    pub prev_fast: f64,
    pub prev_slow: f64,
    pub fast: f64,
    pub slow: f64,
    /// Close of the latest candle in the window.
    pub price: f64,
}

/// Pure signal function over closed candles. Implementations must not hold
/// state between evaluations.
pub trait Signals: Send + Sync {
    fn evaluate(&self, candles: &[Candle]) -> Option<SignalReading>;
}

// ---------------------------------------------------------------------------
// Default engine: EMA cross
// ---------------------------------------------------------------------------

/// Fast/slow EMA cross detector.
#[derive(Debug, Clone)]
pub struct EmaCrossSignals {
    pub fast: usize,
    pub slow: usize,
}

impl Default for EmaCrossSignals {
    fn default() -> Self {
        Self { fast: 9, slow: 21 }
    }
}

impl Signals for EmaCrossSignals {
    fn evaluate(&self, candles: &[Candle]) -> Option<SignalReading> {
        if self.fast == 0 || self.slow == 0 || self.fast >= self.slow {
            return None;
        }
        // One extra sample beyond the slow period for the previous values.
        if candles.len() < self.slow + 1 {
            return None;
        }

        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let fast_series = calculate_ema(&closes, self.fast);
        let slow_series = calculate_ema(&closes, self.slow);
        if fast_series.len() < 2 || slow_series.len() < 2 {
            return None;
        }

        let fast = *fast_series.last()?;
        let slow = *slow_series.last()?;
        let prev_fast = fast_series[fast_series.len() - 2];
        let prev_slow = slow_series[slow_series.len() - 2];
        let price = closes.last().copied()?;

        if !(fast.is_finite() && slow.is_finite() && price > 0.0) {
            return None;
        }

        Some(SignalReading {
            enter_long: prev_fast <= prev_slow && fast > slow,
            bear_cross: prev_fast >= prev_slow && fast < slow,
            prev_fast,
            prev_slow,
            fast,
            slow,
            price,
        })
    }
}

/// Compute the EMA series for `closes` with look-back `period`.
///
/// Returns an empty `Vec` when the input is too short or the period is zero.
/// The first output element is the SMA seed at index `period - 1`.
pub fn calculate_ema(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }

    let multiplier = 2.0 / (period + 1) as f64;
    let sma: f64 = closes[..period].iter().sum::<f64>() / period as f64;
    if !sma.is_finite() {
        return Vec::new();
    }

    let mut result = Vec::with_capacity(closes.len() - period + 1);
    result.push(sma);

    let mut prev = sma;
    for &close in &closes[period..] {
        let ema = close * multiplier + prev * (1.0 - multiplier);
        if !ema.is_finite() {
            break;
        }
        result.push(ema);
        prev = ema;
    }

    result
}
