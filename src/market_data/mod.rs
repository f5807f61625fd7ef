// =============================================================================
// Market Book — per-symbol top-of-book state with order-flow imbalance
// =============================================================================
//
// The book keeps the latest snapshot per symbol plus an EMA-decayed
// order-flow imbalance accumulator:
//
//   OFI <- 0.85 * OFI + signed_last_size      (sell trades count negative)
//
// Positive OFI means recent flow was buy-initiated. The broker owns the book
// and serializes every access under its own lock; this type itself carries no
// locking so it can sit behind whichever mutex its owner already holds.
// =============================================================================

use std::collections::HashMap;

use crate::types::{MarketSnapshot, OrderSide};

/// EMA decay applied to the OFI accumulator on every snapshot.
pub const OFI_DECAY: f64 = 0.85;

/// Latest state for one symbol.
#[derive(Debug, Clone)]
pub struct SymbolState {
    pub snapshot: MarketSnapshot,
    /// Consumer-side OFI accumulator (producers may also ship their own).
    pub ofi: f64,
}

/// Mapping from symbol to its latest market state.
#[derive(Debug, Default)]
pub struct MarketBook {
    symbols: HashMap<String, SymbolState>,
}

impl MarketBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a new snapshot into the book and return the updated state.
    pub fn apply(&mut self, snapshot: MarketSnapshot) -> &SymbolState {
        let signed_size = match snapshot.last_side {
            OrderSide::Buy => snapshot.last_size,
            OrderSide::Sell => -snapshot.last_size,
        };

        let entry = self
            .symbols
            .entry(snapshot.symbol.clone())
            .or_insert_with(|| SymbolState {
                snapshot: snapshot.clone(),
                ofi: 0.0,
            });

        entry.ofi = OFI_DECAY * entry.ofi + signed_size;
        entry.snapshot = snapshot;
        entry
    }

    pub fn get(&self, symbol: &str) -> Option<&SymbolState> {
        self.symbols.get(symbol)
    }

    /// Current OFI for `symbol`; 0.0 when the symbol is unknown.
    pub fn ofi(&self, symbol: &str) -> f64 {
        self.symbols.get(symbol).map(|s| s.ofi).unwrap_or(0.0)
    }
}
