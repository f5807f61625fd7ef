// =============================================================================
// Slippage Model — spread- and flow-aware taker cost in basis points
// =============================================================================
//
//   slip = clamp(base + spread_coeff * spread_bps + ofi_coeff * adverse,
//                0, max_slippage_bps)
//
// Adverse pressure is the OFI component working against the order: for a buy,
// recent sell-initiated flow (OFI < 0); for a sell, recent buy-initiated flow
// (OFI > 0). Makers fill at their stated limit with zero slippage — this
// module only prices takers.
// =============================================================================

use crate::config::PaperBrokerConfig;
use crate::types::{MarketSnapshot, OrderSide};

/// Flow pressure working against `side`.
pub fn adverse_pressure(side: OrderSide, ofi: f64) -> f64 {
    match side {
        OrderSide::Buy => (-ofi).max(0.0),
        OrderSide::Sell => ofi.max(0.0),
    }
}

/// Modeled taker slippage in basis points, clamped to [0, max].
pub fn slippage_bps(
    cfg: &PaperBrokerConfig,
    side: OrderSide,
    spread_bps: f64,
    ofi: f64,
) -> f64 {
    let raw = cfg.slippage_bps
        + cfg.spread_slippage_coeff * spread_bps
        + cfg.ofi_slippage_coeff * adverse_pressure(side, ofi);
    raw.clamp(0.0, cfg.max_slippage_bps)
}

/// Taker fill price: buys lift the ask inflated by slip, sells hit the bid
/// deflated symmetrically. Falls back to mid when the touched side is absent.
pub fn taker_fill_price(side: OrderSide, snapshot: &MarketSnapshot, slip_bps: f64) -> f64 {
    let factor = slip_bps / 10_000.0;
    match side {
        OrderSide::Buy => {
            let reference = if snapshot.best_ask > 0.0 {
                snapshot.best_ask
            } else {
                snapshot.mid()
            };
            reference * (1.0 + factor)
        }
        OrderSide::Sell => {
            let reference = if snapshot.best_bid > 0.0 {
                snapshot.best_bid
            } else {
                snapshot.mid()
            };
            reference * (1.0 - factor)
        }
    }
}

/// Whether a limit order crosses the opposite side (and therefore takes).
///
/// A buy crosses iff `price >= best_ask`, or `price >= mid` when the ask is
/// undefined; symmetric for sells.
pub fn limit_crosses(side: OrderSide, limit_price: f64, snapshot: &MarketSnapshot) -> bool {
    match side {
        OrderSide::Buy => {
            if snapshot.best_ask > 0.0 {
                limit_price >= snapshot.best_ask
            } else {
                limit_price >= snapshot.mid()
            }
        }
        OrderSide::Sell => {
            if snapshot.best_bid > 0.0 {
                limit_price <= snapshot.best_bid
            } else {
                limit_price <= snapshot.mid()
            }
        }
    }
}
