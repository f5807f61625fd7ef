// =============================================================================
// Position Sizing — risk-capped notional, rounded to venue precision
// =============================================================================
//
//   risk_dollars       = equity * risk_pct
//   notional_from_risk = risk_dollars / stop_loss_pct
//   usd_to_deploy      = min(notional_from_risk, equity * cash_deploy_cap_pct)
//   qty                = round_down(usd_to_deploy / price, qty_step)
//
// Anything below the venue minimum sizes to zero — the caller skips the entry
// rather than submitting a dust order.
// =============================================================================

use crate::exchange::InstrumentInfo;

/// Compute the entry quantity. Returns 0.0 whenever the inputs cannot produce
/// a tradeable size.
pub fn position_size(
    equity: f64,
    risk_pct: f64,
    stop_loss_pct: f64,
    price: f64,
    cash_deploy_cap_pct: f64,
    instrument: InstrumentInfo,
) -> f64 {
    if stop_loss_pct <= 0.0 || price <= 0.0 || equity <= 0.0 {
        return 0.0;
    }

    let risk_dollars = equity * risk_pct;
    let notional_from_risk = risk_dollars / stop_loss_pct;
    let deploy_cap = equity * cash_deploy_cap_pct;
    let usd_to_deploy = notional_from_risk.min(deploy_cap);
    let qty_raw = usd_to_deploy / price;

    let qty = round_down(qty_raw, instrument.qty_step);
    if qty < instrument.min_qty {
        0.0
    } else {
        qty
    }
}

/// Round `qty` down to a multiple of `step`. A small relative epsilon keeps
/// exact multiples from slipping a step on floating-point noise.
pub fn round_down(qty: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return qty;
    }
    ((qty / step) * (1.0 + 1e-9)).floor() * step
}

/// Protective exit levels around an entry price.
pub fn bracket_prices(entry: f64, take_profit_pct: f64, stop_loss_pct: f64) -> (f64, f64) {
    (
        entry * (1.0 + take_profit_pct),
        entry * (1.0 - stop_loss_pct),
    )
}
