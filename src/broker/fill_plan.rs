// =============================================================================
// Fill Plan — slice allocation for resting maker orders
// =============================================================================
//
// Takers and stops fill in one slice. Maker limits, when partial fills are
// enabled, split into a uniformly chosen number of slices in
// [1, max_slices]; every slice gets at least min_slice_pct of the quantity
// and the last slice absorbs the exact remainder, so the plan always sums to
// the order quantity.
// =============================================================================

use rand::Rng;

use crate::config::PaperBrokerConfig;

/// Build the slice quantities for a maker fill of `qty`.
pub fn plan_maker_slices<R: Rng>(qty: f64, cfg: &PaperBrokerConfig, rng: &mut R) -> Vec<f64> {
    if !cfg.partial_fill_enabled || cfg.partial_fill_max_slices <= 1 {
        return vec![qty];
    }

    // More slices than 1/min_pct cannot each receive the minimum.
    let feasible_max = if cfg.partial_fill_min_slice_pct > 0.0 {
        ((1.0 / cfg.partial_fill_min_slice_pct).floor() as u32).max(1)
    } else {
        cfg.partial_fill_max_slices
    };
    let max_slices = cfg.partial_fill_max_slices.min(feasible_max);

    let slices = rng.gen_range(1..=max_slices) as usize;
    if slices == 1 {
        return vec![qty];
    }

    let min = cfg.partial_fill_min_slice_pct * qty;
    let mut plan = Vec::with_capacity(slices);
    let mut remaining = qty;

    for i in 0..slices - 1 {
        let slices_left = slices - i;
        let max_alloc = remaining - min * (slices_left as f64 - 1.0);
        let alloc = min + rng.gen::<f64>() * (max_alloc - min);
        plan.push(alloc);
        remaining -= alloc;
    }
    // Exact remainder: the plan sums to qty by construction.
    plan.push(remaining);
    plan
}

/// Single-slice plan used by takers and stop orders.
pub fn plan_taker(qty: f64) -> Vec<f64> {
    vec![qty]
}
