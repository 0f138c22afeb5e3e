//! Fuse controller: price-band circuit breaker for stable pairs.
//!
//! The fuse is a four-state machine driven by a transition table over price
//! bands. While it is ON, normal range rebalancing is suppressed and the
//! strategy is expected to unwind unconditionally. Any status change
//! invalidates a prior "fully withdrawn" marker.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{FuseStatus, FuseThresholds, PositionState};

/// Where the observed price sits relative to the four thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceBand {
    /// `price < lower_on`
    BelowLowerOn,
    /// `lower_on <= price <= lower_off`
    LowerHysteresis,
    /// `lower_off < price < upper_off`
    Normal,
    /// `upper_off <= price <= upper_on`
    UpperHysteresis,
    /// `price > upper_on`
    AboveUpperOn,
}

/// Outcome of one fuse evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuseDecision {
    pub need_rebalance: bool,
    pub new_status: FuseStatus,
    pub status_changed: bool,
}

/// Classify a price into its band.
pub fn classify(price: Decimal, t: &FuseThresholds) -> PriceBand {
    if price < t.lower_on {
        PriceBand::BelowLowerOn
    } else if price <= t.lower_off {
        PriceBand::LowerHysteresis
    } else if price < t.upper_off {
        PriceBand::Normal
    } else if price <= t.upper_on {
        PriceBand::UpperHysteresis
    } else {
        PriceBand::AboveUpperOn
    }
}

/// Transition table. Hysteresis bands keep the current status.
pub fn transition(status: FuseStatus, band: PriceBand) -> FuseStatus {
    use FuseStatus::*;
    use PriceBand::*;

    match (status, band) {
        (Disabled, _) => Disabled,

        (Off, BelowLowerOn) => OnLowerLimit,
        (Off, AboveUpperOn) => OnUpperLimit,
        (Off, LowerHysteresis | Normal | UpperHysteresis) => Off,

        (OnLowerLimit, BelowLowerOn | LowerHysteresis) => OnLowerLimit,
        (OnLowerLimit, Normal | UpperHysteresis) => Off,
        (OnLowerLimit, AboveUpperOn) => OnUpperLimit,

        (OnUpperLimit, AboveUpperOn | UpperHysteresis) => OnUpperLimit,
        (OnUpperLimit, Normal | LowerHysteresis) => Off,
        (OnUpperLimit, BelowLowerOn) => OnLowerLimit,
    }
}

/// Whether the tick has left the range widened by `rebalance_tick_range`.
pub fn tick_out_of_range(state: &PositionState, tick: i32) -> bool {
    let lower = state.lower_tick.saturating_sub(state.rebalance_tick_range);
    let upper = state.upper_tick.saturating_add(state.rebalance_tick_range);
    tick < lower || tick >= upper
}

/// Evaluate the fuse against the current pool observation.
///
/// Pure: the caller applies the decision with [`apply`].
pub fn evaluate(
    pool_needs_rebalance: bool,
    current_tick: i32,
    current_price_ab: Decimal,
    state: &PositionState,
) -> FuseDecision {
    let pool_out_of_range = pool_needs_rebalance || tick_out_of_range(state, current_tick);

    if !state.stable_pool {
        return FuseDecision {
            need_rebalance: pool_out_of_range,
            new_status: FuseStatus::Off,
            status_changed: false,
        };
    }

    let band = classify(current_price_ab, &state.fuse_thresholds);
    let new_status = transition(state.fuse_status, band);
    let status_changed = new_status != state.fuse_status;

    let need_rebalance = if status_changed {
        true
    } else {
        !new_status.is_on() && pool_out_of_range
    };

    debug!(
        price = %current_price_ab,
        tick = current_tick,
        ?band,
        from = state.fuse_status.as_str(),
        to = new_status.as_str(),
        need_rebalance,
        "fuse evaluated"
    );

    FuseDecision {
        need_rebalance,
        new_status,
        status_changed,
    }
}

/// Write a decision into the state. A status flip clears `withdraw_done`.
pub fn apply(state: &mut PositionState, decision: &FuseDecision) {
    if !decision.status_changed {
        return;
    }
    warn!(
        from = state.fuse_status.as_str(),
        to = decision.new_status.as_str(),
        "fuse status changed"
    );
    state.fuse_status = decision.new_status;
    state.withdraw_done = false;
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;
    use rust_decimal_macros::dec;

    fn state(status: FuseStatus) -> PositionState {
        let mut s = PositionState::new(
            address!("0000000000000000000000000000000000000001"),
            address!("0000000000000000000000000000000000000002"),
            address!("0000000000000000000000000000000000000003"),
            true,
            1,
            -100,
            100,
            10,
            FuseThresholds::from_array([dec!(0.5), dec!(0.7), dec!(1.5), dec!(1.3)]),
        );
        s.fuse_status = status;
        s
    }

    #[test]
    fn test_price_below_lower_on_trips_fuse() {
        let s = state(FuseStatus::Off);
        let d = evaluate(false, 0, dec!(0.49), &s);
        assert!(d.need_rebalance);
        assert!(d.status_changed);
        assert_eq!(d.new_status, FuseStatus::OnLowerLimit);
    }

    #[test]
    fn test_lower_band_hysteresis() {
        let s = state(FuseStatus::OnLowerLimit);
        // Still inside [lower_on, lower_off]: stays ON.
        let d = evaluate(false, 0, dec!(0.6), &s);
        assert_eq!(d.new_status, FuseStatus::OnLowerLimit);
        assert!(!d.status_changed);
        let d = evaluate(false, 0, dec!(0.7), &s);
        assert_eq!(d.new_status, FuseStatus::OnLowerLimit);
        // Above lower_off: OFF.
        let d = evaluate(false, 0, dec!(0.71), &s);
        assert_eq!(d.new_status, FuseStatus::Off);
        assert!(d.need_rebalance);
    }

    #[test]
    fn test_off_does_not_trip_inside_band() {
        let s = state(FuseStatus::Off);
        let d = evaluate(false, 0, dec!(0.6), &s);
        assert_eq!(d.new_status, FuseStatus::Off);
        assert!(!d.need_rebalance);
    }

    #[test]
    fn test_upper_band_symmetry() {
        let s = state(FuseStatus::Off);
        assert_eq!(evaluate(false, 0, dec!(1.4), &s).new_status, FuseStatus::Off);
        assert_eq!(
            evaluate(false, 0, dec!(1.51), &s).new_status,
            FuseStatus::OnUpperLimit
        );

        let s = state(FuseStatus::OnUpperLimit);
        assert_eq!(
            evaluate(false, 0, dec!(1.3), &s).new_status,
            FuseStatus::OnUpperLimit
        );
        assert_eq!(evaluate(false, 0, dec!(1.29), &s).new_status, FuseStatus::Off);
    }

    #[test]
    fn test_direct_jump_between_limits() {
        assert_eq!(
            transition(FuseStatus::OnLowerLimit, PriceBand::AboveUpperOn),
            FuseStatus::OnUpperLimit
        );
        assert_eq!(
            transition(FuseStatus::OnUpperLimit, PriceBand::BelowLowerOn),
            FuseStatus::OnLowerLimit
        );
    }

    #[test]
    fn test_fuse_on_suppresses_pool_rebalance() {
        let s = state(FuseStatus::OnLowerLimit);
        let d = evaluate(true, 1_000, dec!(0.4), &s);
        assert!(!d.status_changed);
        assert!(!d.need_rebalance);
    }

    #[test]
    fn test_tick_out_of_range_triggers_rebalance() {
        let s = state(FuseStatus::Off);
        assert!(!evaluate(false, 109, dec!(1), &s).need_rebalance);
        assert!(evaluate(false, 110, dec!(1), &s).need_rebalance);
        assert!(evaluate(false, -111, dec!(1), &s).need_rebalance);
    }

    #[test]
    fn test_non_stable_pool_ignores_thresholds() {
        let mut s = state(FuseStatus::Off);
        s.stable_pool = false;
        let d = evaluate(false, 0, dec!(0.01), &s);
        assert_eq!(d.new_status, FuseStatus::Off);
        assert!(!d.status_changed);
        assert!(!d.need_rebalance);
        assert!(evaluate(true, 0, dec!(0.01), &s).need_rebalance);
    }

    #[test]
    fn test_disabled_never_changes() {
        let s = state(FuseStatus::Disabled);
        let d = evaluate(true, 0, dec!(0.01), &s);
        assert_eq!(d.new_status, FuseStatus::Disabled);
        assert!(!d.status_changed);
        assert!(d.need_rebalance);
    }

    #[test]
    fn test_status_change_clears_withdraw_done() {
        let mut s = state(FuseStatus::OnLowerLimit);
        s.withdraw_done = true;
        let d = evaluate(false, 0, dec!(1.0), &s);
        apply(&mut s, &d);
        assert_eq!(s.fuse_status, FuseStatus::Off);
        assert!(!s.withdraw_done);
        assert!(s.ensure_consistent().is_ok());
    }

    #[test]
    fn test_unchanged_status_keeps_withdraw_done() {
        let mut s = state(FuseStatus::OnLowerLimit);
        s.withdraw_done = true;
        let d = evaluate(false, 0, dec!(0.3), &s);
        apply(&mut s, &d);
        assert!(s.withdraw_done);
    }

    #[test]
    fn test_every_transition_keeps_invariant() {
        let statuses = [
            FuseStatus::Disabled,
            FuseStatus::Off,
            FuseStatus::OnLowerLimit,
            FuseStatus::OnUpperLimit,
        ];
        let prices = [dec!(0.1), dec!(0.5), dec!(0.6), dec!(1.0), dec!(1.4), dec!(1.5), dec!(2)];
        for status in statuses {
            for price in prices {
                let mut s = state(status);
                s.withdraw_done = status.is_on();
                let d = evaluate(false, 0, price, &s);
                apply(&mut s, &d);
                if d.status_changed {
                    assert!(!s.withdraw_done);
                }
                assert!(s.ensure_consistent().is_ok());
            }
        }
    }
}
