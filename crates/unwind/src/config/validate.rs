use anyhow::{bail, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::types::{AggregatorMode, UnwindAppConfig};
use crate::types::FuseThresholds;

/// Validate invariants across the merged config that serde alone cannot enforce.
///
/// Every problem is collected before failing so one run reports them all.
/// Called automatically by [`super::load_config`].
pub fn validate_config(config: &UnwindAppConfig) -> Result<()> {
    let mut errors: Vec<String> = Vec::new();

    validate_app_config(config, &mut errors);
    validate_pair_config(config, &mut errors);
    validate_unwind_config(config, &mut errors);
    validate_insurance_config(config, &mut errors);
    validate_aggregator_config(config, &mut errors);
    validate_paper_config(config, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        let msg = format!(
            "Configuration validation failed ({} error{}):\n  - {}",
            errors.len(),
            if errors.len() == 1 { "" } else { "s" },
            errors.join("\n  - ")
        );
        bail!("{msg}");
    }
}

// ---------------------------------------------------------------------------
// App config
// ---------------------------------------------------------------------------

fn validate_app_config(config: &UnwindAppConfig, errors: &mut Vec<String>) {
    if config.app.state_file.is_empty() {
        errors.push("app: state_file is empty".into());
    }
    if let Err(e) = validate_address(&config.app.strategy_address) {
        errors.push(format!("app.strategy_address: {e}"));
    }
}

// ---------------------------------------------------------------------------
// Pair config
// ---------------------------------------------------------------------------

fn validate_pair_config(config: &UnwindAppConfig, errors: &mut Vec<String>) {
    let pair = &config.pair;

    let addrs = [
        ("token_a.address", &pair.token_a.address),
        ("token_b.address", &pair.token_b.address),
        ("pool", &pair.pool),
    ];
    for (name, addr) in &addrs {
        if let Err(e) = validate_address(addr) {
            errors.push(format!("pair.{name}: {e}"));
        }
    }

    if pair.token_a.address.eq_ignore_ascii_case(&pair.token_b.address) {
        errors.push("pair: token_a and token_b must differ".into());
    }

    for token in [&pair.token_a, &pair.token_b] {
        if token.decimals > 28 {
            errors.push(format!(
                "pair: {} decimals ({}) must be <= 28",
                token.symbol, token.decimals
            ));
        }
    }

    if pair.tick_spacing <= 0 {
        errors.push(format!("pair: tick_spacing ({}) must be > 0", pair.tick_spacing));
    }
    if pair.lower_tick >= pair.upper_tick {
        errors.push(format!(
            "pair: lower_tick ({}) must be < upper_tick ({})",
            pair.lower_tick, pair.upper_tick
        ));
    }
    if pair.rebalance_tick_range < 0 {
        errors.push(format!(
            "pair: rebalance_tick_range ({}) must be >= 0",
            pair.rebalance_tick_range
        ));
    }

    if pair.liquidation_threshold_a < Decimal::ZERO || pair.liquidation_threshold_b < Decimal::ZERO {
        errors.push("pair: liquidation thresholds must be >= 0".into());
    }

    // Thresholds are only evaluated for stable pools, but must be well formed
    // whenever present.
    match <[Decimal; 4]>::try_from(pair.fuse_thresholds.as_slice()) {
        Ok(values) => {
            if pair.stable_pool {
                if let Err(e) = FuseThresholds::from_array(values).validate() {
                    errors.push(format!("pair.fuse_thresholds: {e}"));
                }
            }
        }
        Err(_) => errors.push(format!(
            "pair.fuse_thresholds: expected 4 values, got {}",
            pair.fuse_thresholds.len()
        )),
    }
}

// ---------------------------------------------------------------------------
// Unwind config
// ---------------------------------------------------------------------------

fn validate_unwind_config(config: &UnwindAppConfig, errors: &mut Vec<String>) {
    let unwind = &config.unwind;

    if let Err(e) = unwind.plan.validate() {
        errors.push(format!("unwind.plan: {e}"));
    }

    if unwind.max_iterations == 0 {
        errors.push("unwind: max_iterations must be >= 1".into());
    }
    if unwind.max_stalled_steps == 0 {
        errors.push("unwind: max_stalled_steps must be >= 1".into());
    }

    if let Some(cap) = unwind.max_amount_to_swap {
        if cap <= Decimal::ZERO {
            errors.push(format!("unwind: max_amount_to_swap ({cap}) must be > 0"));
        }
    }

    if unwind.max_swap_deviation_pct <= Decimal::ZERO || unwind.max_swap_deviation_pct >= dec!(100) {
        errors.push(format!(
            "unwind: max_swap_deviation_pct ({}) must be in (0, 100)",
            unwind.max_swap_deviation_pct
        ));
    }

    if unwind.proportion_tolerance < Decimal::ZERO || unwind.proportion_tolerance >= Decimal::ONE {
        errors.push(format!(
            "unwind: proportion_tolerance ({}) must be in [0, 1)",
            unwind.proportion_tolerance
        ));
    }

    if unwind.swap_amount_gap_pct < Decimal::ZERO || unwind.swap_amount_gap_pct > dec!(100) {
        errors.push(format!(
            "unwind: swap_amount_gap_pct ({}) must be in [0, 100]",
            unwind.swap_amount_gap_pct
        ));
    }
}

// ---------------------------------------------------------------------------
// Insurance config
// ---------------------------------------------------------------------------

fn validate_insurance_config(config: &UnwindAppConfig, errors: &mut Vec<String>) {
    let ins = &config.insurance;

    if ins.max_draw_pct < Decimal::ZERO || ins.max_draw_pct > dec!(100) {
        errors.push(format!(
            "insurance: max_draw_pct ({}) must be in [0, 100]",
            ins.max_draw_pct
        ));
    }
    if ins.accounting_epsilon < Decimal::ZERO {
        errors.push(format!(
            "insurance: accounting_epsilon ({}) must be >= 0",
            ins.accounting_epsilon
        ));
    }
}

// ---------------------------------------------------------------------------
// Aggregator config
// ---------------------------------------------------------------------------

fn validate_aggregator_config(config: &UnwindAppConfig, errors: &mut Vec<String>) {
    let agg = &config.aggregator;

    if agg.max_slippage_bps == 0 || agg.max_slippage_bps >= 10_000 {
        errors.push(format!(
            "aggregator: max_slippage_bps ({}) must be in (0, 10000)",
            agg.max_slippage_bps
        ));
    }

    for provider in &agg.providers {
        if !matches!(provider.name.as_str(), "1inch" | "openocean") {
            errors.push(format!(
                "aggregator: unknown provider '{}' (expected 1inch or openocean)",
                provider.name
            ));
        }
        if provider.enabled && provider.base_url.is_empty() {
            errors.push(format!("aggregator.{}: base_url is empty", provider.name));
        }
        if provider.rate_limit_rps == 0 {
            errors.push(format!("aggregator.{}: rate_limit_rps must be > 0", provider.name));
        }
        for router in &provider.approved_routers {
            if let Err(e) = validate_address(router) {
                errors.push(format!("aggregator.{}.approved_routers: {e}", provider.name));
            }
        }
    }

    if agg.mode == AggregatorMode::Live && !agg.providers.iter().any(|p| p.enabled) {
        errors.push("aggregator: live mode requires at least one enabled provider".into());
    }
}

// ---------------------------------------------------------------------------
// Paper config
// ---------------------------------------------------------------------------

fn validate_paper_config(config: &UnwindAppConfig, errors: &mut Vec<String>) {
    let Some(paper) = &config.paper else {
        if config.aggregator.mode == AggregatorMode::Paper {
            errors.push("paper mode: paper.json is required".into());
        }
        return;
    };

    if paper.price_a <= Decimal::ZERO || paper.price_b <= Decimal::ZERO {
        errors.push("paper: oracle prices must be > 0".into());
    }
    if paper.pool_proportion_b < Decimal::ZERO || paper.pool_proportion_b > Decimal::ONE {
        errors.push(format!(
            "paper: pool_proportion_b ({}) must be in [0, 1]",
            paper.pool_proportion_b
        ));
    }
    if paper.borrow_ratio <= Decimal::ZERO || paper.borrow_ratio >= Decimal::ONE {
        errors.push(format!(
            "paper: borrow_ratio ({}) must be in (0, 1)",
            paper.borrow_ratio
        ));
    }
    if paper.range_half_width <= 0 {
        errors.push("paper: range_half_width must be > 0".into());
    }
    if paper.direct_debt.is_some_and(|l| !l.is_empty())
        && paper.reverse_debt.is_some_and(|l| !l.is_empty())
    {
        errors.push("paper: direct_debt and reverse_debt cannot both be open".into());
    }
    if let Err(e) = validate_address(&paper.router) {
        errors.push(format!("paper.router: {e}"));
    }
    if paper.ledger_file.is_empty() {
        errors.push("paper: ledger_file is empty".into());
    } else if paper.ledger_file == config.app.state_file {
        errors.push("paper: ledger_file must differ from app.state_file".into());
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Validate an Ethereum-style address string: must be 0x-prefixed and 42 chars
/// of hex.
fn validate_address(addr: &str) -> Result<(), String> {
    if addr.is_empty() {
        return Err("address is empty".into());
    }
    if !addr.starts_with("0x") && !addr.starts_with("0X") {
        return Err(format!("address '{addr}' must start with 0x"));
    }
    if addr.len() != 42 {
        return Err(format!(
            "address '{addr}' has length {} (expected 42)",
            addr.len()
        ));
    }
    if !addr[2..].chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!("address '{addr}' contains non-hex characters"));
    }
    Ok(())
}
