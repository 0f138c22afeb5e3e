use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use alloy::primitives::Address;
use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use pair_unwind::config::{self, AggregatorMode, PaperConfig, UnwindAppConfig};
use pair_unwind::constants::DEFAULT_CONFIG_DIR;
use pair_unwind::core::orchestrator::{run_withdraw_by_agg, LoopParams, UnwindReport};
use pair_unwind::core::strategy::PairStrategy;
use pair_unwind::errors::UnwindError;
use pair_unwind::execution::aggregator_client::AggregatorClient;
use pair_unwind::execution::paper::{
    PaperAggregator, PaperLedger, PaperPool, PaperPrices, PaperStore, PaperStrategy, PaperSwapRouter,
    PaperVault,
};
use pair_unwind::logging;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (ignore if missing).
    let _ = dotenvy::dotenv();

    let config_dir = std::env::var("UNWIND_CONFIG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_DIR));

    let config = config::load_config(&config_dir)?;

    // Hold the guard for the process lifetime.
    let _guard = logging::init_tracing(&config.app.logging)?;

    info!(
        pair = %format!("{}/{}", config.pair.token_a.symbol, config.pair.token_b.symbol),
        plan = config.unwind.plan.name(),
        entry_data = %config.unwind.plan.entry_data_hex().unwrap_or_default(),
        mode = ?config.aggregator.mode,
        single_iteration = config.unwind.single_iteration,
        "pair unwind starting"
    );

    let paper = config
        .paper
        .as_ref()
        .context("no venue adapters configured: paper.json is required to execute")?;

    // -----------------------------------------------------------------------
    // Strategy and venues
    // -----------------------------------------------------------------------

    let store = PaperStore::new(&config.app.state_file, &paper.ledger_file);
    let prices = paper_prices(&config, paper)?;
    let (mut strategy, mut vault) = build_strategy(&config, paper, &prices, &store)?;

    // -----------------------------------------------------------------------
    // Fuse check and no-swap rebalance
    // -----------------------------------------------------------------------

    let decision = strategy.fuse_decision();
    if decision.status_changed {
        warn!(
            from = strategy.state().fuse_status.as_str(),
            to = decision.new_status.as_str(),
            "fuse status change detected"
        );
    }
    if decision.need_rebalance {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        match strategy.rebalance_no_swaps(now, &mut vault) {
            Ok(outcome) => {
                info!(
                    fuse = outcome.decision.new_status.as_str(),
                    entered = outcome.events.entered_pool.is_some(),
                    "rebalanced without swaps"
                );
                store.save(&strategy, &vault)?;
            }
            Err(UnwindError::NoRebalanceNeeded) => {}
            Err(e) => return Err(e).context("rebalance failed"),
        }
    }

    // -----------------------------------------------------------------------
    // Unwind loop
    // -----------------------------------------------------------------------

    let shutdown = CancellationToken::new();
    let ctrl_c_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received, stopping after the current step");
            ctrl_c_token.cancel();
        }
    });

    let params = LoopParams::from(&config.unwind);
    let result = match config.aggregator.mode {
        AggregatorMode::Paper => {
            let router = Address::from_str(&paper.router).context("invalid paper.router")?;
            let aggregator = PaperAggregator::new(prices.clone(), paper.swap_slippage_bps, router);
            run_withdraw_by_agg(&mut strategy, &mut vault, &aggregator, &params, Some(&store), &shutdown).await
        }
        AggregatorMode::Live => {
            let aggregator = AggregatorClient::new(&config.aggregator, config.token_decimals()?)?;
            run_withdraw_by_agg(&mut strategy, &mut vault, &aggregator, &params, Some(&store), &shutdown).await
        }
    };

    match result {
        Ok(report) => {
            log_report(&report, &strategy, &vault);
            Ok(())
        }
        Err(e) => {
            error!(error = %e, recoverable = e.is_recoverable(), "unwind stopped");
            Err(e.into())
        }
    }
}

// ---------------------------------------------------------------------------
// Initialization helpers
// ---------------------------------------------------------------------------

fn paper_prices(config: &UnwindAppConfig, paper: &PaperConfig) -> Result<PaperPrices> {
    let state = config.initial_state()?;
    Ok(HashMap::from([
        (state.token_a, paper.price_a),
        (state.token_b, paper.price_b),
    ]))
}

/// Resume the position and the venues it was saved against, otherwise start
/// both from config.
fn build_strategy(
    config: &UnwindAppConfig,
    paper: &PaperConfig,
    prices: &PaperPrices,
    store: &PaperStore,
) -> Result<(PaperStrategy, PaperVault)> {
    let (state, ledger) = match store.load().context("failed to load persisted position")? {
        Some((state, ledger)) => {
            info!(
                path = %store.position().path().display(),
                fuse = state.fuse_status.as_str(),
                liquidity = %state.total_liquidity,
                "position and paper venues restored"
            );
            (state, ledger)
        }
        None => {
            let mut state = config.initial_state()?;
            state.total_liquidity = paper.pool_liquidity;
            (state, PaperLedger::seed(paper))
        }
    };
    state.ensure_consistent()?;

    let money_market = ledger.money_market(state.token_a, state.token_b, prices.clone(), paper.borrow_ratio);
    let pool = PaperPool::new(
        paper.price_a / paper.price_b,
        paper.pool_proportion_b,
        paper.pool_tick,
        state.tick_spacing,
        paper.range_half_width,
    )
    .with_deposit(ledger.pool_reserves, ledger.pool_liquidity);
    let router = PaperSwapRouter::new(prices.clone(), paper.swap_slippage_bps);

    let strategy = PairStrategy::new(
        config.strategy_address()?,
        state,
        ledger.balances,
        config.strategy_params(),
        money_market,
        pool,
        router,
    );
    Ok((strategy, ledger.vault))
}

fn log_report(report: &UnwindReport, strategy: &PaperStrategy, vault: &PaperVault) {
    info!(
        iterations = report.iterations,
        completed = report.completed,
        cancelled = report.cancelled,
        swapped_in = %report.total_swapped_in,
        covered_by_insurance = %report.total_covered_by_insurance,
        uncovered = %report.total_uncovered,
        sent_to_insurance = %report.total_sent_to_insurance,
        "unwind finished"
    );
    let balances = strategy.balances();
    info!(
        a = %balances.a,
        b = %balances.b,
        liquidity = %strategy.state().total_liquidity,
        fuse = strategy.state().fuse_status.as_str(),
        withdraw_done = strategy.state().withdraw_done,
        insurance = %vault.insurance_balance,
        "final position"
    );
    match serde_json::to_string(report) {
        Ok(json) => println!("{json}"),
        Err(e) => warn!(error = %e, "failed to serialize report"),
    }
}
