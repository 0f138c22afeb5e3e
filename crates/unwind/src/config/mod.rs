pub mod types;
pub mod validate;

pub use types::*;

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use alloy::primitives::Address;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use tracing::info;

use crate::core::strategy::StrategyParams;
use crate::types::{FuseThresholds, LiquidationThresholds, Plan, PositionState};

/// Load and merge all config JSON files into a single [`UnwindAppConfig`],
/// then apply environment variable overrides and validate.
///
/// Expected directory layout:
/// ```text
/// config/
///   app.json
///   pair.json
///   unwind.json
///   insurance.json
///   aggregator.json
///   paper.json   (optional)
/// ```
///
/// # Environment variable overrides
///
/// | Env Var                          | Config Field                     |
/// |----------------------------------|----------------------------------|
/// | `UNWIND_ENTRY_DATA`              | `unwind.plan` (hex entry data)   |
/// | `UNWIND_SINGLE_ITERATION`        | `unwind.single_iteration`        |
/// | `UNWIND_MAX_ITERATIONS`          | `unwind.max_iterations`          |
/// | `UNWIND_MAX_AMOUNT_TO_SWAP`      | `unwind.max_amount_to_swap`      |
/// | `UNWIND_MAX_SWAP_DEVIATION_PCT`  | `unwind.max_swap_deviation_pct`  |
/// | `UNWIND_STATE_FILE`              | `app.state_file`                 |
/// | `STRATEGY_ADDRESS`               | `app.strategy_address`           |
/// | `AGGREGATOR_MODE`                | `aggregator.mode`                |
pub fn load_config(config_dir: &Path) -> Result<UnwindAppConfig> {
    let read = |name: &str| -> Result<String> {
        let path = config_dir.join(name);
        std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file: {}", path.display()))
    };

    let app: AppConfig = serde_json::from_str(&read("app.json")?).context("parsing app.json")?;

    let pair: PairConfig =
        serde_json::from_str(&read("pair.json")?).context("parsing pair.json")?;

    let unwind: UnwindConfig =
        serde_json::from_str(&read("unwind.json")?).context("parsing unwind.json")?;

    let insurance: InsuranceConfig =
        serde_json::from_str(&read("insurance.json")?).context("parsing insurance.json")?;

    let aggregator: AggregatorConfig =
        serde_json::from_str(&read("aggregator.json")?).context("parsing aggregator.json")?;

    // Paper venue seed is optional.
    let paper: Option<PaperConfig> = match read("paper.json") {
        Ok(contents) => Some(serde_json::from_str(&contents).context("parsing paper.json")?),
        Err(_) => None,
    };

    let mut config = UnwindAppConfig {
        app,
        pair,
        unwind,
        insurance,
        aggregator,
        paper,
    };

    apply_env_overrides(&mut config);
    validate::validate_config(&config)?;

    Ok(config)
}

// ---------------------------------------------------------------------------
// Typed views
// ---------------------------------------------------------------------------

impl UnwindAppConfig {
    pub fn strategy_address(&self) -> Result<Address> {
        parse_address("app.strategy_address", &self.app.strategy_address)
    }

    pub fn fuse_thresholds(&self) -> Result<FuseThresholds> {
        let values: [Decimal; 4] = self
            .pair
            .fuse_thresholds
            .as_slice()
            .try_into()
            .context("pair.fuse_thresholds must have 4 entries")?;
        Ok(FuseThresholds::from_array(values))
    }

    /// State of a strategy that has never run.
    pub fn initial_state(&self) -> Result<PositionState> {
        let pair = &self.pair;
        Ok(PositionState::new(
            parse_address("pair.token_a.address", &pair.token_a.address)?,
            parse_address("pair.token_b.address", &pair.token_b.address)?,
            parse_address("pair.pool", &pair.pool)?,
            pair.stable_pool,
            pair.tick_spacing,
            pair.lower_tick,
            pair.upper_tick,
            pair.rebalance_tick_range,
            self.fuse_thresholds()?,
        ))
    }

    pub fn strategy_params(&self) -> StrategyParams {
        StrategyParams {
            thresholds: LiquidationThresholds::new(
                self.pair.liquidation_threshold_a,
                self.pair.liquidation_threshold_b,
            ),
            max_swap_deviation_pct: self.unwind.max_swap_deviation_pct,
            proportion_tolerance: self.unwind.proportion_tolerance,
            swap_amount_gap_pct: self.unwind.swap_amount_gap_pct,
            max_insurance_draw_pct: self.insurance.max_draw_pct,
            accounting_epsilon: self.insurance.accounting_epsilon,
        }
    }

    /// Decimals of both pair tokens, keyed by address.
    pub fn token_decimals(&self) -> Result<HashMap<Address, u32>> {
        let a = &self.pair.token_a;
        let b = &self.pair.token_b;
        Ok(HashMap::from([
            (parse_address("pair.token_a.address", &a.address)?, a.decimals),
            (parse_address("pair.token_b.address", &b.address)?, b.decimals),
        ]))
    }
}

fn parse_address(field: &str, value: &str) -> Result<Address> {
    Address::from_str(value).with_context(|| format!("{field}: invalid address '{value}'"))
}

// ---------------------------------------------------------------------------
// Environment variable overrides
// ---------------------------------------------------------------------------

/// Apply environment variable overrides to the loaded config.
///
/// Only non-empty env vars take effect. Parse failures are logged and skipped
/// (the JSON value remains).
fn apply_env_overrides(config: &mut UnwindAppConfig) {
    // -- Unwind loop ---------------------------------------------------------
    if let Some(val) = env_string("UNWIND_ENTRY_DATA") {
        match Plan::from_entry_data_hex(&val) {
            Ok(plan) => {
                info!(plan = plan.name(), "env override: UNWIND_ENTRY_DATA");
                config.unwind.plan = plan;
            }
            Err(e) => info!(error = %e, "env override ignored: UNWIND_ENTRY_DATA"),
        }
    }

    if let Some(val) = env_bool("UNWIND_SINGLE_ITERATION") {
        info!(single_iteration = val, "env override: UNWIND_SINGLE_ITERATION");
        config.unwind.single_iteration = val;
    }

    if let Some(val) = env_parse::<u32>("UNWIND_MAX_ITERATIONS") {
        info!(val, "env override: UNWIND_MAX_ITERATIONS");
        config.unwind.max_iterations = val;
    }

    if let Some(val) = env_decimal("UNWIND_MAX_AMOUNT_TO_SWAP") {
        info!(%val, "env override: UNWIND_MAX_AMOUNT_TO_SWAP");
        config.unwind.max_amount_to_swap = Some(val);
    }

    if let Some(val) = env_decimal("UNWIND_MAX_SWAP_DEVIATION_PCT") {
        info!(%val, "env override: UNWIND_MAX_SWAP_DEVIATION_PCT");
        config.unwind.max_swap_deviation_pct = val;
    }

    // -- App -----------------------------------------------------------------
    if let Some(val) = env_string("UNWIND_STATE_FILE") {
        info!(path = %val, "env override: UNWIND_STATE_FILE");
        config.app.state_file = val;
    }

    if let Some(val) = env_string("STRATEGY_ADDRESS") {
        info!("env override: STRATEGY_ADDRESS");
        config.app.strategy_address = val;
    }

    // -- Aggregator ----------------------------------------------------------
    if let Some(val) = env_string("AGGREGATOR_MODE") {
        let mode = match val.to_lowercase().as_str() {
            "paper" => Some(AggregatorMode::Paper),
            "live" => Some(AggregatorMode::Live),
            _ => None,
        };
        match mode {
            Some(mode) => {
                info!(mode = %val, "env override: AGGREGATOR_MODE");
                config.aggregator.mode = mode;
            }
            None => info!(value = %val, "env override ignored: AGGREGATOR_MODE"),
        }
    }
}

/// Read a non-empty env var as a `String`.
fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Read a non-empty env var as a bool (`true`, `1`, `yes` → true).
fn env_bool(key: &str) -> Option<bool> {
    env_string(key).map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
}

/// Read a non-empty env var and parse it as `T`.
fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse().ok())
}

fn env_decimal(key: &str) -> Option<Decimal> {
    env_string(key).and_then(|v| Decimal::from_str(&v).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntryToPool, Plan, PropTarget};
    use rust_decimal_macros::dec;
    use serial_test::serial;
    use std::path::PathBuf;

    fn project_config_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("..")
            .join("..")
            .join("config")
    }

    // -----------------------------------------------------------------------
    // Helper: write a minimal set of config JSON files to a temp dir.
    // -----------------------------------------------------------------------

    fn write_test_configs(dir: &Path) {
        std::fs::write(
            dir.join("app.json"),
            r#"{
                "logging": { "log_dir": "logs" },
                "state_file": "state/unwind_state.json",
                "strategy_address": "0x00000000000000000000000000000000000000ff"
            }"#,
        )
        .unwrap();

        std::fs::write(
            dir.join("pair.json"),
            r#"{
                "token_a": { "symbol": "USDC", "address": "0x00000000000000000000000000000000000000aa", "decimals": 6 },
                "token_b": { "symbol": "USDT", "address": "0x00000000000000000000000000000000000000bb", "decimals": 6 },
                "pool": "0x00000000000000000000000000000000000000cc",
                "stable_pool": true,
                "tick_spacing": 1,
                "lower_tick": -10,
                "upper_tick": 10,
                "rebalance_tick_range": 0,
                "fuse_thresholds": ["0.5", "0.7", "1.5", "1.3"],
                "liquidation_threshold_a": "0.001",
                "liquidation_threshold_b": "0.001"
            }"#,
        )
        .unwrap();

        std::fs::write(
            dir.join("unwind.json"),
            r#"{
                "plan": { "kind": "swap_repay", "prop": { "mode": "fixed", "value": "0" } },
                "entry_to_pool": "disabled",
                "max_iterations": 10,
                "max_step_retries": 2,
                "max_stalled_steps": 3,
                "max_swap_deviation_pct": "1",
                "proportion_tolerance": "0.01",
                "swap_amount_gap_pct": "1"
            }"#,
        )
        .unwrap();

        std::fs::write(
            dir.join("insurance.json"),
            r#"{ "max_draw_pct": "1", "accounting_epsilon": "0.000001" }"#,
        )
        .unwrap();

        std::fs::write(
            dir.join("aggregator.json"),
            r#"{
                "mode": "paper",
                "providers": [
                    {
                        "name": "1inch",
                        "enabled": true,
                        "priority": 1,
                        "base_url": "https://api.1inch.dev/swap/v6.0/1",
                        "api_key_env": "ONEINCH_API_KEY",
                        "rate_limit_rps": 1,
                        "timeout_seconds": 5,
                        "approved_routers": ["0x111111125421cA6dc452d289314280a0f8842A65"]
                    }
                ],
                "max_slippage_bps": 50,
                "quote_cache_ttl_seconds": 10
            }"#,
        )
        .unwrap();

        std::fs::write(
            dir.join("paper.json"),
            r#"{
                "price_a": "1",
                "price_b": "1",
                "pool_tick": 0,
                "range_half_width": 10,
                "pool_proportion_b": "0.5",
                "swap_slippage_bps": 0,
                "borrow_ratio": "0.8",
                "balances": { "a": "100", "b": "0" },
                "pool_deposit": { "a": "500", "b": "500" },
                "pool_liquidity": "1000",
                "direct_debt": { "collateral": "1000", "amount_to_repay": "500" },
                "profit_buffer": "0",
                "insurance_balance": "100",
                "insurance_target": "100",
                "router": "0x00000000000000000000000000000000000000dd"
            }"#,
        )
        .unwrap();
    }

    fn clean_unwind_env() {
        for key in [
            "UNWIND_ENTRY_DATA",
            "UNWIND_SINGLE_ITERATION",
            "UNWIND_MAX_ITERATIONS",
            "UNWIND_MAX_AMOUNT_TO_SWAP",
            "UNWIND_MAX_SWAP_DEVIATION_PCT",
            "UNWIND_STATE_FILE",
            "STRATEGY_ADDRESS",
            "AGGREGATOR_MODE",
        ] {
            std::env::remove_var(key);
        }
    }

    // -----------------------------------------------------------------------
    // Loading
    // -----------------------------------------------------------------------

    #[test]
    #[serial]
    fn test_load_real_configs() {
        clean_unwind_env();
        let dir = project_config_dir();
        if !dir.exists() {
            eprintln!("skipping: config dir not found at {}", dir.display());
            return;
        }
        let config = load_config(&dir).expect("config should load and validate");
        assert!(config.paper.is_some());
        assert_eq!(config.pair.fuse_thresholds.len(), 4);
        clean_unwind_env();
    }

    #[test]
    #[serial]
    fn test_load_test_configs() {
        clean_unwind_env();
        let tmp = tempfile::tempdir().unwrap();
        write_test_configs(tmp.path());
        let config = load_config(tmp.path()).expect("test config should load");
        assert_eq!(
            config.unwind.plan,
            Plan::SwapRepay {
                prop: PropTarget::Fixed(dec!(0))
            }
        );
        assert_eq!(config.unwind.entry_to_pool, EntryToPool::Disabled);
        assert!(!config.unwind.single_iteration);
        assert_eq!(config.unwind.max_amount_to_swap, None);
        assert_eq!(config.aggregator.mode, AggregatorMode::Paper);
        assert_eq!(
            config.aggregator.quote_cache_size,
            crate::constants::DEFAULT_QUOTE_CACHE_SIZE
        );
        let paper = config.paper.as_ref().unwrap();
        assert_eq!(paper.direct_debt.unwrap().amount_to_repay, dec!(500));
        assert!(paper.reverse_debt.is_none());
        assert_eq!(paper.ledger_file, crate::constants::DEFAULT_PAPER_LEDGER_FILE);
        clean_unwind_env();
    }

    #[test]
    #[serial]
    fn test_missing_config_file_errors() {
        clean_unwind_env();
        let tmp = tempfile::tempdir().unwrap();
        let err = load_config(tmp.path()).unwrap_err();
        assert!(
            err.to_string().contains("failed to read config file"),
            "expected file-not-found error, got: {err}"
        );
    }

    #[test]
    #[serial]
    fn test_paper_config_is_optional_in_live_mode() {
        clean_unwind_env();
        let tmp = tempfile::tempdir().unwrap();
        write_test_configs(tmp.path());
        std::fs::remove_file(tmp.path().join("paper.json")).unwrap();
        std::env::set_var("AGGREGATOR_MODE", "live");
        let config = load_config(tmp.path()).unwrap();
        assert!(config.paper.is_none());
        assert_eq!(config.aggregator.mode, AggregatorMode::Live);
        clean_unwind_env();
    }

    #[test]
    #[serial]
    fn test_paper_mode_requires_paper_config() {
        clean_unwind_env();
        let tmp = tempfile::tempdir().unwrap();
        write_test_configs(tmp.path());
        std::fs::remove_file(tmp.path().join("paper.json")).unwrap();
        let err = load_config(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("paper.json"), "got: {err}");
    }

    // -----------------------------------------------------------------------
    // Env overrides
    // -----------------------------------------------------------------------

    #[test]
    #[serial]
    fn test_env_override_single_iteration() {
        clean_unwind_env();
        let tmp = tempfile::tempdir().unwrap();
        write_test_configs(tmp.path());
        std::env::set_var("UNWIND_SINGLE_ITERATION", "1");
        let config = load_config(tmp.path()).unwrap();
        assert!(config.unwind.single_iteration);
        clean_unwind_env();
    }

    #[test]
    #[serial]
    fn test_env_override_swap_limits() {
        clean_unwind_env();
        let tmp = tempfile::tempdir().unwrap();
        write_test_configs(tmp.path());
        std::env::set_var("UNWIND_MAX_AMOUNT_TO_SWAP", "250.5");
        std::env::set_var("UNWIND_MAX_SWAP_DEVIATION_PCT", "0.3");
        let config = load_config(tmp.path()).unwrap();
        assert_eq!(config.unwind.max_amount_to_swap, Some(dec!(250.5)));
        assert_eq!(config.unwind.max_swap_deviation_pct, dec!(0.3));
        clean_unwind_env();
    }

    #[test]
    #[serial]
    fn test_env_override_empty_string_ignored() {
        clean_unwind_env();
        let tmp = tempfile::tempdir().unwrap();
        write_test_configs(tmp.path());
        std::env::set_var("UNWIND_STATE_FILE", "");
        let config = load_config(tmp.path()).unwrap();
        assert_eq!(config.app.state_file, "state/unwind_state.json");
        clean_unwind_env();
    }

    #[test]
    #[serial]
    fn test_env_override_invalid_parse_ignored() {
        clean_unwind_env();
        let tmp = tempfile::tempdir().unwrap();
        write_test_configs(tmp.path());
        std::env::set_var("UNWIND_MAX_ITERATIONS", "many");
        std::env::set_var("AGGREGATOR_MODE", "sometimes");
        let config = load_config(tmp.path()).unwrap();
        assert_eq!(config.unwind.max_iterations, 10);
        assert_eq!(config.aggregator.mode, AggregatorMode::Paper);
        clean_unwind_env();
    }

    #[test]
    #[serial]
    fn test_plan_accepts_hex_entry_data() {
        clean_unwind_env();
        let tmp = tempfile::tempdir().unwrap();
        write_test_configs(tmp.path());
        let plan = Plan::RepaySwapRepay {
            prop: PropTarget::PoolProportion,
            debt_amount_to_reduce: dec!(750),
        };
        let path = tmp.path().join("unwind.json");
        let unwind = std::fs::read_to_string(&path).unwrap().replace(
            r#"{ "kind": "swap_repay", "prop": { "mode": "fixed", "value": "0" } }"#,
            &format!("\"{}\"", plan.entry_data_hex().unwrap()),
        );
        std::fs::write(&path, unwind).unwrap();

        let config = load_config(tmp.path()).unwrap();
        assert_eq!(config.unwind.plan, plan);
        clean_unwind_env();
    }

    #[test]
    #[serial]
    fn test_env_override_entry_data() {
        clean_unwind_env();
        let tmp = tempfile::tempdir().unwrap();
        write_test_configs(tmp.path());
        let plan = Plan::SwapOnly {
            prop: PropTarget::Fixed(dec!(0.25)),
        };
        std::env::set_var("UNWIND_ENTRY_DATA", plan.entry_data_hex().unwrap());
        let config = load_config(tmp.path()).unwrap();
        assert_eq!(config.unwind.plan, plan);

        std::env::set_var("UNWIND_ENTRY_DATA", "0xdeadbeef");
        let config = load_config(tmp.path()).unwrap();
        assert_eq!(
            config.unwind.plan,
            Plan::SwapRepay {
                prop: PropTarget::Fixed(dec!(0))
            }
        );
        clean_unwind_env();
    }

    // -----------------------------------------------------------------------
    // Typed views
    // -----------------------------------------------------------------------

    #[test]
    #[serial]
    fn test_typed_views() {
        clean_unwind_env();
        let tmp = tempfile::tempdir().unwrap();
        write_test_configs(tmp.path());
        let config = load_config(tmp.path()).unwrap();

        let state = config.initial_state().unwrap();
        assert!(state.stable_pool);
        assert_eq!(state.fuse_thresholds.upper_off, dec!(1.3));
        assert_eq!((state.lower_tick, state.upper_tick), (-10, 10));

        let params = config.strategy_params();
        assert_eq!(params.thresholds.a, dec!(0.001));
        assert_eq!(params.max_insurance_draw_pct, dec!(1));

        let decimals = config.token_decimals().unwrap();
        assert_eq!(decimals.get(&state.token_a), Some(&6));
        assert_eq!(
            config.strategy_address().unwrap(),
            alloy::primitives::address!("00000000000000000000000000000000000000ff")
        );
        clean_unwind_env();
    }
}
