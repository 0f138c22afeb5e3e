//! DEX aggregator client: parallel fan-out with best-output selection.
//!
//! Queries 1inch and OpenOcean in parallel for executable swap calldata,
//! drops routes whose router is not whitelisted, keeps the one with the
//! highest output and caches it for a short TTL. Amounts cross the HTTP
//! boundary as raw integer strings; token decimals come from the pair config.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use alloy::primitives::{Address, U256};
use anyhow::{Context, Result};
use lru::LruCache;
use reqwest::Client;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, warn};

use super::adapters::SwapAggregator;
use crate::config::{AggregatorConfig, AggregatorProviderConfig};
use crate::constants::{DEFAULT_QUOTE_CACHE_SIZE, HTTP_TIMEOUT_SECONDS};
use crate::errors::UnwindError;
use crate::types::{SwapFill, SwapRequest};

/// One provider's answer, in raw token units.
#[derive(Debug, Clone)]
struct ProviderRoute {
    provider: String,
    router: Address,
    amount_out_raw: Decimal,
    calldata: Vec<u8>,
}

struct CacheEntry {
    fill: SwapFill,
    inserted_at: Instant,
}

struct RateLimitState {
    interval: Duration,
    last_request: Option<Instant>,
}

pub struct AggregatorClient {
    http: Client,
    config: AggregatorConfig,
    decimals: HashMap<Address, u32>,
    approved_routers: HashSet<Address>,
    cache: Mutex<LruCache<String, CacheEntry>>,
    cache_ttl: Duration,
    rate_limits: Mutex<Vec<(String, RateLimitState)>>,
}

impl AggregatorClient {
    /// Build from config. `decimals` maps each tradable token to its decimals.
    pub fn new(config: &AggregatorConfig, decimals: HashMap<Address, u32>) -> Result<Self> {
        let mut approved = HashSet::new();
        for provider in &config.providers {
            for router in &provider.approved_routers {
                let addr = Address::from_str(router)
                    .with_context(|| format!("invalid approved router {router} for {}", provider.name))?;
                approved.insert(addr);
            }
        }

        let rate_limits = config
            .providers
            .iter()
            .map(|p| {
                let rps = p.rate_limit_rps.max(1);
                (
                    p.name.clone(),
                    RateLimitState {
                        interval: Duration::from_secs_f64(1.0 / rps as f64),
                        last_request: None,
                    },
                )
            })
            .collect();

        let cache_size = NonZeroUsize::new(config.quote_cache_size)
            .or(NonZeroUsize::new(DEFAULT_QUOTE_CACHE_SIZE))
            .context("quote cache size must be non-zero")?;

        Ok(Self {
            http: Client::builder()
                .timeout(Duration::from_secs(HTTP_TIMEOUT_SECONDS))
                .build()
                .context("failed to build HTTP client")?,
            config: config.clone(),
            decimals,
            approved_routers: approved,
            cache: Mutex::new(LruCache::new(cache_size)),
            cache_ttl: Duration::from_secs(config.quote_cache_ttl_seconds),
            rate_limits: Mutex::new(rate_limits),
        })
    }

    // -----------------------------------------------------------------------
    // Public API
    // -----------------------------------------------------------------------

    /// Fan out to every enabled provider and return the best whitelisted fill.
    pub async fn best_fill(&self, request: &SwapRequest) -> Result<SwapFill, UnwindError> {
        let cache_key = Self::cache_key(request);
        if let Some(cached) = self.get_cached(&cache_key) {
            debug!(provider = %cached.provider, "returning cached fill");
            return Ok(cached);
        }

        let amount_raw = self.to_raw(request.token_in, request.amount_in)?;

        let enabled: Vec<&AggregatorProviderConfig> =
            self.config.providers.iter().filter(|p| p.enabled).collect();
        if enabled.is_empty() {
            return Err(UnwindError::AggregatorUnavailable);
        }

        let futures = enabled
            .iter()
            .map(|provider| self.query_provider(provider, request, amount_raw));
        let results = futures::future::join_all(futures).await;

        let best = results
            .into_iter()
            .filter_map(|r| match r {
                Ok(route) if self.validate_router(route.router) => Some(route),
                Ok(route) => {
                    warn!(
                        provider = %route.provider,
                        router = %route.router,
                        "route rejected: router not in whitelist"
                    );
                    None
                }
                Err(e) => {
                    warn!(error = %e, "provider query failed");
                    None
                }
            })
            .max_by(|a, b| a.amount_out_raw.cmp(&b.amount_out_raw))
            .ok_or(UnwindError::AggregatorUnavailable)?;

        let fill = SwapFill {
            provider: best.provider,
            aggregator: best.router,
            token_in: request.token_in,
            token_out: request.token_out,
            amount_in: request.amount_in,
            amount_out_expected: self.from_raw(request.token_out, best.amount_out_raw)?,
            calldata: best.calldata,
        };
        debug!(
            provider = %fill.provider,
            amount_out = %fill.amount_out_expected,
            "selected best fill"
        );
        self.set_cached(cache_key, fill.clone());
        Ok(fill)
    }

    // -----------------------------------------------------------------------
    // Unit conversion
    // -----------------------------------------------------------------------

    /// Value of one raw unit of `token`, i.e. `10^-decimals`.
    fn unit(&self, token: Address) -> Result<Decimal, UnwindError> {
        let decimals = self
            .decimals
            .get(&token)
            .copied()
            .ok_or_else(|| UnwindError::adapter("aggregator", format!("unknown decimals for {token}")))?;
        Decimal::try_new(1, decimals)
            .map_err(|e| UnwindError::adapter("aggregator", format!("decimals {decimals}: {e}")))
    }

    fn to_raw(&self, token: Address, amount: Decimal) -> Result<U256, UnwindError> {
        let raw = amount
            .checked_div(self.unit(token)?)
            .ok_or_else(|| UnwindError::adapter("aggregator", "amount overflow"))?
            .trunc();
        U256::from_str(&raw.to_string())
            .map_err(|e| UnwindError::adapter("aggregator", format!("amount {raw}: {e}")))
    }

    fn from_raw(&self, token: Address, raw: Decimal) -> Result<Decimal, UnwindError> {
        raw.checked_mul(self.unit(token)?)
            .ok_or_else(|| UnwindError::adapter("aggregator", "amount overflow"))
    }

    // -----------------------------------------------------------------------
    // Provider dispatch
    // -----------------------------------------------------------------------

    async fn query_provider(
        &self,
        provider: &AggregatorProviderConfig,
        request: &SwapRequest,
        amount_raw: U256,
    ) -> Result<ProviderRoute> {
        self.enforce_rate_limit(&provider.name).await;

        match provider.name.as_str() {
            "1inch" => self.query_1inch(provider, request, amount_raw).await,
            "openocean" => self.query_openocean(provider, request, amount_raw).await,
            other => anyhow::bail!("unknown aggregator provider: {other}"),
        }
    }

    fn slippage_pct(&self) -> Decimal {
        Decimal::from(self.config.max_slippage_bps) / dec!(100)
    }

    // -----------------------------------------------------------------------
    // 1inch Classic API v6
    // -----------------------------------------------------------------------

    async fn query_1inch(
        &self,
        provider: &AggregatorProviderConfig,
        request: &SwapRequest,
        amount_raw: U256,
    ) -> Result<ProviderRoute> {
        let url = format!("{}/swap", provider.base_url);
        let mut req = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(provider.timeout_seconds))
            .query(&[
                ("src", format!("{:#x}", request.token_in)),
                ("dst", format!("{:#x}", request.token_out)),
                ("amount", amount_raw.to_string()),
                ("from", format!("{:#x}", request.beneficiary)),
                ("receiver", format!("{:#x}", request.beneficiary)),
                ("slippage", self.slippage_pct().to_string()),
                ("disableEstimate", "true".into()),
            ]);

        if let Some(key) = api_key(provider) {
            req = req.header("Authorization", format!("Bearer {key}"));
        }

        let resp: serde_json::Value = req
            .send()
            .await
            .context("1inch HTTP request failed")?
            .error_for_status()
            .context("1inch HTTP error status")?
            .json()
            .await
            .context("1inch JSON parse failed")?;

        let amount_out_raw: Decimal = resp["dstAmount"]
            .as_str()
            .context("missing dstAmount")?
            .parse()
            .context("invalid dstAmount")?;
        let calldata = decode_hex(resp["tx"]["data"].as_str().context("missing tx.data")?)?;
        let router = Address::from_str(resp["tx"]["to"].as_str().context("missing tx.to")?)
            .context("invalid tx.to")?;

        Ok(ProviderRoute {
            provider: "1inch".into(),
            router,
            amount_out_raw,
            calldata,
        })
    }

    // -----------------------------------------------------------------------
    // OpenOcean API v4
    // -----------------------------------------------------------------------

    async fn query_openocean(
        &self,
        provider: &AggregatorProviderConfig,
        request: &SwapRequest,
        amount_raw: U256,
    ) -> Result<ProviderRoute> {
        let url = format!("{}/swap_quote", provider.base_url);
        let resp: serde_json::Value = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(provider.timeout_seconds))
            .query(&[
                ("inTokenAddress", format!("{:#x}", request.token_in)),
                ("outTokenAddress", format!("{:#x}", request.token_out)),
                ("amount", amount_raw.to_string()),
                ("account", format!("{:#x}", request.beneficiary)),
                ("gasPrice", "5".into()),
                ("slippage", self.slippage_pct().to_string()),
            ])
            .send()
            .await
            .context("OpenOcean HTTP request failed")?
            .error_for_status()
            .context("OpenOcean HTTP error status")?
            .json()
            .await
            .context("OpenOcean JSON parse failed")?;

        let data = &resp["data"];
        let amount_out_raw = match &data["outAmount"] {
            serde_json::Value::String(s) => s.parse::<Decimal>().context("invalid outAmount")?,
            serde_json::Value::Number(n) => {
                Decimal::from(n.as_u64().context("invalid outAmount")?)
            }
            _ => anyhow::bail!("missing data.outAmount"),
        };
        let calldata = decode_hex(data["data"].as_str().context("missing data.data")?)?;
        let router = Address::from_str(data["to"].as_str().context("missing data.to")?)
            .context("invalid data.to")?;

        Ok(ProviderRoute {
            provider: "openocean".into(),
            router,
            amount_out_raw,
            calldata,
        })
    }

    // -----------------------------------------------------------------------
    // Rate limiting
    // -----------------------------------------------------------------------

    async fn enforce_rate_limit(&self, provider_name: &str) {
        let sleep_duration = self.rate_limits.lock().ok().and_then(|limits| {
            let (_, state) = limits.iter().find(|(name, _)| name == provider_name)?;
            let elapsed = state.last_request?.elapsed();
            (elapsed < state.interval).then(|| state.interval - elapsed)
        });

        if let Some(d) = sleep_duration {
            tokio::time::sleep(d).await;
        }

        if let Ok(mut limits) = self.rate_limits.lock() {
            if let Some((_, state)) = limits.iter_mut().find(|(name, _)| name == provider_name) {
                state.last_request = Some(Instant::now());
            }
        }
    }

    // -----------------------------------------------------------------------
    // Router validation
    // -----------------------------------------------------------------------

    fn validate_router(&self, router: Address) -> bool {
        self.approved_routers.is_empty() || self.approved_routers.contains(&router)
    }

    // -----------------------------------------------------------------------
    // Fill cache
    // -----------------------------------------------------------------------

    fn cache_key(request: &SwapRequest) -> String {
        format!(
            "{:#x}:{:#x}:{}:{:#x}",
            request.token_in, request.token_out, request.amount_in, request.beneficiary
        )
    }

    fn get_cached(&self, key: &str) -> Option<SwapFill> {
        let mut cache = self.cache.lock().ok()?;
        let entry = cache.get(key)?;
        if entry.inserted_at.elapsed() > self.cache_ttl {
            cache.pop(key);
            return None;
        }
        Some(entry.fill.clone())
    }

    fn set_cached(&self, key: String, fill: SwapFill) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(
                key,
                CacheEntry {
                    fill,
                    inserted_at: Instant::now(),
                },
            );
        }
    }
}

impl SwapAggregator for AggregatorClient {
    async fn build_swap(&self, request: &SwapRequest) -> Result<SwapFill, UnwindError> {
        self.best_fill(request).await
    }
}

fn api_key(provider: &AggregatorProviderConfig) -> Option<String> {
    if provider.api_key_env.is_empty() {
        return None;
    }
    std::env::var(&provider.api_key_env).ok().filter(|v| !v.is_empty())
}

fn decode_hex(data: &str) -> Result<Vec<u8>> {
    hex::decode(data.strip_prefix("0x").unwrap_or(data)).context("invalid calldata hex")
}
