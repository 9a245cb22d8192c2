// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : linc_bot, multi-strategy trading client for the LINC market API
Module  : config.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Polls LINC market data into a shared rolling-window cache, runs
          divergence, Markowitz and index-RSI strategies on their own capital
          slices, liquidates on shutdown, exposes Prometheus metrics, and
          records JSONL events.
=============================================================================
*/
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::Duration as ChronoDuration;
use clap::Parser;
use tokio::time::Duration;
use tracing::warn;

use crate::cache::RetentionPolicy;
use crate::error::ConfigError;
use crate::liquidation::LiquidationCfg;
use crate::retry::RetryPolicy;
use crate::risk::AllocationMode;
use crate::runner::RunnerCfg;
use crate::strategy::{BreadthGate, DivergenceParams, IndexRsiParams, MarkowitzParams};
use crate::updater::UpdaterCfg;

#[derive(Parser, Debug)]
#[command(name = "linc_bot", version, about = "Multi-strategy trading client for the LINC market API")]
pub struct Cli {
    /// Load environment from this file instead of ./.env
    #[arg(long)]
    pub env_file: Option<PathBuf>,
    /// tracing filter, e.g. "info,linc_bot::runner=debug" (overrides RUST_LOG)
    #[arg(long)]
    pub log: Option<String>,
}

/// Where orders and market data go.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VenueMode {
    Mock,
    Linc,
}

impl VenueMode {
    pub fn from_env(key: &str, default_mode: VenueMode) -> VenueMode {
        match env::var(key).unwrap_or_default().to_ascii_lowercase().as_str() {
            "mock" | "paper" => VenueMode::Mock,
            "linc" => VenueMode::Linc,
            _ => default_mode,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VenueMode::Mock => "mock",
            VenueMode::Linc => "linc",
        }
    }
}

// ===== Strategies =====
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StrategyMode {
    Divergence,
    Markowitz,
    IndexRsi,
}

impl StrategyMode {
    pub fn parse_one(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "divergence" | "momentum" | "div" => Some(StrategyMode::Divergence),
            "markowitz" | "mv" => Some(StrategyMode::Markowitz),
            "index_rsi" | "indexrsi" | "index" => Some(StrategyMode::IndexRsi),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyMode::Divergence => "divergence",
            StrategyMode::Markowitz => "markowitz",
            StrategyMode::IndexRsi => "index_rsi",
        }
    }

    /// Comma separated list; unknown names are skipped, duplicates dropped.
    pub fn parse_list(val: &str) -> Vec<Self> {
        let mut out: Vec<Self> = Vec::new();
        for mode in val.split(',').filter_map(Self::parse_one) {
            if !out.contains(&mode) {
                out.push(mode);
            }
        }
        out
    }

    /// Reads `STRATEGIES` (comma separated), falling back to `STRATEGY` (single).
    pub fn parse_many(env_key_list: &str, env_key_single: &str, default_list: Vec<Self>) -> Vec<Self> {
        if let Ok(val) = env::var(env_key_list) {
            let out = Self::parse_list(&val);
            if !out.is_empty() {
                return out;
            }
        }
        if let Ok(one) = env::var(env_key_single) {
            if let Some(mode) = Self::parse_one(&one) {
                return vec![mode];
            }
        }
        default_list
    }
}

/// Trimmed, upper-cased, non-empty entries of a comma separated list.
pub fn split_symbols(val: &str) -> Vec<String> {
    val.split(',')
        .map(|x| x.trim())
        .filter(|x| !x.is_empty())
        .map(|x| x.to_ascii_uppercase())
        .collect()
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

fn env_opt<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_ms(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_or(key, default_ms))
}

fn span(key: &'static str, value: i64, build: fn(i64) -> Option<ChronoDuration>) -> Result<ChronoDuration, ConfigError> {
    build(value).ok_or(ConfigError::OutOfRange { key, value })
}

#[derive(Clone, Debug)]
pub struct Allocations {
    pub index_rsi: f64,
    pub markowitz: f64,
    pub divergence: f64,
}

impl Allocations {
    pub fn for_mode(&self, mode: &StrategyMode) -> f64 {
        match mode {
            StrategyMode::Divergence => self.divergence,
            StrategyMode::Markowitz => self.markowitz,
            StrategyMode::IndexRsi => self.index_rsi,
        }
    }

    pub fn total(&self, modes: &[StrategyMode]) -> f64 {
        modes.iter().map(|m| self.for_mode(m)).sum()
    }
}

#[derive(Clone, Debug)]
pub struct Args {
    // venue
    pub venue_mode: VenueMode,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub request_timeout: Duration,
    pub paper_symbols: Vec<String>,
    pub paper_cash: f64,
    pub paper_fill_ms: u64,

    // capital
    pub starting_capital: Option<f64>,
    pub allocations: Allocations,
    pub strategy_modes: Vec<StrategyMode>,

    // files/metrics
    pub record_file: Option<String>,
    pub metrics_port: u16,

    // loops
    pub updater: UpdaterCfg,
    pub retention: RetentionPolicy,
    pub divergence_interval: Duration,
    pub markowitz_interval: Duration,
    pub index_interval: Duration,
    /// Extra fraction on top of the reference price when sizing buys.
    pub price_headroom: f64,
    pub liquidate_exclude: Vec<String>,
    pub liquidation_retry: RetryPolicy,

    // heuristics
    pub divergence: DivergenceParams,
    pub markowitz: MarkowitzParams,
    pub index_rsi: IndexRsiParams,
}

impl Args {
    pub fn runner_cfg(&self, mode: &StrategyMode) -> RunnerCfg {
        let interval = match mode {
            StrategyMode::Divergence => self.divergence_interval,
            StrategyMode::Markowitz => self.markowitz_interval,
            StrategyMode::IndexRsi => self.index_interval,
        };
        RunnerCfg { interval, price_headroom: self.price_headroom, ..RunnerCfg::default() }
    }

    pub fn liquidation_cfg(&self) -> LiquidationCfg {
        LiquidationCfg { exclude: self.liquidate_exclude.clone(), retry: self.liquidation_retry.clone() }
    }
}

fn load_updater(retry_base: Duration, retry_max: Duration) -> UpdaterCfg {
    let d = UpdaterCfg::default();
    let ticker = env::var("UPDATE_TICKER").ok().map(|t| t.trim().to_ascii_uppercase()).filter(|t| !t.is_empty());
    // 0 attempts means retry forever
    let attempts: u32 = env_or("INIT_RETRY_ATTEMPTS", 5);
    UpdaterCfg {
        days_back: env_or("UPDATE_DAYS_BACK", d.days_back),
        ticker,
        interval: env_ms("UPDATE_INTERVAL_MS", d.interval.as_millis() as u64),
        init_days_back: env_or("INIT_DAYS_BACK", d.init_days_back),
        fetch_timeout: env_ms("FETCH_TIMEOUT_MS", d.fetch_timeout.as_millis() as u64),
        init_retry: RetryPolicy::exponential(retry_base, retry_max, (attempts > 0).then_some(attempts)),
    }
}

fn load_retention() -> Result<RetentionPolicy, ConfigError> {
    let d = RetentionPolicy::default();
    let max_age = match env_opt::<i64>("RETAIN_HOURS") {
        Some(h) if h > 0 => Some(span("RETAIN_HOURS", h, ChronoDuration::try_hours)?),
        Some(_) => None,
        None => d.max_age,
    };
    Ok(RetentionPolicy {
        max_age,
        max_rows: env_opt::<usize>("RETAIN_ROWS").filter(|r| *r > 0),
        max_days: env_or("RETAIN_DAYS", d.max_days),
    })
}

fn load_divergence() -> Result<DivergenceParams, ConfigError> {
    let d = DivergenceParams::default();
    let days = |key: &'static str, default: ChronoDuration| match env_opt::<i64>(key) {
        Some(n) => span(key, n, ChronoDuration::try_days),
        None => Ok(default),
    };
    let holding_period = days("DIVERGENCE_HOLDING_DAYS", d.holding_period)?;
    let cooldown = days("DIVERGENCE_COOLDOWN_DAYS", d.cooldown)?;
    let breadth = env::var("DIVERGENCE_BREADTH").ok().filter(|v| v == "1" || v.eq_ignore_ascii_case("true")).map(|_| {
        BreadthGate {
            short: env_or("BREADTH_SHORT", 20),
            long: env_or("BREADTH_LONG", 63),
            threshold: env_or("BREADTH_THRESHOLD", 0.5),
        }
    });
    let mut allocation = d.allocation.clone();
    if env::var("DIVERGENCE_ALLOCATION").map(|v| v.eq_ignore_ascii_case("weighted")).unwrap_or(false) {
        allocation.mode = AllocationMode::Weighted;
    }
    allocation.spend_limit = env_or("DIVERGENCE_SPEND_LIMIT", allocation.spend_limit);
    allocation.min_fraction = env_or("DIVERGENCE_MIN_FRACTION", allocation.min_fraction);
    Ok(DivergenceParams {
        rsi_period: env_or("DIVERGENCE_RSI_PERIOD", d.rsi_period),
        ma_period: env_or("DIVERGENCE_MA_PERIOD", d.ma_period),
        std_period: env_or("DIVERGENCE_STD_PERIOD", d.std_period),
        rsi_threshold: env_or("DIVERGENCE_RSI_THRESHOLD", d.rsi_threshold),
        lookback_start: env_or("DIVERGENCE_LOOKBACK_START", d.lookback_start),
        lookback_end: env_or("DIVERGENCE_LOOKBACK_END", d.lookback_end),
        stop_k: env_or("DIVERGENCE_STOP_K", d.stop_k),
        holding_period,
        cooldown,
        breadth,
        allocation,
    })
}

fn load_markowitz() -> MarkowitzParams {
    let mut p = MarkowitzParams::default();
    p.lookback_days = env_or("MARKOWITZ_LOOKBACK_DAYS", p.lookback_days);
    p.optimizer.risk_aversion = env_or("MARKOWITZ_RISK_AVERSION", p.optimizer.risk_aversion);
    p.min_weight = env_or("MARKOWITZ_MIN_WEIGHT", p.min_weight);
    p.allocation.spend_limit = env_or("MARKOWITZ_SPEND_LIMIT", p.allocation.spend_limit);
    p
}

fn load_index_rsi() -> IndexRsiParams {
    let d = IndexRsiParams::default();
    IndexRsiParams {
        symbol: env::var("INDEX_SYMBOL").map(|s| s.trim().to_ascii_uppercase()).unwrap_or(d.symbol),
        rsi_period: env_or("INDEX_RSI_PERIOD", d.rsi_period),
        threshold: env_or("INDEX_RSI_THRESHOLD", d.threshold),
        buys: env_or("INDEX_BUYS", d.buys),
    }
}

/// Reads `.env` (or `env_file`) into the process environment, then builds Args.
pub fn load(env_file: Option<&PathBuf>) -> Result<Args, ConfigError> {
    match env_file {
        Some(path) => {
            if let Err(e) = dotenvy::from_path(path) {
                warn!(%e, path = %path.display(), "env file not loaded");
            }
        }
        None => {
            let _ = dotenvy::dotenv();
        }
    }

    // ===== Venue =====
    let venue_mode = VenueMode::from_env("VENUE_MODE", VenueMode::Mock);
    let api_key = env::var("LINC_API_KEY").ok().filter(|k| !k.trim().is_empty());
    let base_url = env::var("LINC_BASE_URL").ok().filter(|u| !u.trim().is_empty());
    let paper_symbols = env::var("PAPER_SYMBOLS")
        .ok()
        .map(|s| split_symbols(&s))
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| ["STOCK1", "STOCK2", "STOCK3", "STOCK4", "INDEX1"].map(String::from).to_vec());

    // ===== Capital =====
    let allocations = Allocations {
        index_rsi: env_or("ALLOC_INDEX", 0.15),
        markowitz: env_or("ALLOC_MARKOWITZ", 0.45),
        divergence: env_or("ALLOC_DIVERGENCE", 0.35),
    };
    // Example:
    //   STRATEGY=markowitz
    //   STRATEGIES=divergence,index_rsi
    let strategy_modes = StrategyMode::parse_many(
        "STRATEGIES",
        "STRATEGY",
        vec![StrategyMode::IndexRsi, StrategyMode::Markowitz, StrategyMode::Divergence],
    );
    let committed = allocations.total(&strategy_modes);
    if committed > 1.0 {
        warn!(committed, "allocation fractions exceed 1.0, strategies share more than the balance");
    }

    // ===== Retry =====
    let retry_base = env_ms("RETRY_BASE_MS", 500);
    let retry_max = env_ms("RETRY_MAX_MS", 30_000);

    let liquidate_exclude = env::var("LIQUIDATE_EXCLUDE")
        .map(|s| split_symbols(&s))
        .unwrap_or_else(|_| vec!["INDEX1".to_string()]);

    Ok(Args {
        venue_mode,
        api_key,
        base_url,
        request_timeout: env_ms("REQUEST_TIMEOUT_MS", 10_000),
        paper_symbols,
        paper_cash: env_or("PAPER_CASH", 100_000.0),
        paper_fill_ms: env_or("PAPER_FILL_MS", 50),
        starting_capital: env_opt::<f64>("STARTING_CAPITAL").filter(|c| *c > 0.0),
        allocations,
        strategy_modes,
        record_file: env::var("RECORD_FILE").ok().filter(|p| !p.trim().is_empty()),
        metrics_port: env_or("METRICS_PORT", 9898),
        updater: load_updater(retry_base, retry_max),
        retention: load_retention()?,
        divergence_interval: env_ms("DIVERGENCE_INTERVAL_MS", 5_000),
        markowitz_interval: env_ms("MARKOWITZ_INTERVAL_MS", 240_000),
        index_interval: env_ms("INDEX_INTERVAL_MS", 8_000),
        price_headroom: env_or("RUNNER_PRICE_HEADROOM", 0.01f64).max(0.0),
        liquidate_exclude,
        liquidation_retry: RetryPolicy::exponential(retry_base, retry_max, None),
        divergence: load_divergence()?,
        markowitz: load_markowitz(),
        index_rsi: load_index_rsi(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_names_and_aliases() {
        assert_eq!(StrategyMode::parse_one(" Markowitz "), Some(StrategyMode::Markowitz));
        assert_eq!(StrategyMode::parse_one("index"), Some(StrategyMode::IndexRsi));
        assert_eq!(StrategyMode::parse_one("momentum"), Some(StrategyMode::Divergence));
        assert_eq!(StrategyMode::parse_one("ma_crossover"), None);
        for m in [StrategyMode::Divergence, StrategyMode::Markowitz, StrategyMode::IndexRsi] {
            assert_eq!(StrategyMode::parse_one(m.as_str()), Some(m));
        }
    }

    #[test]
    fn strategy_list_skips_unknown_and_duplicates() {
        let modes = StrategyMode::parse_list("index_rsi, bogus,markowitz,index");
        assert_eq!(modes, vec![StrategyMode::IndexRsi, StrategyMode::Markowitz]);
        assert!(StrategyMode::parse_list(" , ").is_empty());
    }

    #[test]
    fn symbol_lists_are_normalized() {
        assert_eq!(split_symbols("stock1, INDEX1,,  stock2 "), vec!["STOCK1", "INDEX1", "STOCK2"]);
        assert!(split_symbols("").is_empty());
    }

    #[test]
    fn allocation_per_mode() {
        let a = Allocations { index_rsi: 0.15, markowitz: 0.45, divergence: 0.35 };
        assert_eq!(a.for_mode(&StrategyMode::Markowitz), 0.45);
        let total = a.total(&[StrategyMode::IndexRsi, StrategyMode::Divergence]);
        assert!((total - 0.5).abs() < 1e-12);
    }

    #[test]
    fn huge_periods_are_rejected_instead_of_panicking() {
        assert_eq!(span("RETAIN_HOURS", 48, ChronoDuration::try_hours).unwrap(), ChronoDuration::try_hours(48).unwrap());
        let err = span("RETAIN_HOURS", i64::MAX, ChronoDuration::try_hours).unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { key: "RETAIN_HOURS", value: i64::MAX }));
        assert!(span("DIVERGENCE_HOLDING_DAYS", i64::MAX / 2, ChronoDuration::try_days).is_err());
        assert!(err.to_string().contains("RETAIN_HOURS"));
    }
}
