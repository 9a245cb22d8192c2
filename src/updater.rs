// ===============================
// src/updater.rs
// ===============================
//
// The single writer of the market data cache.
// - initialize(): startup history load, bounded retries, fatal when nothing arrives.
// - run(): poll the lookback window, convert, append, sleep. Never fatal.
// - supervise(): keeps run() alive until shutdown, restarting it if it panics or ends early.
//
use chrono::{DateTime, NaiveDateTime, Utc};
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};

use crate::cache::{AppendError, MarketDataCache};
use crate::domain::{HistoricalRecord, Observation};
use crate::error::{ApiError, BotError};
use crate::gateway::SharedApi;
use crate::metrics::{CACHE_DAILY_ROWS, CACHE_OBS_ROWS, CACHE_VERSION, DATA_FAULTS, FETCHES, UPDATER_RESTARTS};
use crate::retry::RetryPolicy;
use crate::shutdown::Shutdown;

#[derive(Debug, Clone)]
pub struct UpdaterCfg {
    pub days_back: u32,
    pub ticker: Option<String>,
    pub interval: Duration,
    pub init_days_back: u32,
    pub fetch_timeout: Duration,
    pub init_retry: RetryPolicy,
}

impl Default for UpdaterCfg {
    fn default() -> Self {
        Self {
            days_back: 5,
            ticker: None,
            interval: Duration::from_millis(1000),
            init_days_back: 252,
            fetch_timeout: Duration::from_secs(10),
            init_retry: RetryPolicy::exponential(Duration::from_millis(500), Duration::from_secs(30), Some(5)),
        }
    }
}

fn parse_gmt_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%a, %d %b %Y %H:%M:%S GMT"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// One API row to an Observation. Volumes default to zero; everything else is required.
pub fn to_observation(rec: &HistoricalRecord) -> Result<Observation, BotError> {
    let symbol = rec.symbol.as_deref().map(str::trim).filter(|s| !s.is_empty());
    let Some(symbol) = symbol else {
        return Err(BotError::integrity("?", "missing symbol"));
    };
    let ts = rec
        .gmt_time
        .as_deref()
        .ok_or_else(|| BotError::integrity(symbol, "missing gmtTime"))
        .and_then(|raw| parse_gmt_time(raw).ok_or_else(|| BotError::integrity(symbol, format!("bad gmtTime {raw:?}"))))?;
    let (ask, bid) = match (rec.ask_median, rec.bid_median) {
        (Some(a), Some(b)) if a.is_finite() && b.is_finite() && a > 0.0 && b > 0.0 => (a, b),
        _ => return Err(BotError::integrity(symbol, "missing or invalid ask/bid median")),
    };
    Ok(Observation::from_quote(
        symbol,
        ts,
        ask,
        bid,
        rec.ask_volume.filter(|v| v.is_finite()).unwrap_or(0.0),
        rec.bid_volume.filter(|v| v.is_finite()).unwrap_or(0.0),
    ))
}

/// Converts a batch, skipping (and counting) rows that cannot be used.
pub fn convert(records: &[HistoricalRecord]) -> (Vec<Observation>, usize) {
    let mut faults = 0;
    let obs = records
        .iter()
        .filter_map(|r| match to_observation(r) {
            Ok(o) => Some(o),
            Err(e) => {
                faults += 1;
                debug!(%e, "record skipped");
                None
            }
        })
        .collect();
    if faults > 0 {
        DATA_FAULTS.inc_by(faults as u64);
    }
    (obs, faults)
}

async fn fetch(api: &SharedApi, days_back: u32, ticker: Option<&str>, limit: Duration)
    -> Result<Vec<HistoricalRecord>, ApiError>
{
    match timeout(limit, api.fetch_historical(days_back, ticker)).await {
        Ok(res) => res,
        Err(_) => Err(ApiError::Timeout(limit.as_millis() as u64)),
    }
}

fn publish_cache_gauges(cache: &MarketDataCache) {
    let snap = cache.snapshot();
    CACHE_OBS_ROWS.set(snap.observations.len() as i64);
    CACHE_DAILY_ROWS.set(snap.daily.len() as i64);
    CACHE_VERSION.set(snap.version as i64);
}

/// Loads the startup history. The cache must hold at least one observation afterwards.
pub async fn initialize(api: &SharedApi, cache: &MarketDataCache, cfg: &UpdaterCfg) -> Result<(), BotError> {
    let loaded = cfg
        .init_retry
        .run("initial history", |attempt| async move {
            debug!(attempt, days_back = cfg.init_days_back, "loading history");
            let records = fetch(api, cfg.init_days_back, None, cfg.fetch_timeout).await?;
            let (obs, faults) = convert(&records);
            if obs.is_empty() {
                return Err(BotError::TransientFetch(ApiError::Decode(format!(
                    "history returned no usable rows ({} raw, {faults} skipped)",
                    records.len()
                ))));
            }
            Ok(obs)
        })
        .await;

    let obs = match loaded {
        Ok(obs) => obs,
        Err(e) => {
            FETCHES.with_label_values(&["failed"]).inc();
            return Err(BotError::FatalInitialization(format!("no market data after startup retries: {e}")));
        }
    };

    match cache.append(obs).await {
        Ok(res) => {
            FETCHES.with_label_values(&["ok"]).inc();
            publish_cache_gauges(cache);
            let snap = cache.snapshot();
            info!(
                observations = snap.observations.len(),
                daily_bars = snap.daily.len(),
                symbols = snap.symbols().len(),
                version = res.version,
                "market data initialized"
            );
            Ok(())
        }
        Err(AppendError::EmptyInput) => Err(BotError::FatalInitialization("history was empty".into())),
    }
}

/// One polling step. Returns the number of observations handed to the cache.
pub async fn tick(api: &SharedApi, cache: &MarketDataCache, cfg: &UpdaterCfg) -> Result<usize, BotError> {
    let records = fetch(api, cfg.days_back, cfg.ticker.as_deref(), cfg.fetch_timeout).await?;
    let (obs, _) = convert(&records);
    let n = obs.len();
    match cache.append(obs).await {
        Ok(res) => {
            FETCHES.with_label_values(&["ok"]).inc();
            publish_cache_gauges(cache);
            debug!(inserted = res.inserted, daily_added = res.daily_added, version = res.version, "cache updated");
            Ok(n)
        }
        Err(AppendError::EmptyInput) => {
            FETCHES.with_label_values(&["empty"]).inc();
            debug!(raw = records.len(), "fetch produced no observations");
            Ok(0)
        }
    }
}

pub async fn run(api: SharedApi, cache: MarketDataCache, cfg: UpdaterCfg, shutdown: Shutdown) {
    info!(
        days_back = cfg.days_back,
        ticker = cfg.ticker.as_deref().unwrap_or("*"),
        interval_ms = cfg.interval.as_millis() as u64,
        "updater: started"
    );
    let mut consecutive_failures: u32 = 0;
    while !shutdown.is_triggered() {
        match tick(&api, &cache, &cfg).await {
            Ok(_) => consecutive_failures = 0,
            Err(e) => {
                FETCHES.with_label_values(&["failed"]).inc();
                consecutive_failures += 1;
                if consecutive_failures % 10 == 0 {
                    error!(%e, consecutive_failures, "updater: market data keeps failing");
                } else {
                    warn!(%e, "updater: fetch failed, retrying next tick");
                }
            }
        }
        if shutdown.sleep(cfg.interval).await {
            break;
        }
    }
    info!("updater: stopped");
}

/// Runs the poll loop as a child task and respawns it after a panic or an early
/// return. Returns once shutdown is triggered and the child has stopped.
pub async fn supervise(api: SharedApi, cache: MarketDataCache, cfg: UpdaterCfg, shutdown: Shutdown) {
    loop {
        let child = tokio::spawn(run(api.clone(), cache.clone(), cfg.clone(), shutdown.clone()));
        match child.await {
            Ok(()) if shutdown.is_triggered() => return,
            Ok(()) => error!("updater: poll loop returned before shutdown"),
            Err(e) => error!(%e, "updater: poll loop crashed"),
        }
        UPDATER_RESTARTS.inc();
        if shutdown.sleep(cfg.interval).await {
            return;
        }
        warn!("updater: restarting poll loop");
    }
}
