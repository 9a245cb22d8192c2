// ===============================
// src/main.rs
// ===============================
/*
 # active configuration
 curl -s localhost:9898/metrics | egrep '^config_(venue_mode|strategy_active)'

 # per-strategy cash / performance
 curl -s localhost:9898/metrics | egrep '^strategy_(cash|open_value|performance_pct)'

 # market data health
 curl -s localhost:9898/metrics | egrep '^(md_fetches_total|cache_)'
*/
/*
=============================================================================
Project : linc_bot, multi-strategy trading client for the LINC market API
Module  : main.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Polls LINC market data into a shared rolling-window cache, runs
          divergence, Markowitz and index-RSI strategies on their own capital
          slices, liquidates on shutdown, exposes Prometheus metrics, and
          records JSONL events.
=============================================================================
*/
mod cache;
mod config;
mod domain;
mod error;
mod gateway;          // MarketApi seam + paper venue
mod gateway_linc;     // LINC REST client
mod indicators;
mod liquidation;
mod metrics;
mod optimizer;
mod positions;
mod recorder;
mod retry;
mod risk;
mod runner;
mod shutdown;
mod strategy;
mod updater;

use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use futures_util::future::join_all;
use tokio::{sync::mpsc, task::JoinHandle, time::Duration};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::cache::MarketDataCache;
use crate::config::{Args, Cli, StrategyMode, VenueMode};
use crate::domain::Event;
use crate::error::{ApiError, BotError};
use crate::gateway::{PaperVenue, SharedApi};
use crate::gateway_linc::LincClient;
use crate::positions::StrategyState;
use crate::runner::{Strategy, StrategyRunner};
use crate::shutdown::Shutdown;
use crate::strategy::{DivergenceStrategy, IndexRsiStrategy, MarkowitzStrategy};

const HEARTBEAT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // ---- Logging ----
    let filter = match cli.log.as_deref() {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // ---- Config ----
    let args = match config::load(cli.env_file.as_ref()) {
        Ok(args) => args,
        Err(e) => {
            error!(%e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(%e, "fatal, exiting");
            ExitCode::FAILURE
        }
    }
}

fn build_api(args: &Args) -> Result<SharedApi, BotError> {
    match args.venue_mode {
        VenueMode::Mock => Ok(Arc::new(PaperVenue::new(
            &args.paper_symbols,
            args.paper_cash,
            args.updater.init_days_back,
            Utc::now(),
            args.paper_fill_ms,
        ))),
        VenueMode::Linc => {
            let base = args
                .base_url
                .as_deref()
                .ok_or_else(|| BotError::FatalInitialization("LINC_BASE_URL is not set".into()))?;
            let key = args.api_key.clone().unwrap_or_default();
            let client = LincClient::new(base, key, args.request_timeout)
                .map_err(|e| BotError::FatalInitialization(e.to_string()))?;
            Ok(Arc::new(client))
        }
    }
}

async fn starting_balance(api: &SharedApi, args: &Args) -> Result<f64, BotError> {
    if let Some(capital) = args.starting_capital {
        info!(capital, "starting capital from STARTING_CAPITAL");
        return Ok(capital);
    }
    let balance = args
        .updater
        .init_retry
        .run("balance query", |_| async { api.balance().await })
        .await
        .map_err(|e: ApiError| BotError::FatalInitialization(format!("balance unavailable: {e}")))?;
    if !(balance.is_finite() && balance > 0.0) {
        return Err(BotError::FatalInitialization(format!("account balance is {balance}")));
    }
    Ok(balance)
}

fn spawn_runner<S: Strategy + 'static>(
    strategy: S,
    api: &SharedApi,
    cache: &MarketDataCache,
    capital: f64,
    args: &Args,
    mode: &StrategyMode,
    journal: Option<&mpsc::Sender<Event>>,
    shutdown: &Shutdown,
) -> JoinHandle<StrategyState> {
    let mut runner = StrategyRunner::new(strategy, api.clone(), cache.clone(), capital, args.runner_cfg(mode));
    if let Some(tx) = journal {
        runner = runner.with_journal(tx.clone());
    }
    tokio::spawn(runner.run(shutdown.clone()))
}

async fn run(args: Args) -> Result<(), BotError> {
    // ---- Metrics ----
    metrics::init();
    metrics::serve_metrics(args.metrics_port);

    let strategy_names: Vec<&'static str> = args.strategy_modes.iter().map(StrategyMode::as_str).collect();
    info!(
        venue_mode = %args.venue_mode.as_str(),
        strategies = ?strategy_names,
        update_interval_ms = args.updater.interval.as_millis() as u64,
        retain_days = args.retention.max_days,
        record_file = args.record_file.as_deref().unwrap_or("-"),
        "startup config"
    );
    metrics::CONFIG_VENUE_MODE.with_label_values(&[args.venue_mode.as_str()]).set(1);
    for m in &args.strategy_modes {
        let pct = (args.allocations.for_mode(m) * 100.0).round() as i64;
        metrics::CONFIG_STRATEGY_ACTIVE.with_label_values(&[m.as_str()]).set(pct);
    }

    // ---- Venue, capital, initial history ----
    let api = build_api(&args)?;
    let balance = starting_balance(&api, &args).await?;
    info!(balance, "account balance");

    let cache = MarketDataCache::new(args.retention.clone());
    updater::initialize(&api, &cache, &args.updater).await?;

    // ---- Shutdown on Ctrl-C ----
    let shutdown = Shutdown::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    if shutdown.trigger() {
                        info!("ctrl-c received, shutting down");
                    }
                }
                Err(e) => warn!(%e, "ctrl-c handler unavailable"),
            }
        }
    });

    // ---- Recorder (optional) ----
    let mut journal: Option<mpsc::Sender<Event>> = None;
    let mut recorder_task = None;
    if let Some(path) = args.record_file.clone() {
        let (rec_tx, rec_rx) = mpsc::channel::<Event>(8192);
        let _ = rec_tx.try_send(Event::Note(format!("started with balance {balance:.2}")));
        recorder_task = Some(tokio::spawn(recorder::run(rec_rx, path)));
        journal = Some(rec_tx);
    }

    // ---- Updater ----
    let updater_task = tokio::spawn(updater::supervise(api.clone(), cache.clone(), args.updater.clone(), shutdown.clone()));

    // ---- Strategies ----
    // Each strategy trades its own slice of the starting balance.
    let mut strategies: Vec<(&'static str, JoinHandle<StrategyState>)> = Vec::new();
    for mode in &args.strategy_modes {
        let capital = balance * args.allocations.for_mode(mode);
        if capital <= 0.0 {
            warn!(strategy = mode.as_str(), "no capital allocated, not started");
            continue;
        }
        let journal = journal.as_ref();
        let handle = match mode {
            StrategyMode::Divergence => spawn_runner(
                DivergenceStrategy::new(args.divergence.clone()),
                &api, &cache, capital, &args, mode, journal, &shutdown,
            ),
            StrategyMode::Markowitz => spawn_runner(
                MarkowitzStrategy::new(args.markowitz.clone()),
                &api, &cache, capital, &args, mode, journal, &shutdown,
            ),
            StrategyMode::IndexRsi => spawn_runner(
                IndexRsiStrategy::new(args.index_rsi.clone()),
                &api, &cache, capital, &args, mode, journal, &shutdown,
            ),
        };
        strategies.push((mode.as_str(), handle));
    }

    // ---- Heartbeat ----
    loop {
        let snap = cache.snapshot();
        info!(
            version = snap.version,
            observations = snap.observations.len(),
            daily_bars = snap.daily.len(),
            latest = %snap.latest_timestamp().map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into()),
            "heartbeat"
        );
        if shutdown.sleep(HEARTBEAT).await {
            break;
        }
    }

    // ---- Drain: strategies, updater, then liquidation ----
    let (names, handles): (Vec<&'static str>, Vec<_>) = strategies.into_iter().unzip();
    for (name, joined) in names.into_iter().zip(join_all(handles).await) {
        match joined {
            Ok(state) => info!(
                strategy = name,
                cash = %format!("{:.2}", state.cash),
                open_value = %format!("{:.2}", state.open_value),
                realized_pnl = %format!("{:.2}", state.realized_pnl),
                perf_pct = %format!("{:.2}", state.performance()),
                "final performance"
            ),
            Err(e) => error!(strategy = name, %e, "strategy task ended abnormally"),
        }
    }
    if let Err(e) = updater_task.await {
        error!(%e, "updater task ended abnormally");
    }

    let report = liquidation::liquidate(&api, &args.liquidation_cfg()).await;
    if let Some(tx) = journal.take() {
        let _ = tx
            .send(Event::Note(format!("liquidated {} holdings, kept {:?}", report.sold.len(), report.skipped)))
            .await;
    }
    if let Some(task) = recorder_task {
        let _ = task.await;
    }
    info!("shutdown complete");
    Ok(())
}
