// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, GaugeVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use tracing::{debug, error, info, warn};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::new(name, help).unwrap_or_else(|e| panic!("metric {name}: {e}"))
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    IntCounterVec::new(Opts::new(name, help), labels).unwrap_or_else(|e| panic!("metric {name}: {e}"))
}

fn gauge(name: &str, help: &str) -> IntGauge {
    IntGauge::new(name, help).unwrap_or_else(|e| panic!("metric {name}: {e}"))
}

fn gauge_vec(name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    GaugeVec::new(Opts::new(name, help), labels).unwrap_or_else(|e| panic!("metric {name}: {e}"))
}

fn int_gauge_vec(name: &str, help: &str, labels: &[&str]) -> IntGaugeVec {
    IntGaugeVec::new(Opts::new(name, help), labels).unwrap_or_else(|e| panic!("metric {name}: {e}"))
}

// -------- Market data --------
pub static FETCHES: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("md_fetches_total", "history fetches by result (ok/empty/failed)", &["result"]));

pub static DATA_FAULTS: Lazy<IntCounter> =
    Lazy::new(|| counter("data_integrity_faults_total", "records or symbols skipped for missing fields"));

pub static CACHE_OBS_ROWS: Lazy<IntGauge> =
    Lazy::new(|| gauge("cache_observations", "observations held by the market data cache"));

pub static CACHE_DAILY_ROWS: Lazy<IntGauge> =
    Lazy::new(|| gauge("cache_daily_bars", "daily bars held by the market data cache"));

pub static CACHE_VERSION: Lazy<IntGauge> =
    Lazy::new(|| gauge("cache_version", "version of the last published snapshot"));

// -------- Orders --------
pub static EXECS: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("exec_reports_total", "execution reports", &["status", "venue"]));

pub static ORDERS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec("orders_total", "order results per strategy", &["strategy", "side", "status"])
});

pub static ALLOC_REJECTS: Lazy<IntCounter> =
    Lazy::new(|| counter("allocation_rejects_total", "buy candidates dropped by sizing"));

pub static LIQUIDATION_SELLS: Lazy<IntCounter> =
    Lazy::new(|| counter("liquidation_sells_total", "holdings sold during shutdown liquidation"));

pub static JOURNAL_DROPS: Lazy<IntCounter> =
    Lazy::new(|| counter("journal_drops_total", "journal lines dropped on a full channel"));

pub static UPDATER_RESTARTS: Lazy<IntCounter> =
    Lazy::new(|| counter("updater_restarts_total", "updater loops restarted after ending early"));

// -------- Strategies --------
pub static CYCLES: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("strategy_cycles_total", "completed strategy cycles", &["strategy"]));

pub static STRATEGY_CASH: Lazy<GaugeVec> =
    Lazy::new(|| gauge_vec("strategy_cash", "cash per strategy", &["strategy"]));

pub static STRATEGY_OPEN_VALUE: Lazy<GaugeVec> =
    Lazy::new(|| gauge_vec("strategy_open_value", "open positions at cost per strategy", &["strategy"]));

pub static STRATEGY_PERF: Lazy<GaugeVec> =
    Lazy::new(|| gauge_vec("strategy_performance_pct", "total value vs starting capital (%)", &["strategy"]));

// ---- Config visibility (venue / strategies) ----
pub static CONFIG_VENUE_MODE: Lazy<IntGaugeVec> =
    Lazy::new(|| int_gauge_vec("config_venue_mode", "venue mode (label: mode)", &["mode"]));

pub static CONFIG_STRATEGY_ACTIVE: Lazy<IntGaugeVec> = Lazy::new(|| {
    int_gauge_vec("config_strategy_active", "active strategies (label: strategy), value = allocation %", &["strategy"])
});

pub fn init() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(FETCHES.clone()),
        Box::new(DATA_FAULTS.clone()),
        Box::new(CACHE_OBS_ROWS.clone()),
        Box::new(CACHE_DAILY_ROWS.clone()),
        Box::new(CACHE_VERSION.clone()),
        Box::new(EXECS.clone()),
        Box::new(ORDERS.clone()),
        Box::new(ALLOC_REJECTS.clone()),
        Box::new(LIQUIDATION_SELLS.clone()),
        Box::new(JOURNAL_DROPS.clone()),
        Box::new(UPDATER_RESTARTS.clone()),
        Box::new(CYCLES.clone()),
        Box::new(STRATEGY_CASH.clone()),
        Box::new(STRATEGY_OPEN_VALUE.clone()),
        Box::new(STRATEGY_PERF.clone()),
        Box::new(CONFIG_VENUE_MODE.clone()),
        Box::new(CONFIG_STRATEGY_ACTIVE.clone()),
    ];
    for c in collectors {
        // double registration only happens when init() runs twice
        if let Err(e) = REGISTRY.register(c) {
            warn!(%e, "metric registration skipped");
        }
    }
}

fn encode_metrics() -> Vec<u8> {
    let mut buf = Vec::new();
    if TextEncoder::new().encode(&REGISTRY.gather(), &mut buf).is_err() || buf.is_empty() {
        buf = b"# no metrics\n".to_vec();
    }
    buf
}

/// Status and body for a request line such as `GET /metrics HTTP/1.1`.
/// `/healthz` answers with the cache version so a frozen feed is visible.
fn route(request_line: &str) -> (&'static str, Vec<u8>) {
    let mut parts = request_line.split_whitespace();
    match (parts.next(), parts.next().map(|p| p.split('?').next().unwrap_or(p))) {
        (Some("GET"), Some("/" | "/metrics")) => ("200 OK", encode_metrics()),
        (Some("GET"), Some("/healthz")) => ("200 OK", format!("ok cache_version={}\n", CACHE_VERSION.get()).into_bytes()),
        (Some("GET"), Some(_)) => ("404 Not Found", b"not found\n".to_vec()),
        _ => ("405 Method Not Allowed", b"GET only\n".to_vec()),
    }
}

fn handle_client(mut stream: TcpStream) {
    let mut req = [0u8; 1024];
    let n = stream.read(&mut req).unwrap_or(0);
    let head = String::from_utf8_lossy(&req[..n]);
    let (status, body) = route(head.lines().next().unwrap_or(""));
    let header = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    if let Err(e) = stream.write_all(header.as_bytes()).and_then(|_| stream.write_all(&body)) {
        debug!(%e, "metrics response not delivered");
    }
}

// Run the metrics server in a dedicated OS thread (keeps Tokio runtime clean).
// A port of 0 disables it.
pub fn serve_metrics(port: u16) {
    if port == 0 {
        info!("metrics disabled");
        return;
    }
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                error!(%e, %addr, "metrics bind failed, metrics not served");
                return;
            }
        };
        info!("metrics listening on http://{addr}/ (and /metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => warn!(%e, "metrics accept error"),
            }
        }
    });
}
