// ===============================
// src/gateway.rs
// ===============================
//
// Order/portfolio gateway seam.
//
// - MarketApi  : what every task needs from the market (history, quotes,
//                orders, account). Calls may be slow, empty or fail.
// - PaperVenue : in-process simulated market used for VENUE_MODE=mock.
//                Random-walk hourly quotes (07:00..15:00 UTC), fills after a
//                short delay at the current mid, tracks cash and holdings.
//
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use rand::Rng;
use tokio::time::{sleep, Duration};

use crate::domain::{HistoricalRecord, OrderFill, OrderStatus, Quote};
use crate::error::ApiError;
use crate::metrics::EXECS;

#[async_trait]
pub trait MarketApi: Send + Sync {
    /// Rows for the last `days_back` days; `None` means every ticker.
    async fn fetch_historical(&self, days_back: u32, ticker: Option<&str>)
        -> Result<Vec<HistoricalRecord>, ApiError>;
    async fn current_price(&self, ticker: &str) -> Result<Quote, ApiError>;
    async fn buy(&self, ticker: &str, qty: u64) -> Result<OrderFill, ApiError>;
    async fn sell(&self, ticker: &str, qty: u64) -> Result<OrderFill, ApiError>;
    async fn portfolio(&self) -> Result<HashMap<String, i64>, ApiError>;
    async fn balance(&self) -> Result<f64, ApiError>;
}

pub type SharedApi = Arc<dyn MarketApi>;

const OPEN_HOUR: u32 = 7;
const CLOSE_HOUR: u32 = 15;
const HISTORY_CAP_DAYS: i64 = 400;

#[derive(Debug, Clone)]
struct PaperTick {
    ts: DateTime<Utc>,
    symbol: String,
    mid: f64,
    ask_volume: f64,
    bid_volume: f64,
}

struct PaperState {
    clock: DateTime<Utc>,
    last_mid: HashMap<String, f64>,
    history: VecDeque<PaperTick>,
    cash: f64,
    holdings: HashMap<String, i64>,
}

impl PaperState {
    fn next_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
        let t = ts + ChronoDuration::hours(1);
        if t.hour() > CLOSE_HOUR || t.hour() < OPEN_HOUR {
            let next_day = if t.hour() > CLOSE_HOUR { t.date_naive().succ_opt() } else { Some(t.date_naive()) };
            match next_day.and_then(|d| d.and_hms_opt(OPEN_HOUR, 0, 0)) {
                Some(nd) => nd.and_utc(),
                None => t,
            }
        } else {
            t
        }
    }

    /// One hourly step of the random walk for every symbol.
    fn step(&mut self) {
        self.clock = Self::next_hour(self.clock);
        // ThreadRng is not Send; keep it inside this sync section
        let mut rng = rand::thread_rng();
        let mut symbols: Vec<String> = self.last_mid.keys().cloned().collect();
        symbols.sort();
        for sym in symbols {
            let prev = self.last_mid.get(&sym).copied().unwrap_or(100.0);
            let mid = (prev * (1.0 + rng.gen_range(-0.01..=0.01))).max(1.0);
            self.last_mid.insert(sym.clone(), mid);
            self.history.push_back(PaperTick {
                ts: self.clock,
                symbol: sym,
                mid,
                ask_volume: rng.gen_range(100.0..1000.0f64).round(),
                bid_volume: rng.gen_range(100.0..1000.0f64).round(),
            });
        }
        let horizon = self.clock - ChronoDuration::days(HISTORY_CAP_DAYS);
        while self.history.front().is_some_and(|t| t.ts < horizon) {
            self.history.pop_front();
        }
    }
}

pub struct PaperVenue {
    state: Mutex<PaperState>,
    fill_ms: u64,
    spread: f64,
}

impl PaperVenue {
    /// A venue with `seed_days` of hourly history ending at `start`.
    pub fn new(symbols: &[String], cash: f64, seed_days: u32, start: DateTime<Utc>, fill_ms: u64) -> Self {
        let begin = start - ChronoDuration::days(seed_days as i64);
        let mut st = PaperState {
            clock: begin,
            last_mid: symbols.iter().map(|s| (s.clone(), 100.0)).collect(),
            history: VecDeque::new(),
            cash,
            holdings: HashMap::new(),
        };
        while st.clock < start {
            st.step();
        }
        Self { state: Mutex::new(st), fill_ms, spread: 0.02 }
    }

    fn lock(&self) -> MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn fill(&self, ticker: &str, qty: u64, buy: bool) -> OrderFill {
        let mut st = self.lock();
        let Some(mid) = st.last_mid.get(ticker).copied() else {
            return OrderFill { status: OrderStatus::Failed, price: None };
        };
        let qty_i = qty as i64;
        let held = st.holdings.get(ticker).copied().unwrap_or(0);
        if buy {
            let px = mid + self.spread / 2.0;
            if qty == 0 || st.cash < px * qty as f64 {
                return OrderFill { status: OrderStatus::Failed, price: None };
            }
            st.cash -= px * qty as f64;
            st.holdings.insert(ticker.to_string(), held + qty_i);
            OrderFill { status: OrderStatus::Completed, price: Some(px) }
        } else {
            let px = mid - self.spread / 2.0;
            if qty == 0 || held < qty_i {
                return OrderFill { status: OrderStatus::Failed, price: None };
            }
            st.cash += px * qty as f64;
            st.holdings.insert(ticker.to_string(), held - qty_i);
            OrderFill { status: OrderStatus::Completed, price: Some(px) }
        }
    }
}

#[async_trait]
impl MarketApi for PaperVenue {
    async fn fetch_historical(&self, days_back: u32, ticker: Option<&str>)
        -> Result<Vec<HistoricalRecord>, ApiError>
    {
        let mut st = self.lock();
        st.step();
        let since = st.clock - ChronoDuration::days(days_back as i64);
        Ok(st
            .history
            .iter()
            .filter(|t| t.ts >= since && ticker.map_or(true, |x| x == t.symbol))
            .map(|t| HistoricalRecord {
                gmt_time: Some(t.ts.to_rfc3339()),
                symbol: Some(t.symbol.clone()),
                ask_median: Some(t.mid + self.spread / 2.0),
                bid_median: Some(t.mid - self.spread / 2.0),
                ask_volume: Some(t.ask_volume),
                bid_volume: Some(t.bid_volume),
            })
            .collect())
    }

    async fn current_price(&self, ticker: &str) -> Result<Quote, ApiError> {
        let st = self.lock();
        st.last_mid
            .get(ticker)
            .map(|mid| Quote {
                symbol: ticker.to_string(),
                ask_median: mid + self.spread / 2.0,
                bid_median: mid - self.spread / 2.0,
            })
            .ok_or_else(|| ApiError::Status { status: 404, body: format!("unknown ticker {ticker}") })
    }

    async fn buy(&self, ticker: &str, qty: u64) -> Result<OrderFill, ApiError> {
        sleep(Duration::from_millis(self.fill_ms)).await;
        let fill = self.fill(ticker, qty, true);
        EXECS.with_label_values(&[fill.status.as_str(), "paper"]).inc();
        Ok(fill)
    }

    async fn sell(&self, ticker: &str, qty: u64) -> Result<OrderFill, ApiError> {
        sleep(Duration::from_millis(self.fill_ms)).await;
        let fill = self.fill(ticker, qty, false);
        EXECS.with_label_values(&[fill.status.as_str(), "paper"]).inc();
        Ok(fill)
    }

    async fn portfolio(&self) -> Result<HashMap<String, i64>, ApiError> {
        Ok(self.lock().holdings.clone())
    }

    async fn balance(&self) -> Result<f64, ApiError> {
        Ok(self.lock().cash)
    }
}
