// ===============================
// src/strategy.rs
// ===============================
//
// Three strategies, all plain `runner::Strategy` implementations:
// 1) Divergence/momentum         -> DivergenceStrategy
// 2) Markowitz mean-variance      -> MarkowitzStrategy
// 3) Opportunistic index RSI      -> IndexRsiStrategy
//
// Each one only reads the snapshot it is handed and the strategy's own state;
// orders, sizing and bookkeeping belong to the runner.
//
// Time inside a strategy is market time: the newest observation timestamp of
// the snapshot, not the wall clock.
//
use std::collections::BTreeMap;

use ahash::AHashMap as HashMap;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use ndarray::Array2;

use crate::cache::MarketSnapshot;
use crate::domain::{DailyBar, Observation};
use crate::error::BotError;
use crate::indicators::{market_breadth, Indicator, IndicatorFrame};
use crate::optimizer::{mean_and_cov, MeanVariance};
use crate::positions::StrategyState;
use crate::risk::{AllocationMode, AllocationRule};
use crate::runner::{Entry, Evaluation, Exit, ExitReason, Strategy};

fn market_now(snap: &MarketSnapshot) -> DateTime<Utc> {
    snap.latest_timestamp().unwrap_or_else(Utc::now)
}

// -----------------------------------------------------------------------------
// 1) DIVERGENCE / MOMENTUM
//    Idea: a bullish RSI divergence on the intraday series inside a daily uptrend.
//    Buy when, over the lookback slice of the symbol's recent rows:
//      - the lowest RSI dipped below the threshold,
//      - the current RSI is back above that low,
//      - the current price is still below the slice's lowest price,
//      - the last daily close is above its daily moving average,
//      - (optional) market breadth is at or above its threshold.
//    Exit:
//      - stop-loss when price < entry x (1 - k x std / close),
//      - otherwise once the holding period has elapsed.
//    Daily MA and STD are computed on closes, not opening prices.
//    Exits read the held symbol's own newest daily bar, which may be older
//    than the latest daily date; entries require a bar on that date.
//    A closed symbol is not bought again during the cool-down period.
// -----------------------------------------------------------------------------
#[derive(Debug, Clone)]
pub struct BreadthGate {
    pub short: usize,
    pub long: usize,
    pub threshold: f64,
}

#[derive(Debug, Clone)]
pub struct DivergenceParams {
    pub rsi_period: usize,
    pub ma_period: usize,
    pub std_period: usize,
    pub rsi_threshold: f64,
    /// Rows counted back from the newest one: the slice is [-start, -end).
    pub lookback_start: usize,
    pub lookback_end: usize,
    pub stop_k: f64,
    pub holding_period: Duration,
    pub cooldown: Duration,
    pub breadth: Option<BreadthGate>,
    pub allocation: AllocationRule,
}

impl Default for DivergenceParams {
    fn default() -> Self {
        Self {
            rsi_period: 17,
            ma_period: 63,
            std_period: 63,
            rsi_threshold: 30.0,
            lookback_start: 30,
            lookback_end: 5,
            stop_k: 1.5,
            holding_period: Duration::days(63),
            cooldown: Duration::days(168),
            breadth: None,
            allocation: AllocationRule { mode: AllocationMode::Equal, spend_limit: 0.9, min_fraction: 0.01 },
        }
    }
}

pub struct DivergenceStrategy {
    p: DivergenceParams,
}

/// Daily trend inputs of one symbol, taken from one of its daily bars.
struct DailyView {
    close: f64,
    ma: f64,
    std: f64,
}

impl DivergenceStrategy {
    pub fn new(p: DivergenceParams) -> Self { Self { p } }

    fn daily_view(&self, frame: &IndicatorFrame<'_, DailyBar>, symbol: &str, latest: Option<NaiveDate>)
        -> Result<DailyView, BotError>
    {
        let row = frame.latest(symbol).ok_or_else(|| BotError::integrity(symbol, "no daily bars"))?;
        if latest.is_some_and(|d| row.record.date != d) {
            return Err(BotError::integrity(symbol, "missing from the latest daily bar"));
        }
        let ma = row.get(Indicator::MovingAverage(self.p.ma_period));
        let std = row.get(Indicator::MovingStd(self.p.std_period));
        match (ma, std) {
            (Some(ma), Some(std)) if row.record.close > 0.0 => Ok(DailyView { close: row.record.close, ma, std }),
            _ => Err(BotError::integrity(symbol, "daily indicators not available")),
        }
    }

    /// (lowest price, lowest RSI) over the lookback slice; None when the slice is empty.
    fn lookback_lows(&self, frame: &IndicatorFrame<'_, Observation>, symbol: &str) -> Option<(f64, f64)> {
        let rows = frame.rows_for(symbol);
        let n = rows.len();
        let start = n.saturating_sub(self.p.lookback_start);
        let end = n.saturating_sub(self.p.lookback_end);
        let slice = rows.get(start..end).filter(|s| !s.is_empty())?;
        let rsi = Indicator::Rsi(self.p.rsi_period);
        let low_px = slice.iter().map(|r| r.price()).fold(f64::INFINITY, f64::min);
        let low_rsi = slice.iter().filter_map(|r| r.get(rsi)).fold(f64::INFINITY, f64::min);
        low_rsi.is_finite().then_some((low_px, low_rsi))
    }
}

impl Strategy for DivergenceStrategy {
    fn name(&self) -> &str { "divergence" }
    fn allocation(&self) -> &AllocationRule { &self.p.allocation }
    fn cooldown(&self) -> Duration { self.p.cooldown }

    fn evaluate(&mut self, snap: &MarketSnapshot, state: &StrategyState) -> Evaluation {
        let mut ev = Evaluation::idle(market_now(snap));
        let now = ev.now;
        let rsi = Indicator::Rsi(self.p.rsi_period);
        let intraday = IndicatorFrame::new(&snap.observations).with(rsi);
        let daily = IndicatorFrame::new(&snap.daily)
            .with(Indicator::MovingAverage(self.p.ma_period))
            .with(Indicator::MovingStd(self.p.std_period));
        let latest_date = snap.latest_daily_date();

        let regime_ok = match &self.p.breadth {
            Some(g) => market_breadth(&snap.daily, g.short, g.long).is_some_and(|b| b >= g.threshold),
            None => true,
        };

        for symbol in intraday.symbols() {
            let Some(latest) = intraday.latest(symbol) else { continue };
            let price = latest.price();

            if let Some(pos) = state.positions.get(symbol) {
                // no usable daily bar: no stop level, the holding period still applies
                let stop = match self.daily_view(&daily, symbol, None) {
                    Ok(d) => pos.entry_price * (1.0 - self.p.stop_k * d.std / d.close),
                    Err(e) => {
                        ev.faults.push(e);
                        f64::NEG_INFINITY
                    }
                };
                if price < stop {
                    ev.exits.push(Exit { symbol: symbol.to_string(), reason: ExitReason::StopLoss });
                } else if state.holding_expired(symbol, now, self.p.holding_period) {
                    ev.exits.push(Exit { symbol: symbol.to_string(), reason: ExitReason::HoldingPeriod });
                }
                continue;
            }

            if !regime_ok || state.cash <= 0.0 || state.in_cooldown(symbol, now, self.p.cooldown) {
                continue;
            }
            let d = match self.daily_view(&daily, symbol, latest_date) {
                Ok(d) => d,
                Err(e) => {
                    ev.faults.push(e);
                    continue;
                }
            };
            let Some(current_rsi) = latest.get(rsi) else {
                ev.faults.push(BotError::integrity(symbol, "no intraday RSI"));
                continue;
            };
            let Some((low_px, low_rsi)) = self.lookback_lows(&intraday, symbol) else { continue };

            if low_rsi < self.p.rsi_threshold && current_rsi > low_rsi && price < low_px && d.close > d.ma {
                ev.entries.push(Entry { symbol: symbol.to_string(), price, weight: 1.0 / (d.std + 1e-6) });
            }
        }
        ev
    }
}

// -----------------------------------------------------------------------------
// 2) MARKOWITZ (periodic full rebalance)
//    Idea: every cycle close everything, then re-enter with long-only
//    mean-variance weights estimated from daily log returns of closes.
//    Returns only use dates on which every symbol has a bar, over the last
//    `lookback_days` daily dates.
//    Returns use daily closes, not opening prices: the close is the last
//    observed mid of a completed day.
// -----------------------------------------------------------------------------
#[derive(Debug, Clone)]
pub struct MarkowitzParams {
    pub lookback_days: usize,
    pub optimizer: MeanVariance,
    /// Weights below this are not bought.
    pub min_weight: f64,
    pub allocation: AllocationRule,
}

impl Default for MarkowitzParams {
    fn default() -> Self {
        Self {
            lookback_days: 252,
            optimizer: MeanVariance::default(),
            min_weight: 1e-4,
            allocation: AllocationRule { mode: AllocationMode::Weighted, spend_limit: 0.98, min_fraction: 0.0 },
        }
    }
}

pub struct MarkowitzStrategy {
    p: MarkowitzParams,
}

impl MarkowitzStrategy {
    pub fn new(p: MarkowitzParams) -> Self { Self { p } }

    /// Symbols (sorted) and a dates x symbols matrix of log returns.
    fn common_returns(&self, daily: &[DailyBar]) -> (Vec<String>, Array2<f64>) {
        let mut by_date: BTreeMap<NaiveDate, HashMap<&str, f64>> = BTreeMap::new();
        for b in daily {
            by_date.entry(b.date).or_default().insert(b.symbol.as_str(), b.close);
        }
        let mut symbols: Vec<&str> = daily.iter().map(|b| b.symbol.as_str()).collect();
        symbols.sort_unstable();
        symbols.dedup();

        let skip = by_date.len().saturating_sub(self.p.lookback_days);
        let closes: Vec<Vec<f64>> = by_date
            .values()
            .skip(skip)
            .filter_map(|row| symbols.iter().map(|s| row.get(s).copied().filter(|c| *c > 0.0)).collect())
            .collect();
        let flat: Vec<f64> = closes
            .windows(2)
            .flat_map(|w| w[1].iter().zip(&w[0]).map(|(now, prev)| (now / prev).ln()).collect::<Vec<_>>())
            .collect();
        let rows = closes.len().saturating_sub(1);
        let returns = Array2::from_shape_vec((rows, symbols.len()), flat)
            .unwrap_or_else(|_| Array2::zeros((0, symbols.len())));
        (symbols.into_iter().map(String::from).collect(), returns)
    }
}

impl Strategy for MarkowitzStrategy {
    fn name(&self) -> &str { "markowitz" }
    fn allocation(&self) -> &AllocationRule { &self.p.allocation }

    fn evaluate(&mut self, snap: &MarketSnapshot, state: &StrategyState) -> Evaluation {
        let mut ev = Evaluation::idle(market_now(snap));
        let mut held: Vec<&String> = state.positions.keys().collect();
        held.sort();
        ev.exits = held
            .into_iter()
            .map(|s| Exit { symbol: s.clone(), reason: ExitReason::Rebalance })
            .collect();

        let (symbols, returns) = self.common_returns(&snap.daily);
        let Some((mu, cov)) = mean_and_cov(&returns) else {
            ev.faults.push(BotError::integrity("*", format!("only {} common daily returns", returns.nrows())));
            return ev;
        };
        let weights = self.p.optimizer.optimize(&mu, &cov);
        for (symbol, &w) in symbols.iter().zip(weights.iter()) {
            if w < self.p.min_weight {
                continue;
            }
            match snap.latest_price(symbol) {
                Some(price) => ev.entries.push(Entry { symbol: symbol.clone(), price, weight: w }),
                None => ev.faults.push(BotError::integrity(symbol.as_str(), "no intraday price")),
            }
        }
        ev
    }
}

// -----------------------------------------------------------------------------
// 3) OPPORTUNISTIC INDEX RSI
//    Idea: when the index is oversold on the daily chart, buy a slice of it.
//    - daily RSI(period) of the index symbol on the latest daily date
//    - below threshold -> buy 1/buys of current cash (the allocation rule),
//      so each slice shrinks as cash is spent instead of being a fixed share
//      of the starting capital
//    - at most one buy per completed daily bar, never sold by the strategy
// -----------------------------------------------------------------------------
#[derive(Debug, Clone)]
pub struct IndexRsiParams {
    pub symbol: String,
    pub rsi_period: usize,
    pub threshold: f64,
    pub buys: u32,
}

impl Default for IndexRsiParams {
    fn default() -> Self {
        Self { symbol: "INDEX1".into(), rsi_period: 21, threshold: 25.0, buys: 2 }
    }
}

pub struct IndexRsiStrategy {
    p: IndexRsiParams,
    rule: AllocationRule,
}

impl IndexRsiStrategy {
    pub fn new(p: IndexRsiParams) -> Self {
        let rule = AllocationRule {
            mode: AllocationMode::Equal,
            spend_limit: 1.0 / p.buys.max(1) as f64,
            min_fraction: 0.0,
        };
        Self { p, rule }
    }
}

impl Strategy for IndexRsiStrategy {
    fn name(&self) -> &str { "index_rsi" }
    fn allocation(&self) -> &AllocationRule { &self.rule }

    fn evaluate(&mut self, snap: &MarketSnapshot, state: &StrategyState) -> Evaluation {
        let mut ev = Evaluation::idle(market_now(snap));
        let sym = self.p.symbol.as_str();
        let rsi = Indicator::Rsi(self.p.rsi_period);
        let frame = IndicatorFrame::new(&snap.daily).with(rsi);
        let latest_date = snap.latest_daily_date();

        let Some(row) = frame.latest(sym).filter(|r| Some(r.record.date) == latest_date) else {
            if !snap.daily.is_empty() {
                ev.faults.push(BotError::integrity(sym, "missing from the latest daily bar"));
            }
            return ev;
        };
        let Some(value) = row.get(rsi) else { return ev };
        let bought_since_bar = state
            .last_trade
            .get(sym)
            .is_some_and(|t| Some(t.date_naive()) > latest_date);
        if value < self.p.threshold && !bought_since_bar {
            let price = snap.latest_price(sym).unwrap_or(row.record.close);
            ev.entries.push(Entry { symbol: sym.to_string(), price, weight: 1.0 });
        }
        ev
    }
}
