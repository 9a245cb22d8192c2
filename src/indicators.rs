// ===============================
// src/indicators.rs
// ===============================
//
// Pure indicator transforms over a symbol-grouped series.
//
// Every function reads a slice (rows of several symbols interleaved, already
// ordered by time) and returns one column aligned index-for-index with it.
// Windows are trailing and per symbol; warm-up uses whatever points exist,
// so there is no gap at the start of a symbol.
//
use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use ahash::AHashMap as HashMap;

use crate::domain::{DailyBar, Observation};

/// Anything that carries a symbol and one price per row.
pub trait PricePoint {
    fn symbol(&self) -> &str;
    fn price(&self) -> f64;
}

impl PricePoint for Observation {
    fn symbol(&self) -> &str { &self.symbol }
    fn price(&self) -> f64 { self.price }
}

/// Daily bars are measured on their close.
impl PricePoint for DailyBar {
    fn symbol(&self) -> &str { &self.symbol }
    fn price(&self) -> f64 { self.close }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Indicator {
    MovingAverage(usize),
    MovingStd(usize),
    Rsi(usize),
}

impl Indicator {
    pub fn period(&self) -> usize {
        match *self {
            Indicator::MovingAverage(p) | Indicator::MovingStd(p) | Indicator::Rsi(p) => p,
        }
    }
}

impl fmt::Display for Indicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Indicator::MovingAverage(p) => write!(f, "MA{p}"),
            Indicator::MovingStd(p) => write!(f, "STD{p}"),
            Indicator::Rsi(p) => write!(f, "RSI{p}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorColumn {
    pub indicator: Indicator,
    pub values: Vec<Option<f64>>,
}

fn mean(w: &VecDeque<f64>) -> Option<f64> {
    if w.is_empty() { None } else { Some(w.iter().sum::<f64>() / w.len() as f64) }
}

fn sample_std(w: &VecDeque<f64>) -> Option<f64> {
    if w.len() < 2 {
        return None;
    }
    let m = w.iter().sum::<f64>() / w.len() as f64;
    let ss: f64 = w.iter().map(|x| (x - m) * (x - m)).sum();
    Some((ss / (w.len() - 1) as f64).sqrt())
}

/// Trailing per-symbol window over `inputs` (one value per row of `series`).
fn per_symbol_window<T, F>(series: &[T], inputs: &[f64], period: usize, reduce: F) -> Vec<Option<f64>>
where
    T: PricePoint,
    F: Fn(&VecDeque<f64>) -> Option<f64>,
{
    if period == 0 {
        return vec![None; series.len()];
    }
    let mut windows: HashMap<&str, VecDeque<f64>> = HashMap::new();
    series
        .iter()
        .zip(inputs)
        .map(|(row, &x)| {
            let w = windows
                .entry(row.symbol())
                .or_insert_with(|| VecDeque::with_capacity(period));
            if w.len() == period {
                w.pop_front();
            }
            w.push_back(x);
            reduce(w)
        })
        .collect()
}

fn prices<T: PricePoint>(series: &[T]) -> Vec<f64> {
    series.iter().map(|r| r.price()).collect()
}

pub fn moving_average<T: PricePoint>(series: &[T], period: usize) -> IndicatorColumn {
    IndicatorColumn {
        indicator: Indicator::MovingAverage(period),
        values: per_symbol_window(series, &prices(series), period, mean),
    }
}

/// Sample standard deviation (n - 1). Windows holding one point have no value.
pub fn moving_std<T: PricePoint>(series: &[T], period: usize) -> IndicatorColumn {
    IndicatorColumn {
        indicator: Indicator::MovingStd(period),
        values: per_symbol_window(series, &prices(series), period, sample_std),
    }
}

/// RSI with simple trailing averages of gains and losses.
///
/// The first row of a symbol has no previous price; it enters both windows as
/// a zero gain and a zero loss, and its own RSI is 100. Whenever the average
/// loss is zero the RSI is 100.
pub fn rsi<T: PricePoint>(series: &[T], period: usize) -> IndicatorColumn {
    let mut prev: HashMap<&str, f64> = HashMap::new();
    let mut gains = Vec::with_capacity(series.len());
    let mut losses = Vec::with_capacity(series.len());
    for row in series {
        let px = row.price();
        let diff = prev.insert(row.symbol(), px).map(|p| px - p).unwrap_or(0.0);
        gains.push(if diff > 0.0 { diff } else { 0.0 });
        losses.push(if diff < 0.0 { -diff } else { 0.0 });
    }

    let avg_gain = per_symbol_window(series, &gains, period, mean);
    let avg_loss = per_symbol_window(series, &losses, period, mean);

    let values = avg_gain
        .into_iter()
        .zip(avg_loss)
        .map(|(g, l)| match (g, l) {
            (Some(g), Some(l)) if l > 0.0 => Some(100.0 - 100.0 / (1.0 + g / l)),
            (Some(_), Some(_)) => Some(100.0),
            _ => None,
        })
        .collect();

    IndicatorColumn { indicator: Indicator::Rsi(period), values }
}

pub fn compute<T: PricePoint>(series: &[T], indicator: Indicator) -> IndicatorColumn {
    match indicator {
        Indicator::MovingAverage(p) => moving_average(series, p),
        Indicator::MovingStd(p) => moving_std(series, p),
        Indicator::Rsi(p) => rsi(series, p),
    }
}

/// Per-symbol log return of consecutive prices; `None` on the first row of a symbol.
pub fn log_returns<T: PricePoint>(series: &[T]) -> Vec<Option<f64>> {
    let mut prev: HashMap<&str, f64> = HashMap::new();
    series
        .iter()
        .map(|row| {
            let px = row.price();
            prev.insert(row.symbol(), px)
                .filter(|p| *p > 0.0 && px > 0.0)
                .map(|p| (px / p).ln())
        })
        .collect()
}

/// Fraction of symbols whose latest short-window MA is above the long-window MA.
pub fn market_breadth<T: PricePoint>(series: &[T], short: usize, long: usize) -> Option<f64> {
    let frame = IndicatorFrame::new(series)
        .with(Indicator::MovingAverage(short))
        .with(Indicator::MovingAverage(long));
    let symbols = frame.symbols();
    if symbols.is_empty() {
        return None;
    }
    let up = symbols
        .iter()
        .filter_map(|s| frame.latest(s))
        .filter(|row| {
            matches!(
                (row.get(Indicator::MovingAverage(short)), row.get(Indicator::MovingAverage(long))),
                (Some(a), Some(b)) if a > b
            )
        })
        .count();
    Some(up as f64 / symbols.len() as f64)
}

/// A borrowed series plus any number of typed indicator columns.
pub struct IndicatorFrame<'a, T> {
    rows: &'a [T],
    columns: BTreeMap<Indicator, Vec<Option<f64>>>,
    by_symbol: HashMap<&'a str, Vec<usize>>,
}

impl<'a, T: PricePoint> IndicatorFrame<'a, T> {
    pub fn new(rows: &'a [T]) -> Self {
        let mut by_symbol: HashMap<&'a str, Vec<usize>> = HashMap::new();
        for (i, r) in rows.iter().enumerate() {
            by_symbol.entry(r.symbol()).or_default().push(i);
        }
        Self { rows, columns: BTreeMap::new(), by_symbol }
    }

    /// Adds a column; asking twice for the same indicator is a no-op.
    pub fn with(mut self, indicator: Indicator) -> Self {
        if !self.columns.contains_key(&indicator) {
            let col = compute(self.rows, indicator);
            self.columns.insert(indicator, col.values);
        }
        self
    }

    pub fn len(&self) -> usize { self.rows.len() }
    pub fn is_empty(&self) -> bool { self.rows.is_empty() }

    /// Symbols present in the series, sorted.
    pub fn symbols(&self) -> Vec<&'a str> {
        let mut out: Vec<&'a str> = self.by_symbol.keys().copied().collect();
        out.sort_unstable();
        out
    }

    pub fn value(&self, index: usize, indicator: Indicator) -> Option<f64> {
        self.columns.get(&indicator).and_then(|c| c.get(index).copied().flatten())
    }

    pub fn row(&self, index: usize) -> Option<IndicatorRow<'_, 'a, T>> {
        self.rows.get(index).map(|record| IndicatorRow { index, record, frame: self })
    }

    /// Rows of one symbol in series order.
    pub fn rows_for(&self, symbol: &str) -> Vec<IndicatorRow<'_, 'a, T>> {
        self.by_symbol
            .get(symbol)
            .map(|idx| idx.iter().filter_map(|&i| self.row(i)).collect())
            .unwrap_or_default()
    }

    pub fn latest(&self, symbol: &str) -> Option<IndicatorRow<'_, 'a, T>> {
        self.by_symbol.get(symbol).and_then(|idx| idx.last()).and_then(|&i| self.row(i))
    }
}

/// One record with typed access to the frame's indicator columns.
pub struct IndicatorRow<'f, 'a, T> {
    pub index: usize,
    pub record: &'a T,
    frame: &'f IndicatorFrame<'a, T>,
}

impl<T> Clone for IndicatorRow<'_, '_, T> {
    fn clone(&self) -> Self { *self }
}
impl<T> Copy for IndicatorRow<'_, '_, T> {}

impl<'f, 'a, T: PricePoint> IndicatorRow<'f, 'a, T> {
    pub fn get(&self, indicator: Indicator) -> Option<f64> {
        self.frame.value(self.index, indicator)
    }
    pub fn price(&self) -> f64 { self.record.price() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone, Utc};

    fn obs(symbol: &str, hour: i64, price: f64) -> Observation {
        let t0 = Utc.with_ymd_and_hms(2025, 3, 3, 7, 0, 0).unwrap();
        Observation {
            symbol: symbol.to_string(),
            timestamp: t0 + Duration::hours(hour),
            price,
            ask_volume: 1.0,
            bid_volume: 1.0,
        }
    }

    fn series(symbol: &str, prices: &[f64]) -> Vec<Observation> {
        prices.iter().enumerate().map(|(i, &p)| obs(symbol, i as i64, p)).collect()
    }

    #[test]
    fn ma_period_one_is_identity() {
        let s = series("A", &[3.0, 7.5, 1.25, 9.0]);
        let col = moving_average(&s, 1);
        let got: Vec<f64> = col.values.iter().map(|v| v.unwrap()).collect();
        assert_eq!(got, vec![3.0, 7.5, 1.25, 9.0]);
    }

    #[test]
    fn ma_warm_up_uses_available_points() {
        let s = series("A", &[2.0, 4.0, 6.0, 8.0]);
        let col = moving_average(&s, 3);
        assert_relative_eq!(col.values[0].unwrap(), 2.0);
        assert_relative_eq!(col.values[1].unwrap(), 3.0);
        assert_relative_eq!(col.values[2].unwrap(), 4.0);
        assert_relative_eq!(col.values[3].unwrap(), 6.0);
    }

    #[test]
    fn windows_are_grouped_by_symbol_without_reordering() {
        // A and B interleaved; B's values must not leak into A's window
        let s = vec![obs("A", 0, 10.0), obs("B", 0, 100.0), obs("A", 1, 20.0), obs("B", 1, 200.0)];
        let col = moving_average(&s, 2);
        assert_relative_eq!(col.values[0].unwrap(), 10.0);
        assert_relative_eq!(col.values[1].unwrap(), 100.0);
        assert_relative_eq!(col.values[2].unwrap(), 15.0);
        assert_relative_eq!(col.values[3].unwrap(), 150.0);
        assert_eq!(s[1].symbol, "B");
    }

    #[test]
    fn std_is_sample_std_and_undefined_for_single_point() {
        let s = series("A", &[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        let col = moving_std(&s, 8);
        assert!(col.values[0].is_none());
        // sample variance of the eight points is 32/7
        assert_relative_eq!(col.values[7].unwrap(), (32.0f64 / 7.0).sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn rsi_of_increasing_series_is_100() {
        let s = series("A", &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        let col = rsi(&s, 3);
        assert!(col.values.iter().all(|v| *v == Some(100.0)));
    }

    #[test]
    fn rsi_mixed_moves() {
        // diffs: (first=0), +2, -1, +1 ; period 3 on the last row -> gains [2,0,1], losses [0,1,0]
        let s = series("A", &[10.0, 12.0, 11.0, 12.0]);
        let col = rsi(&s, 3);
        let g = 3.0 / 3.0;
        let l = 1.0 / 3.0;
        assert_relative_eq!(col.values[3].unwrap(), 100.0 - 100.0 / (1.0 + g / l), epsilon = 1e-9);
        assert_relative_eq!(col.values[3].unwrap(), 75.0, epsilon = 1e-9);
        // decreasing-only tail has RSI 0
        let d = series("B", &[10.0, 9.0, 8.0, 7.0]);
        assert_relative_eq!(rsi(&d, 2).values[3].unwrap(), 0.0);
    }

    #[test]
    fn frame_columns_with_different_periods_coexist() {
        let s = series("A", &[1.0, 2.0, 3.0, 4.0, 5.0]);
        let frame = IndicatorFrame::new(&s)
            .with(Indicator::MovingAverage(2))
            .with(Indicator::MovingAverage(4))
            .with(Indicator::Rsi(3));
        let last = frame.latest("A").unwrap();
        assert_relative_eq!(last.get(Indicator::MovingAverage(2)).unwrap(), 4.5);
        assert_relative_eq!(last.get(Indicator::MovingAverage(4)).unwrap(), 3.5);
        assert_eq!(last.get(Indicator::Rsi(3)), Some(100.0));
        assert_eq!(last.get(Indicator::MovingStd(4)), None);
        assert_eq!(frame.rows_for("A").len(), 5);
        assert!(frame.rows_for("Z").is_empty());
    }

    #[test]
    fn breadth_counts_symbols_in_uptrend() {
        let mut s = series("UP", &[1.0, 2.0, 3.0, 4.0]);
        s.extend(series("DOWN", &[4.0, 3.0, 2.0, 1.0]));
        assert_relative_eq!(market_breadth(&s, 2, 4).unwrap(), 0.5);
        let empty: Vec<Observation> = Vec::new();
        assert!(market_breadth(&empty, 2, 4).is_none());
    }

    #[test]
    fn zero_period_yields_no_values() {
        let s = series("A", &[1.0, 2.0]);
        assert!(moving_average(&s, 0).values.iter().all(Option::is_none));
    }

    #[test]
    fn log_returns_per_symbol() {
        let s = series("A", &[100.0, 110.0]);
        let r = log_returns(&s);
        assert!(r[0].is_none());
        assert_relative_eq!(r[1].unwrap(), (1.1f64).ln(), epsilon = 1e-12);
    }
}
