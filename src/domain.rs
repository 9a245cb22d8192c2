// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side { Buy, Sell }
impl Side {
    pub fn as_str(&self) -> &'static str { match self { Side::Buy => "buy", Side::Sell => "sell" } }
}

/// One intraday market snapshot for one symbol. Never mutated after it is recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub ask_volume: f64,
    pub bid_volume: f64,
}

impl Observation {
    /// Price is the midpoint of the ask/bid medians.
    pub fn from_quote(
        symbol: impl Into<String>,
        timestamp: DateTime<Utc>,
        ask_median: f64,
        bid_median: f64,
        ask_volume: f64,
        bid_volume: f64,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            timestamp,
            price: (ask_median + bid_median) / 2.0,
            ask_volume,
            bid_volume,
        }
    }

    pub fn date(&self) -> NaiveDate { self.timestamp.date_naive() }
}

/// Symbol x trading-day aggregate, derived from observations of a completed day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyBar {
    pub symbol: String,
    pub date: NaiveDate,
    pub open: f64,
    pub close: f64,
    pub ask_volume: f64,
    pub bid_volume: f64,
}

/// Raw historical row as the market API returns it. Any field may be missing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalRecord {
    #[serde(default)]
    pub gmt_time: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub ask_median: Option<f64>,
    #[serde(default)]
    pub bid_median: Option<f64>,
    #[serde(default)]
    pub ask_volume: Option<f64>,
    #[serde(default)]
    pub bid_volume: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    #[serde(default)]
    pub symbol: String,
    pub ask_median: f64,
    pub bid_median: f64,
}
impl Quote { pub fn mid(&self) -> f64 { (self.ask_median + self.bid_median) / 2.0 } }

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Completed,
    Failed,
    #[default]
    #[serde(other)]
    Unknown,
}
impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Completed => "completed",
            OrderStatus::Failed => "failed",
            OrderStatus::Unknown => "unknown",
        }
    }
}

/// Result of one buy/sell call. `price` is the authoritative fill price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFill {
    #[serde(rename = "order_status", default)]
    pub status: OrderStatus,
    #[serde(default)]
    pub price: Option<f64>,
}
impl OrderFill {
    /// Fill price of a completed order; `None` for anything that did not fill.
    pub fn completed_price(&self) -> Option<f64> {
        match (self.status, self.price) {
            (OrderStatus::Completed, Some(px)) if px.is_finite() && px > 0.0 => Some(px),
            _ => None,
        }
    }
}

// Journal events (one JSON line each)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderEvent {
    pub ts: DateTime<Utc>,
    pub strategy: String,
    pub symbol: String,
    pub side: Side,
    pub qty: u64,
    pub status: OrderStatus,
    pub fill_px: Option<f64>,
    pub reason: String,
}
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleEvent {
    pub ts: DateTime<Utc>,
    pub strategy: String,
    pub cash: f64,
    pub open_value: f64,
    pub realized_pnl: f64,
    pub sells: usize,
    pub buys: usize,
}
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event { Order(OrderEvent), Cycle(CycleEvent), Note(String) }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observation_price_is_midpoint() {
        let ts = Utc::now();
        let o = Observation::from_quote("STOCK1", ts, 101.0, 99.0, 5.0, 7.0);
        assert_eq!(o.price, 100.0);
        assert_eq!(o.date(), ts.date_naive());
    }

    #[test]
    fn order_fill_parses_api_payload() {
        let fill: OrderFill = serde_json::from_str(r#"{"order_status":"completed","price":12.5}"#).unwrap();
        assert_eq!(fill.completed_price(), Some(12.5));

        let pending: OrderFill = serde_json::from_str(r#"{"order_status":"pending"}"#).unwrap();
        assert_eq!(pending.status, OrderStatus::Pending);
        assert_eq!(pending.completed_price(), None);

        let odd: OrderFill = serde_json::from_str(r#"{"order_status":"queued","price":1.0}"#).unwrap();
        assert_eq!(odd.status, OrderStatus::Unknown);
        assert_eq!(odd.completed_price(), None);
    }

    #[test]
    fn historical_record_tolerates_missing_fields() {
        let rec: HistoricalRecord = serde_json::from_str(
            r#"{"gmtTime":"2025-03-03T08:00:00Z","symbol":"STOCK2","askMedian":10.0}"#,
        )
        .unwrap();
        assert_eq!(rec.symbol.as_deref(), Some("STOCK2"));
        assert!(rec.bid_median.is_none());
    }
}
