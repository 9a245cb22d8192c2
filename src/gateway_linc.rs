// ===============================
// src/gateway_linc.rs
// ===============================
//
// LINC hackathon REST API.
// Every call carries the API key header and is bounded by the client timeout,
// so a stalled endpoint surfaces as ApiError::Timeout instead of hanging a loop.
//
use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tokio::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::domain::{HistoricalRecord, OrderFill, Quote};
use crate::error::ApiError;
use crate::gateway::MarketApi;
use crate::metrics::EXECS;

const API_KEY_HEADER: &str = "X-API-KEY";

const PATH_HISTORY: &str = "data";
const PATH_CURRENT: &str = "data/current";
const PATH_BUY: &str = "order/buy";
const PATH_SELL: &str = "order/sell";
const PATH_PORTFOLIO: &str = "account/portfolio";
const PATH_BALANCE: &str = "account/balance";

/// Responses come either bare or wrapped as `{"data": ...}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum Envelope<T> {
    Wrapped { data: T },
    Bare(T),
}
impl<T> Envelope<T> {
    fn into_inner(self) -> T {
        match self {
            Envelope::Wrapped { data } => data,
            Envelope::Bare(v) => v,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BalanceBody {
    Plain(f64),
    Wrapped { balance: f64 },
}

/// Quantities come back as JSON numbers, sometimes with a fraction.
fn holdings(raw: HashMap<String, f64>) -> HashMap<String, i64> {
    raw.into_iter().filter(|(_, v)| v.is_finite()).map(|(k, v)| (k, v.round() as i64)).collect()
}

pub struct LincClient {
    http: reqwest::Client,
    base: Url,
    api_key: String,
    timeout_ms: u64,
}

impl LincClient {
    pub fn new(base_url: &str, api_key: String, timeout: Duration) -> Result<Self, ApiError> {
        if api_key.trim().is_empty() {
            return Err(ApiError::Config("LINC_API_KEY is empty".into()));
        }
        // Url::join drops the last path segment unless the base ends with '/'
        let normalized = if base_url.ends_with('/') { base_url.to_string() } else { format!("{base_url}/") };
        let base = Url::parse(&normalized).map_err(|e| ApiError::Config(format!("bad base url {base_url}: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| ApiError::Config(e.to_string()))?;
        Ok(Self { http, base, api_key, timeout_ms: timeout.as_millis() as u64 })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        self.base.join(path).map_err(|e| ApiError::Config(format!("bad path {path}: {e}")))
    }

    fn map_err(&self, e: reqwest::Error) -> ApiError {
        match ApiError::from(e) {
            ApiError::Timeout(_) => ApiError::Timeout(self.timeout_ms),
            other => other,
        }
    }

    async fn decode<T: DeserializeOwned>(&self, rsp: reqwest::Response) -> Result<T, ApiError> {
        let status = rsp.status();
        if !status.is_success() {
            let body = rsp.text().await.unwrap_or_default();
            return Err(ApiError::Status { status: status.as_u16(), body });
        }
        let text = rsp.text().await.map_err(|e| self.map_err(e))?;
        serde_json::from_str::<T>(&text).map_err(|e| ApiError::Decode(format!("{e}: {}", truncate(&text, 200))))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T, ApiError> {
        let url = self.endpoint(path)?;
        debug!(%url, "GET");
        let rsp = self
            .http
            .get(url)
            .header(API_KEY_HEADER, &self.api_key)
            .query(query)
            .send()
            .await
            .map_err(|e| self.map_err(e))?;
        self.decode(rsp).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: serde_json::Value) -> Result<T, ApiError> {
        let url = self.endpoint(path)?;
        debug!(%url, "POST");
        let rsp = self
            .http
            .post(url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_err(e))?;
        self.decode(rsp).await
    }

    async fn order(&self, path: &str, side: &str, ticker: &str, qty: u64) -> Result<OrderFill, ApiError> {
        let res = self
            .post::<OrderFill>(path, json!({ "ticker": ticker, "amount": qty }))
            .await;
        match &res {
            Ok(fill) => EXECS.with_label_values(&[fill.status.as_str(), "linc"]).inc(),
            Err(e) => {
                warn!(%e, side, ticker, qty, "order call failed");
                EXECS.with_label_values(&["error", "linc"]).inc();
            }
        }
        res
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

#[async_trait]
impl MarketApi for LincClient {
    async fn fetch_historical(&self, days_back: u32, ticker: Option<&str>)
        -> Result<Vec<HistoricalRecord>, ApiError>
    {
        let mut query = vec![("days_back", days_back.to_string())];
        if let Some(t) = ticker {
            query.push(("ticker", t.to_string()));
        }
        let env: Envelope<Vec<HistoricalRecord>> = self.get(PATH_HISTORY, &query).await?;
        Ok(env.into_inner())
    }

    async fn current_price(&self, ticker: &str) -> Result<Quote, ApiError> {
        let env: Envelope<Vec<Quote>> = self.get(PATH_CURRENT, &[("ticker", ticker.to_string())]).await?;
        let quotes = env.into_inner();
        quotes
            .iter()
            .find(|q| q.symbol == ticker)
            .or_else(|| quotes.first())
            .cloned()
            .map(|mut q| {
                q.symbol = ticker.to_string();
                q
            })
            .ok_or_else(|| ApiError::Decode(format!("no quote for {ticker}")))
    }

    async fn buy(&self, ticker: &str, qty: u64) -> Result<OrderFill, ApiError> {
        self.order(PATH_BUY, "buy", ticker, qty).await
    }

    async fn sell(&self, ticker: &str, qty: u64) -> Result<OrderFill, ApiError> {
        self.order(PATH_SELL, "sell", ticker, qty).await
    }

    async fn portfolio(&self) -> Result<HashMap<String, i64>, ApiError> {
        let env: Envelope<HashMap<String, f64>> = self.get(PATH_PORTFOLIO, &[]).await?;
        Ok(holdings(env.into_inner()))
    }

    async fn balance(&self) -> Result<f64, ApiError> {
        match self.get::<BalanceBody>(PATH_BALANCE, &[]).await? {
            BalanceBody::Plain(v) | BalanceBody::Wrapped { balance: v } => Ok(v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_keeps_its_path_prefix() {
        let c = LincClient::new("https://example.test/api", "k".into(), Duration::from_secs(1)).unwrap();
        assert_eq!(c.endpoint(PATH_BUY).unwrap().as_str(), "https://example.test/api/order/buy");
        assert_eq!(c.endpoint(PATH_HISTORY).unwrap().as_str(), "https://example.test/api/data");
    }

    #[test]
    fn empty_key_is_a_config_error() {
        assert!(matches!(
            LincClient::new("https://example.test", " ".into(), Duration::from_secs(1)),
            Err(ApiError::Config(_))
        ));
    }

    #[test]
    fn envelopes_decode_both_shapes() {
        let wrapped: Envelope<Vec<HistoricalRecord>> =
            serde_json::from_str(r#"{"data":[{"symbol":"STOCK1","askMedian":1.0}]}"#).unwrap();
        assert_eq!(wrapped.into_inner().len(), 1);
        let bare: Envelope<Vec<HistoricalRecord>> = serde_json::from_str(r#"[{"symbol":"STOCK1"}]"#).unwrap();
        assert_eq!(bare.into_inner()[0].symbol.as_deref(), Some("STOCK1"));

        let b: BalanceBody = serde_json::from_str("1234.5").unwrap();
        assert!(matches!(b, BalanceBody::Plain(v) if v == 1234.5));
        let b: BalanceBody = serde_json::from_str(r#"{"balance": 7.0}"#).unwrap();
        assert!(matches!(b, BalanceBody::Wrapped { balance } if balance == 7.0));
    }

    #[test]
    fn portfolio_decodes_into_whole_holdings() {
        let env: Envelope<HashMap<String, f64>> =
            serde_json::from_str(r#"{"data":{"STOCK1":10.0,"INDEX1":2.6,"STOCK2":0}}"#).unwrap();
        let h = holdings(env.into_inner());
        assert_eq!(h.len(), 3);
        assert_eq!(h["STOCK1"], 10);
        assert_eq!(h["INDEX1"], 3);
        assert_eq!(h["STOCK2"], 0);

        let bare: Envelope<HashMap<String, f64>> = serde_json::from_str(r#"{"STOCK3":4}"#).unwrap();
        assert_eq!(holdings(bare.into_inner())["STOCK3"], 4);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("åäö-abc", 3), "åäö");
        assert_eq!(truncate("ab", 10), "ab");
    }
}
