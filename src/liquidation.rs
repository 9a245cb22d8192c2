// ===============================
// src/liquidation.rs
// ===============================
//
// Shutdown liquidation: entered once, after every strategy loop has returned.
// Sells each positive account holding until the venue confirms `completed`.
//
use ahash::AHashMap as HashMap;
use tracing::{info, warn};

use crate::domain::OrderStatus;
use crate::error::BotError;
use crate::gateway::SharedApi;
use crate::metrics::LIQUIDATION_SELLS;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct LiquidationCfg {
    /// Symbols that are left untouched.
    pub exclude: Vec<String>,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiquidationReport {
    pub sold: Vec<(String, u64, f64)>,
    pub skipped: Vec<String>,
}

pub async fn liquidate(api: &SharedApi, cfg: &LiquidationCfg) -> LiquidationReport {
    let holdings: HashMap<String, i64> = match cfg
        .retry
        .run("portfolio query", |_| async { api.portfolio().await })
        .await
    {
        Ok(h) => h,
        Err(e) => {
            // only reachable with a bounded policy
            warn!(%e, "liquidation: portfolio unavailable, nothing sold");
            return LiquidationReport::default();
        }
    };

    let mut symbols: Vec<(String, i64)> = holdings.into_iter().filter(|(_, q)| *q > 0).collect();
    symbols.sort();
    info!(positions = symbols.len(), "liquidation: started");

    let mut report = LiquidationReport::default();
    for (symbol, qty) in symbols {
        if cfg.exclude.iter().any(|x| x == &symbol) {
            info!(%symbol, qty, "liquidation: excluded, kept");
            report.skipped.push(symbol);
            continue;
        }
        let qty = qty as u64;
        let sym = symbol.as_str();
        let sold = cfg
            .retry
            .run("liquidation sell", |attempt| async move {
                let fill = api.sell(sym, qty).await?;
                match fill.completed_price() {
                    Some(px) => Ok(px),
                    None => {
                        if attempt > 1 && fill.status == OrderStatus::Failed {
                            warn!(symbol = sym, attempt, "liquidation: sell keeps failing");
                        }
                        Err(BotError::OrderRejected { symbol: sym.to_string(), status: fill.status })
                    }
                }
            })
            .await;
        match sold {
            Ok(px) => {
                LIQUIDATION_SELLS.inc();
                info!(%symbol, qty, px, "liquidation: sold");
                report.sold.push((symbol, qty, px));
            }
            Err(e) => {
                warn!(%e, %symbol, qty, "liquidation: gave up");
                report.skipped.push(symbol);
            }
        }
    }
    info!(sold = report.sold.len(), skipped = report.skipped.len(), "liquidation: done");
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tokio::time::Duration;

    use crate::domain::{HistoricalRecord, OrderFill, Quote};
    use crate::error::ApiError;
    use crate::gateway::MarketApi;

    /// Holdings are fixed; each sell of a symbol fails `flaky` times before completing.
    struct FlakyAccount {
        holdings: HashMap<String, i64>,
        flaky: Mutex<HashMap<String, u32>>,
        portfolio_failures: Mutex<u32>,
        sells: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MarketApi for FlakyAccount {
        async fn fetch_historical(&self, _d: u32, _t: Option<&str>) -> Result<Vec<HistoricalRecord>, ApiError> { Ok(vec![]) }
        async fn current_price(&self, _t: &str) -> Result<Quote, ApiError> { Err(ApiError::Http("n/a".into())) }
        async fn buy(&self, _t: &str, _q: u64) -> Result<OrderFill, ApiError> { Err(ApiError::Http("n/a".into())) }
        async fn sell(&self, t: &str, _q: u64) -> Result<OrderFill, ApiError> {
            self.sells.lock().unwrap().push(t.to_string());
            let mut flaky = self.flaky.lock().unwrap();
            let left = flaky.entry(t.to_string()).or_insert(0);
            if *left > 0 {
                *left -= 1;
                if *left % 2 == 0 {
                    return Err(ApiError::Status { status: 502, body: String::new() });
                }
                return Ok(OrderFill { status: OrderStatus::Pending, price: None });
            }
            Ok(OrderFill { status: OrderStatus::Completed, price: Some(10.0) })
        }
        async fn portfolio(&self) -> Result<HashMap<String, i64>, ApiError> {
            let mut left = self.portfolio_failures.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(ApiError::Timeout(100));
            }
            Ok(self.holdings.clone())
        }
        async fn balance(&self) -> Result<f64, ApiError> { Ok(0.0) }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_every_holding_is_sold() {
        let holdings: HashMap<String, i64> =
            [("A".to_string(), 5), ("B".to_string(), 2), ("C".to_string(), 0), ("KEEP".to_string(), 7)]
                .into_iter()
                .collect();
        let flaky: HashMap<String, u32> = [("B".to_string(), 4)].into_iter().collect();
        let account = Arc::new(FlakyAccount {
            holdings,
            flaky: Mutex::new(flaky),
            portfolio_failures: Mutex::new(2),
            sells: Mutex::new(Vec::new()),
        });
        let api: SharedApi = account.clone();
        let cfg = LiquidationCfg {
            exclude: vec!["KEEP".into()],
            retry: RetryPolicy::fixed(Duration::from_secs(1), None),
        };

        let report = liquidate(&api, &cfg).await;
        assert_eq!(report.sold, vec![("A".to_string(), 5, 10.0), ("B".to_string(), 2, 10.0)]);
        assert_eq!(report.skipped, vec!["KEEP".to_string()]);
        let sells = account.sells.lock().unwrap().clone();
        assert_eq!(sells.iter().filter(|s| *s == "B").count(), 5);
        assert!(!sells.contains(&"C".to_string()));
    }
}
