// ===============================
// src/error.rs
// ===============================
use thiserror::Error;

use crate::domain::OrderStatus;

/// Failures of the external market API.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http request failed: {0}")]
    Http(String),
    #[error("api returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("cannot decode api response: {0}")]
    Decode(String),
    #[error("api call timed out after {0} ms")]
    Timeout(u64),
    #[error("bad api configuration: {0}")]
    Config(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ApiError::Timeout(0)
        } else if e.is_decode() {
            ApiError::Decode(e.to_string())
        } else {
            ApiError::Http(e.to_string())
        }
    }
}

/// Settings that parse but cannot be turned into a usable value.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key}={value} is out of range")]
    OutOfRange { key: &'static str, value: i64 },
}

/// Runtime fault taxonomy. Only `FatalInitialization` ever stops the process.
#[derive(Debug, Error)]
pub enum BotError {
    #[error("market data fetch failed: {0}")]
    TransientFetch(#[from] ApiError),
    #[error("market data cache is still empty")]
    EmptyCache,
    #[error("order for {symbol} not completed (status {})", status.as_str())]
    OrderRejected { symbol: String, status: OrderStatus },
    #[error("data integrity fault for {symbol}: {reason}")]
    DataIntegrity { symbol: String, reason: String },
    #[error("initialization failed: {0}")]
    FatalInitialization(String),
}

impl BotError {
    pub fn integrity(symbol: impl Into<String>, reason: impl Into<String>) -> Self {
        BotError::DataIntegrity { symbol: symbol.into(), reason: reason.into() }
    }
}
