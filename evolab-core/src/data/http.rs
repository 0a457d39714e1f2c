//! REST kline adapter for Binance-compatible exchanges.
//!
//! `GET {base_url}/api/v3/klines?symbol=..&interval=..&limit=..` returns an
//! array of rows `[open_time_ms, "open", "high", "low", "close", "volume", ...]`.
//! One attempt per call: HTTP status codes map onto transient or permanent
//! [`DataError`]s and the caller decides whether to retry.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use super::circuit_breaker::CircuitBreaker;
use super::source::{DataError, MarketDataSource, MarketRequest};
use crate::domain::{OhlcvBar, OhlcvSeries};

/// Largest page the kline endpoint serves.
pub const MAX_LIMIT: usize = 1000;

pub const DEFAULT_BASE_URL: &str = "https://api.binance.com";

/// Error body returned with 4xx responses.
#[derive(Debug, Deserialize)]
struct ApiError {
    code: i64,
    msg: String,
}

/// Binance code for an unknown trading pair.
const INVALID_SYMBOL: i64 = -1121;

pub struct HttpKlineSource {
    exchange: String,
    base_url: String,
    client: reqwest::blocking::Client,
    circuit_breaker: Arc<CircuitBreaker>,
    timeout: Duration,
}

impl HttpKlineSource {
    pub fn new(
        exchange: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, DataError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("evolab/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DataError::Io(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            exchange: exchange.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            circuit_breaker,
            timeout,
        })
    }

    fn klines_url(&self, request: &MarketRequest) -> String {
        format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url,
            request.key.symbol,
            request.key.timeframe,
            request.limit.clamp(1, MAX_LIMIT)
        )
    }

    fn classify_status(
        &self,
        symbol: &str,
        status: reqwest::StatusCode,
        retry_after: Option<u64>,
        body: &str,
    ) -> DataError {
        match status.as_u16() {
            // 418 is the exchange's escalation of a ban after ignored 429s
            403 | 418 => {
                self.circuit_breaker.trip();
                DataError::CircuitBreakerTripped
            }
            429 => {
                self.circuit_breaker.record_failure();
                DataError::RateLimited {
                    retry_after_secs: retry_after.unwrap_or(60),
                }
            }
            401 => DataError::AuthenticationRequired(format!("{} rejected credentials", self.exchange)),
            400 => match serde_json::from_str::<ApiError>(body) {
                Ok(err) if err.code == INVALID_SYMBOL => DataError::SymbolNotFound {
                    symbol: symbol.to_string(),
                },
                Ok(err) => DataError::ResponseFormatChanged(format!("{}: {}", err.code, err.msg)),
                Err(_) => DataError::ResponseFormatChanged(format!("HTTP 400: {body}")),
            },
            code if status.is_server_error() => {
                self.circuit_breaker.record_failure();
                DataError::ServerError { status: code }
            }
            code => DataError::ResponseFormatChanged(format!("unexpected HTTP {code}")),
        }
    }
}

impl MarketDataSource for HttpKlineSource {
    fn name(&self) -> &str {
        &self.exchange
    }

    fn fetch_ohlcv(&self, request: &MarketRequest) -> Result<OhlcvSeries, DataError> {
        if request.key.exchange != self.exchange {
            return Err(DataError::UnsupportedExchange(request.key.exchange.clone()));
        }
        if !self.circuit_breaker.is_allowed() {
            return Err(DataError::CircuitBreakerTripped);
        }

        let resp = self.client.get(self.klines_url(request)).send().map_err(|e| {
            if e.is_timeout() {
                DataError::Timeout {
                    after_ms: self.timeout.as_millis() as u64,
                }
            } else {
                DataError::NetworkUnreachable(e.to_string())
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            let body = resp.text().unwrap_or_default();
            return Err(self.classify_status(&request.key.symbol, status, retry_after, &body));
        }

        let rows: Vec<Vec<Value>> = resp.json().map_err(|e| {
            DataError::ResponseFormatChanged(format!(
                "failed to parse klines for {}: {e}",
                request.key.symbol
            ))
        })?;
        let mut series = parse_klines(&rows)?;
        series.truncate_to_recent(request.limit);
        self.circuit_breaker.record_success();
        Ok(series)
    }
}

/// Convert raw kline rows into an ascending series.
pub fn parse_klines(rows: &[Vec<Value>]) -> Result<OhlcvSeries, DataError> {
    let mut bars = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        if row.len() < 6 {
            return Err(DataError::ResponseFormatChanged(format!(
                "kline row {i} has {} fields, expected at least 6",
                row.len()
            )));
        }
        let open_ms = row[0].as_i64().ok_or_else(|| {
            DataError::ResponseFormatChanged(format!("kline row {i}: open time is not an integer"))
        })?;
        let timestamp: DateTime<Utc> = DateTime::from_timestamp_millis(open_ms).ok_or_else(|| {
            DataError::ResponseFormatChanged(format!("kline row {i}: invalid timestamp {open_ms}"))
        })?;
        let field = |idx: usize| numeric(&row[idx]).ok_or_else(|| {
            DataError::ResponseFormatChanged(format!("kline row {i}: field {idx} is not numeric"))
        });
        bars.push(OhlcvBar {
            timestamp,
            open: field(1)?,
            high: field(2)?,
            low: field(3)?,
            close: field(4)?,
            volume: field(5)?,
        });
    }
    bars.sort_by_key(|b| b.timestamp);
    bars.dedup_by_key(|b| b.timestamp);
    Ok(OhlcvSeries::new(bars))
}

/// Exchanges send prices as strings; accept plain numbers too.
fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}
