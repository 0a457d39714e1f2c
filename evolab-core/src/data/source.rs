//! Market data source contract and classified errors.

use std::fmt;

use thiserror::Error;

use crate::domain::{MarketKey, OhlcvSeries, Timeframe};

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

/// Structured data errors. `Clone` so one failed fetch can be handed to
/// every caller that coalesced onto it.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DataError {
    #[error("request timed out after {after_ms} ms")]
    Timeout { after_ms: u64 },

    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("rate limited by provider (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("provider returned HTTP {status}")]
    ServerError { status: u16 },

    #[error("fetch cancelled")]
    Cancelled,

    #[error("authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("symbol not found: {symbol}")]
    SymbolNotFound { symbol: String },

    #[error("exchange '{0}' is not served by this source")]
    UnsupportedExchange(String),

    #[error("timeframe {0} is not supported by this source")]
    UnsupportedTimeframe(Timeframe),

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("hard stop: data provider has blocked requests (circuit breaker tripped)")]
    CircuitBreakerTripped,

    #[error("invalid market data: {0}")]
    InvalidData(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl DataError {
    pub fn class(&self) -> ErrorClass {
        match self {
            DataError::Timeout { .. }
            | DataError::NetworkUnreachable(_)
            | DataError::RateLimited { .. }
            | DataError::ServerError { .. } => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// One `fetch_ohlcv` call: market coordinates plus the bar limit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MarketRequest {
    pub key: MarketKey,
    pub limit: usize,
}

impl MarketRequest {
    pub fn new(
        exchange: impl Into<String>,
        symbol: impl Into<String>,
        timeframe: Timeframe,
        limit: usize,
    ) -> Self {
        Self {
            key: MarketKey::new(exchange, symbol, timeframe),
            limit,
        }
    }
}

impl fmt::Display for MarketRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (limit {})", self.key, self.limit)
    }
}

/// Provider of OHLCV series.
///
/// Implementations return at most `limit` of the most recent bars, ascending
/// by timestamp, or a classified [`DataError`]. They do not cache or retry.
pub trait MarketDataSource: Send + Sync {
    /// Human-readable name of this source.
    fn name(&self) -> &str;

    fn fetch_ohlcv(&self, request: &MarketRequest) -> Result<OhlcvSeries, DataError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(DataError::Timeout { after_ms: 10 }.is_transient());
        assert!(DataError::ServerError { status: 503 }.is_transient());
        assert!(DataError::RateLimited { retry_after_secs: 1 }.is_transient());
        assert!(DataError::NetworkUnreachable("reset".into()).is_transient());
        assert!(!DataError::AuthenticationRequired("key".into()).is_transient());
        assert!(!DataError::SymbolNotFound { symbol: "X".into() }.is_transient());
        assert!(!DataError::ResponseFormatChanged("x".into()).is_transient());
        assert!(!DataError::CircuitBreakerTripped.is_transient());
        assert!(!DataError::Cancelled.is_transient());
    }

    #[test]
    fn request_display() {
        let req = MarketRequest::new("binance", "ETHUSDT", Timeframe::M15, 500);
        assert_eq!(req.to_string(), "binance:ETHUSDT:15m (limit 500)");
    }
}
