//! Seeded synthetic market data: a geometric random walk.
//!
//! Each market key gets its own RNG substream, so the same seed always yields
//! the same bars for the same request no matter which markets were asked for
//! first. Bars end at a fixed anchor time supplied at construction.

use chrono::{DateTime, Utc};
use rand::Rng;
use rand_distr::{Distribution, Normal};

use super::source::{DataError, MarketDataSource, MarketRequest};
use crate::domain::{OhlcvBar, OhlcvSeries};
use crate::rng::{streams, RngHierarchy};

#[derive(Debug, Clone)]
pub struct SyntheticSource {
    rng: RngHierarchy,
    end: DateTime<Utc>,
    start_price: f64,
    /// Per-bar log-return standard deviation.
    volatility: f64,
    drift: f64,
}

impl SyntheticSource {
    pub fn new(rng: RngHierarchy, end: DateTime<Utc>) -> Self {
        Self {
            rng,
            end,
            start_price: 50_000.0,
            volatility: 0.02,
            drift: 0.0,
        }
    }

    pub fn with_walk(mut self, start_price: f64, volatility: f64, drift: f64) -> Self {
        self.start_price = start_price;
        self.volatility = volatility;
        self.drift = drift;
        self
    }

    pub fn generate(&self, request: &MarketRequest) -> Result<OhlcvSeries, DataError> {
        let normal = Normal::new(self.drift, self.volatility)
            .map_err(|e| DataError::InvalidData(format!("synthetic walk: {e}")))?;
        let stream = format!("{}/{}", streams::MARKET, request.key);
        let mut rng = self.rng.rng_for(&stream, request.limit as u64);

        let step = request.key.timeframe.duration();
        let n = request.limit as i32;
        let mut close = self.start_price;
        let mut bars = Vec::with_capacity(request.limit);
        for i in 0..n {
            let open = close;
            close = open * normal.sample(&mut rng).exp();
            let wick_up: f64 = rng.gen_range(0.0..0.5) * self.volatility;
            let wick_down: f64 = rng.gen_range(0.0..0.5) * self.volatility;
            bars.push(OhlcvBar {
                timestamp: self.end - step * (n - 1 - i),
                open,
                high: open.max(close) * (1.0 + wick_up),
                low: open.min(close) * (1.0 - wick_down),
                close,
                volume: rng.gen_range(100.0..1000.0),
            });
        }
        Ok(OhlcvSeries::new(bars))
    }
}

impl MarketDataSource for SyntheticSource {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn fetch_ohlcv(&self, request: &MarketRequest) -> Result<OhlcvSeries, DataError> {
        self.generate(request)
    }
}
