//! In-memory source serving fixed series: replays and test doubles.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use super::source::{DataError, MarketDataSource, MarketRequest};
use crate::domain::{MarketKey, OhlcvSeries};

#[derive(Debug, Default)]
pub struct InMemorySource {
    series: RwLock<HashMap<MarketKey, Result<OhlcvSeries, DataError>>>,
    calls: AtomicUsize,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_series(self, key: MarketKey, series: OhlcvSeries) -> Self {
        self.insert(key, series);
        self
    }

    pub fn insert(&self, key: MarketKey, series: OhlcvSeries) {
        self.write().insert(key, Ok(series));
    }

    /// Make every fetch of `key` fail with `error`.
    pub fn fail_with(&self, key: MarketKey, error: DataError) {
        self.write().insert(key, Err(error));
    }

    /// Number of `fetch_ohlcv` calls served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn write(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<MarketKey, Result<OhlcvSeries, DataError>>> {
        self.series.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl MarketDataSource for InMemorySource {
    fn name(&self) -> &str {
        "memory"
    }

    fn fetch_ohlcv(&self, request: &MarketRequest) -> Result<OhlcvSeries, DataError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let map = self.series.read().unwrap_or_else(|e| e.into_inner());
        match map.get(&request.key) {
            Some(Ok(series)) => {
                let mut series = series.clone();
                series.truncate_to_recent(request.limit);
                Ok(series)
            }
            Some(Err(e)) => Err(e.clone()),
            None => Err(DataError::SymbolNotFound {
                symbol: request.key.symbol.clone(),
            }),
        }
    }
}
