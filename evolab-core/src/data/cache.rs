//! Shared TTL cache in front of a [`MarketDataSource`].
//!
//! Entries live in a read/write-locked map keyed by `(exchange, symbol,
//! timeframe)`. A miss elects one leader per key. Concurrent callers for the
//! same key wait on the leader's result instead of issuing their own fetch.
//! The leader runs the source call on a helper thread so the per-request
//! timeout holds for any source. A call that outlives its timeout is parked
//! and the next leader for that key waits on it again rather than starting a
//! second call, so a hung source costs at most one helper thread per key.
//! Failures are never cached.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::source::{DataError, MarketDataSource, MarketRequest};
use crate::cancel::CancelToken;
use crate::clock::Clock;
use crate::domain::{MarketKey, OhlcvSeries};

pub const DEFAULT_TTL_SECS: u64 = 3600;

/// How often blocked callers re-check cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

type FetchOutcome = Result<Arc<OhlcvSeries>, DataError>;
type SourceResult = Result<OhlcvSeries, DataError>;

#[derive(Debug, Clone)]
struct CacheEntry {
    series: Arc<OhlcvSeries>,
    limit: usize,
    fetched_at: DateTime<Utc>,
}

/// A source call still running after its leader stopped waiting.
struct PendingFetch {
    limit: usize,
    started: Instant,
    rx: mpsc::Receiver<SourceResult>,
}

/// One in-progress fetch that followers wait on.
#[derive(Debug, Default)]
struct Flight {
    outcome: Mutex<Option<FetchOutcome>>,
    done: Condvar,
}

impl Flight {
    fn lock(&self) -> MutexGuard<'_, Option<FetchOutcome>> {
        self.outcome.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn complete(&self, outcome: FetchOutcome) {
        *self.lock() = Some(outcome);
        self.done.notify_all();
    }

    fn wait(&self, deadline: Option<Instant>, cancel: &CancelToken) -> FetchOutcome {
        let started = Instant::now();
        let mut guard = self.lock();
        loop {
            if let Some(outcome) = guard.as_ref() {
                return outcome.clone();
            }
            if cancel.grace_expired() {
                return Err(DataError::Cancelled);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(DataError::Timeout {
                    after_ms: started.elapsed().as_millis() as u64,
                });
            }
            guard = self
                .done
                .wait_timeout(guard, POLL_INTERVAL)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }
}

/// Counters for observing cache behaviour.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub coalesced: AtomicU64,
    pub fetch_failures: AtomicU64,
    pub resumed: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn coalesced(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }

    pub fn fetch_failures(&self) -> u64 {
        self.fetch_failures.load(Ordering::Relaxed)
    }

    /// Leader fetches that waited on a parked source call.
    pub fn resumed(&self) -> u64 {
        self.resumed.load(Ordering::Relaxed)
    }
}

pub struct SeriesCache {
    source: Arc<dyn MarketDataSource>,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
    request_timeout: Duration,
    entries: RwLock<HashMap<MarketKey, CacheEntry>>,
    in_flight: Mutex<HashMap<MarketKey, Arc<Flight>>>,
    pending: Mutex<HashMap<MarketKey, PendingFetch>>,
    stats: CacheStats,
}

impl SeriesCache {
    pub fn new(
        source: Arc<dyn MarketDataSource>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            source,
            clock,
            ttl: chrono::Duration::from_std(ttl)
                .unwrap_or_else(|_| chrono::Duration::days(365 * 100)),
            request_timeout,
            entries: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            stats: CacheStats::default(),
        }
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Fresh cached series or a (possibly shared) fetch.
    pub fn get(&self, request: &MarketRequest, cancel: &CancelToken) -> FetchOutcome {
        self.get_within(request, None, cancel)
    }

    /// Like [`get`](Self::get), but gives up with [`DataError::Timeout`] at
    /// `deadline` even when the request timeout has not run out.
    pub fn get_before(
        &self,
        request: &MarketRequest,
        deadline: Instant,
        cancel: &CancelToken,
    ) -> FetchOutcome {
        self.get_within(request, Some(deadline), cancel)
    }

    fn get_within(
        &self,
        request: &MarketRequest,
        deadline: Option<Instant>,
        cancel: &CancelToken,
    ) -> FetchOutcome {
        if let Some(series) = self.lookup(request) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(series);
        }

        let (flight, leader) = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            match in_flight.get(&request.key) {
                Some(flight) => (Arc::clone(flight), false),
                None => {
                    // A leader may have finished between the first lookup and here.
                    if let Some(series) = self.lookup(request) {
                        self.stats.hits.fetch_add(1, Ordering::Relaxed);
                        return Ok(series);
                    }
                    let flight = Arc::new(Flight::default());
                    in_flight.insert(request.key.clone(), Arc::clone(&flight));
                    (flight, true)
                }
            }
        };

        if !leader {
            self.stats.coalesced.fetch_add(1, Ordering::Relaxed);
            let outcome = flight.wait(deadline, cancel)?;
            return Ok(fit_to_limit(outcome, request.limit));
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        let outcome = self.fetch_with_timeout(request, deadline, cancel);
        match &outcome {
            Ok(series) => {
                let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
                entries.insert(
                    request.key.clone(),
                    CacheEntry {
                        series: Arc::clone(series),
                        limit: request.limit,
                        fetched_at: self.clock.now(),
                    },
                );
                debug!(market = %request.key, bars = series.len(), "cached market series");
            }
            Err(e) => {
                self.stats.fetch_failures.fetch_add(1, Ordering::Relaxed);
                warn!(market = %request.key, error = %e, transient = e.is_transient(), "market data fetch failed");
            }
        }
        flight.complete(outcome.clone());
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&request.key);
        outcome
    }

    fn lookup(&self, request: &MarketRequest) -> Option<Arc<OhlcvSeries>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let entry = entries.get(&request.key)?;
        let fresh = self.clock.now() - entry.fetched_at < self.ttl;
        // A narrower cached window cannot answer a wider request.
        let covers = entry.limit >= request.limit;
        (fresh && covers).then(|| fit_to_limit(Arc::clone(&entry.series), request.limit))
    }

    fn fetch_with_timeout(
        &self,
        request: &MarketRequest,
        deadline: Option<Instant>,
        cancel: &CancelToken,
    ) -> FetchOutcome {
        let fetch = match self.resume_pending(request) {
            Some(fetch) => fetch,
            None => self.spawn_fetch(request)?,
        };

        let started = Instant::now();
        let give_up = deadline.map_or(started + self.request_timeout, |d| {
            d.min(started + self.request_timeout)
        });
        loop {
            let now = Instant::now();
            if now >= give_up {
                self.park(&request.key, fetch);
                return Err(DataError::Timeout {
                    after_ms: (give_up - started).as_millis() as u64,
                });
            }
            if cancel.grace_expired() {
                self.park(&request.key, fetch);
                return Err(DataError::Cancelled);
            }
            match fetch.rx.recv_timeout(POLL_INTERVAL.min(give_up - now)) {
                Ok(result) => {
                    let series = result?;
                    validate(&request.key, fetch.limit, &series)?;
                    return Ok(fit_to_limit(Arc::new(series), request.limit));
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(DataError::InvalidData(format!(
                        "source '{}' aborted while fetching {}",
                        self.source.name(),
                        request.key
                    )))
                }
            }
        }
    }

    fn spawn_fetch(&self, request: &MarketRequest) -> Result<PendingFetch, DataError> {
        let (tx, rx) = mpsc::channel();
        let source = Arc::clone(&self.source);
        let req = request.clone();
        thread::Builder::new()
            .name("evolab-fetch".into())
            .spawn(move || {
                let _ = tx.send(source.fetch_ohlcv(&req));
            })
            .map_err(|e| DataError::Io(format!("failed to spawn fetch thread: {e}")))?;
        Ok(PendingFetch {
            limit: request.limit,
            started: Instant::now(),
            rx,
        })
    }

    /// Take over a parked call for this key if it can answer `request`.
    /// A parked call that cannot is dropped; its thread ends into a closed
    /// channel.
    fn resume_pending(&self, request: &MarketRequest) -> Option<PendingFetch> {
        let parked = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&request.key)?;
        let max_age = self.ttl.to_std().unwrap_or(Duration::MAX);
        if parked.limit < request.limit || parked.started.elapsed() >= max_age {
            return None;
        }
        self.stats.resumed.fetch_add(1, Ordering::Relaxed);
        debug!(market = %request.key, "waiting on parked source call");
        Some(parked)
    }

    fn park(&self, key: &MarketKey, fetch: PendingFetch) {
        debug!(market = %key, "source call still running; parking it");
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone(), fetch);
    }

    pub fn invalidate(&self, key: &MarketKey) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sources must honour the contract: at most `limit` bars, ascending.
fn validate(key: &MarketKey, limit: usize, series: &OhlcvSeries) -> Result<(), DataError> {
    if !series.is_ascending() {
        return Err(DataError::InvalidData(format!(
            "{key} returned bars out of order"
        )));
    }
    if series.len() > limit {
        return Err(DataError::InvalidData(format!(
            "{key} returned {} bars for limit {limit}",
            series.len(),
        )));
    }
    Ok(())
}

fn fit_to_limit(series: Arc<OhlcvSeries>, limit: usize) -> Arc<OhlcvSeries> {
    if series.len() <= limit {
        return series;
    }
    let mut trimmed = (*series).clone();
    trimmed.truncate_to_recent(limit);
    Arc::new(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::data::memory::InMemorySource;
    use crate::domain::{OhlcvBar, Timeframe};
    use chrono::TimeZone;
    use std::sync::Barrier;

    fn series(n: usize) -> OhlcvSeries {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        OhlcvSeries::new(
            (0..n)
                .map(|i| OhlcvBar {
                    timestamp: start + chrono::Duration::hours(i as i64),
                    open: 100.0,
                    high: 101.0,
                    low: 99.0,
                    close: 100.0,
                    volume: 1.0,
                })
                .collect(),
        )
    }

    fn key() -> MarketKey {
        MarketKey::new("test", "BTCUSDT", Timeframe::H1)
    }

    fn setup() -> (Arc<InMemorySource>, Arc<ManualClock>, SeriesCache) {
        let source = Arc::new(InMemorySource::new().with_series(key(), series(100)));
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()));
        let cache = SeriesCache::new(
            source.clone(),
            clock.clone(),
            Duration::from_secs(DEFAULT_TTL_SECS),
            Duration::from_secs(5),
        );
        (source, clock, cache)
    }

    #[test]
    fn second_get_is_a_hit() {
        let (source, _clock, cache) = setup();
        let req = MarketRequest { key: key(), limit: 50 };
        let cancel = CancelToken::default();
        assert_eq!(cache.get(&req, &cancel).unwrap().len(), 50);
        assert_eq!(cache.get(&req, &cancel).unwrap().len(), 50);
        assert_eq!(source.calls(), 1);
        assert_eq!(cache.stats().hits(), 1);
        assert_eq!(cache.stats().misses(), 1);
    }

    #[test]
    fn entry_expires_after_ttl() {
        let (source, clock, cache) = setup();
        let req = MarketRequest { key: key(), limit: 50 };
        let cancel = CancelToken::default();
        cache.get(&req, &cancel).unwrap();
        clock.advance(chrono::Duration::seconds(DEFAULT_TTL_SECS as i64));
        cache.get(&req, &cancel).unwrap();
        assert_eq!(source.calls(), 2);
    }

    #[test]
    fn smaller_limit_served_from_wider_entry() {
        let (source, _clock, cache) = setup();
        let cancel = CancelToken::default();
        cache.get(&MarketRequest { key: key(), limit: 80 }, &cancel).unwrap();
        let narrow = cache.get(&MarketRequest { key: key(), limit: 20 }, &cancel).unwrap();
        assert_eq!(narrow.len(), 20);
        assert_eq!(source.calls(), 1);
        cache.get(&MarketRequest { key: key(), limit: 90 }, &cancel).unwrap();
        assert_eq!(source.calls(), 2);
    }

    #[test]
    fn failures_are_not_cached() {
        let (source, _clock, cache) = setup();
        source.fail_with(key(), DataError::ServerError { status: 503 });
        let req = MarketRequest { key: key(), limit: 50 };
        let cancel = CancelToken::default();
        assert!(cache.get(&req, &cancel).unwrap_err().is_transient());
        assert!(cache.get(&req, &cancel).is_err());
        assert_eq!(source.calls(), 2);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().fetch_failures(), 2);
    }

    /// Blocks every fetch until released, counting calls.
    struct SlowSource {
        inner: InMemorySource,
        delay: Duration,
    }

    impl MarketDataSource for SlowSource {
        fn name(&self) -> &str {
            "slow"
        }

        fn fetch_ohlcv(&self, request: &MarketRequest) -> Result<OhlcvSeries, DataError> {
            thread::sleep(self.delay);
            self.inner.fetch_ohlcv(request)
        }
    }

    #[test]
    fn concurrent_misses_coalesce() {
        let slow = Arc::new(SlowSource {
            inner: InMemorySource::new().with_series(key(), series(100)),
            delay: Duration::from_millis(200),
        });
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()));
        let cache = Arc::new(SeriesCache::new(
            slow.clone(),
            clock,
            Duration::from_secs(3600),
            Duration::from_secs(5),
        ));
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    cache
                        .get(&MarketRequest { key: key(), limit: 60 }, &CancelToken::default())
                        .map(|s| s.len())
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap().unwrap(), 60);
        }
        assert_eq!(slow.inner.calls(), 1);
        assert_eq!(cache.stats().misses(), 1);
        assert_eq!(cache.stats().coalesced(), 7);
    }

    #[test]
    fn slow_source_times_out() {
        let slow = Arc::new(SlowSource {
            inner: InMemorySource::new().with_series(key(), series(100)),
            delay: Duration::from_millis(500),
        });
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()));
        let cache = SeriesCache::new(slow, clock, Duration::from_secs(3600), Duration::from_millis(50));
        let err = cache
            .get(&MarketRequest { key: key(), limit: 60 }, &CancelToken::default())
            .unwrap_err();
        assert_eq!(err, DataError::Timeout { after_ms: 50 });
        assert!(err.is_transient());
    }

    /// Sleeps before answering and counts how often it was called.
    struct HangingSource {
        delay: Duration,
        calls: AtomicU64,
    }

    impl HangingSource {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                calls: AtomicU64::new(0),
            }
        }

        fn calls(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl MarketDataSource for HangingSource {
        fn name(&self) -> &str {
            "hanging"
        }

        fn fetch_ohlcv(&self, request: &MarketRequest) -> Result<OhlcvSeries, DataError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            Ok(series(request.limit))
        }
    }

    #[test]
    fn stalled_call_is_resumed_not_respawned() {
        let source = Arc::new(HangingSource::new(Duration::from_millis(300)));
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()));
        let cache = SeriesCache::new(
            source.clone(),
            clock,
            Duration::from_secs(3600),
            Duration::from_millis(50),
        );
        let req = MarketRequest { key: key(), limit: 60 };
        let cancel = CancelToken::default();
        for _ in 0..3 {
            assert!(matches!(cache.get(&req, &cancel), Err(DataError::Timeout { .. })));
        }
        assert_eq!(source.calls(), 1);

        // The original call lands and the next leader picks it up.
        thread::sleep(Duration::from_millis(400));
        assert_eq!(cache.get(&req, &cancel).unwrap().len(), 60);
        assert_eq!(source.calls(), 1);
        assert_eq!(cache.stats().resumed(), 3);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn deadline_cuts_wait_short() {
        let source = Arc::new(HangingSource::new(Duration::from_secs(2)));
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()));
        let cache = SeriesCache::new(source, clock, Duration::from_secs(3600), Duration::from_secs(30));
        let started = Instant::now();
        let err = cache
            .get_before(
                &MarketRequest { key: key(), limit: 60 },
                started + Duration::from_millis(100),
                &CancelToken::default(),
            )
            .unwrap_err();
        assert!(matches!(err, DataError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn expired_grace_abandons_fetch() {
        let slow = Arc::new(SlowSource {
            inner: InMemorySource::new().with_series(key(), series(100)),
            delay: Duration::from_millis(500),
        });
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()));
        let cache = SeriesCache::new(slow, clock, Duration::from_secs(3600), Duration::from_secs(5));
        let cancel = CancelToken::new(Duration::ZERO);
        cancel.cancel();
        let err = cache
            .get(&MarketRequest { key: key(), limit: 60 }, &cancel)
            .unwrap_err();
        assert_eq!(err, DataError::Cancelled);
    }
}
