//! Parallel evaluation of one population on a private rayon pool.
//!
//! Workers receive descriptors by reference and return outcomes by value, in
//! population order. They poll cancellation and the tick deadline before each
//! descriptor and while backing off between fetch retries. No fetch waits
//! past the tick deadline. Market data comes through the shared
//! [`SeriesCache`], so concurrent workers coalesce onto a single fetch.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, warn};

use evolab_core::backtest::EvaluationError;
use evolab_core::data::{DataError, MarketRequest, SeriesCache};
use evolab_core::domain::{BacktestResult, OhlcvSeries, StrategyDescriptor};
use evolab_core::{BacktestEvaluator, CancelToken, ParameterSchema};

/// Why a descriptor got a zeroed result this tick.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EvaluationFailure {
    #[error("market data: {0}")]
    Data(DataError),
    #[error("market data still failing after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: DataError },
    #[error("backtest: {0}")]
    Backtest(String),
    #[error("evaluation deadline exceeded")]
    DeadlineExceeded,
}

/// Result of one descriptor's evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Evaluated(BacktestResult),
    Failed(EvaluationFailure),
    /// Not evaluated because the engine is shutting down.
    Cancelled,
}

impl Outcome {
    /// The result to record: failures score as the zeroed result.
    pub fn result(&self) -> Option<BacktestResult> {
        match self {
            Outcome::Evaluated(result) => Some(*result),
            Outcome::Failed(_) => Some(BacktestResult::zeroed()),
            Outcome::Cancelled => None,
        }
    }
}

/// Retry and deadline policy for one evaluation phase.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (0-based): `base × 2^attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(16))
    }
}

pub struct EvaluationPool {
    pool: rayon::ThreadPool,
    cache: Arc<SeriesCache>,
    evaluator: BacktestEvaluator,
    retry: RetryPolicy,
}

impl EvaluationPool {
    pub fn new(
        workers: usize,
        cache: Arc<SeriesCache>,
        evaluator: BacktestEvaluator,
        retry: RetryPolicy,
    ) -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("evolab-eval-{i}"))
            .build()?;
        Ok(Self {
            pool,
            cache,
            evaluator,
            retry,
        })
    }

    pub fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn cache(&self) -> &SeriesCache {
        &self.cache
    }

    /// Evaluate every descriptor against `request`. Blocks until all workers
    /// are done; the output is index-aligned with `population`.
    pub fn evaluate_all(
        &self,
        population: &[StrategyDescriptor],
        schema: &ParameterSchema,
        request: &MarketRequest,
        deadline: Instant,
        cancel: &CancelToken,
    ) -> Vec<Outcome> {
        self.pool.install(|| {
            population
                .par_iter()
                .map(|descriptor| self.evaluate_one(descriptor, schema, request, deadline, cancel))
                .collect()
        })
    }

    fn evaluate_one(
        &self,
        descriptor: &StrategyDescriptor,
        schema: &ParameterSchema,
        request: &MarketRequest,
        deadline: Instant,
        cancel: &CancelToken,
    ) -> Outcome {
        if cancel.is_cancelled() {
            return Outcome::Cancelled;
        }
        if Instant::now() >= deadline {
            return self.failed(descriptor, EvaluationFailure::DeadlineExceeded);
        }

        let series = match self.fetch_with_retry(request, deadline, cancel) {
            Ok(series) => series,
            Err(None) => return Outcome::Cancelled,
            Err(Some(failure)) => return self.failed(descriptor, failure),
        };

        match self.evaluator.try_evaluate(descriptor, schema, &series) {
            Ok(result) => {
                debug!(id = %descriptor.id, kind = %descriptor.kind, total_return = result.total_return, "descriptor evaluated");
                Outcome::Evaluated(result)
            }
            Err(e) => self.failed(descriptor, backtest_failure(e)),
        }
    }

    /// `Err(None)` means cancelled.
    fn fetch_with_retry(
        &self,
        request: &MarketRequest,
        deadline: Instant,
        cancel: &CancelToken,
    ) -> Result<Arc<OhlcvSeries>, Option<EvaluationFailure>> {
        let max = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match self.cache.get_before(request, deadline, cancel) {
                Ok(series) => return Ok(series),
                Err(DataError::Cancelled) => return Err(None),
                Err(e) if !e.is_transient() => return Err(Some(EvaluationFailure::Data(e))),
                Err(e) => {
                    attempt += 1;
                    if attempt >= max {
                        return Err(Some(EvaluationFailure::RetriesExhausted {
                            attempts: attempt,
                            last: e,
                        }));
                    }
                    let delay = self.retry.delay(attempt - 1);
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if delay >= remaining {
                        return Err(Some(EvaluationFailure::DeadlineExceeded));
                    }
                    debug!(%request, attempt, delay_ms = delay.as_millis() as u64, error = %e, "transient fetch failure; backing off");
                    if cancel.wait_timeout(delay) {
                        return Err(None);
                    }
                }
            }
        }
    }

    fn failed(&self, descriptor: &StrategyDescriptor, failure: EvaluationFailure) -> Outcome {
        warn!(
            event = "evaluation_failed",
            id = %descriptor.id,
            kind = %descriptor.kind,
            error = %failure,
            "descriptor evaluation failed; scoring zero"
        );
        Outcome::Failed(failure)
    }
}

fn backtest_failure(e: EvaluationError) -> EvaluationFailure {
    EvaluationFailure::Backtest(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use evolab_core::data::{InMemorySource, MarketDataSource};
    use evolab_core::domain::{OhlcvBar, Timeframe};
    use evolab_core::{ManualClock, RngHierarchy};
    use std::collections::BTreeMap;

    use crate::config::EvolutionConfig;
    use crate::operators::GeneticOperators;

    fn request() -> MarketRequest {
        MarketRequest::new("test", "BTCUSDT", Timeframe::H1, 200)
    }

    fn series(n: usize) -> OhlcvSeries {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        OhlcvSeries::new(
            (0..n)
                .map(|i| {
                    let c = 100.0 + 10.0 * ((i as f64) / 7.0).sin();
                    OhlcvBar {
                        timestamp: start + ChronoDuration::hours(i as i64),
                        open: c,
                        high: c + 1.0,
                        low: c - 1.0,
                        close: c,
                        volume: 1.0,
                    }
                })
                .collect(),
        )
    }

    fn population(schema: &ParameterSchema) -> Vec<StrategyDescriptor> {
        let config = EvolutionConfig {
            population_size: 6,
            elite_size: 2,
            parameter_ranges: schema.ranges(),
            ..Default::default()
        };
        GeneticOperators::new(&config, schema).genesis(
            &mut RngHierarchy::new(3).rng_for("genesis", 0),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        )
    }

    fn pool(source: Arc<InMemorySource>, attempts: u32) -> EvaluationPool {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
        ));
        let cache = Arc::new(SeriesCache::new(
            source as Arc<dyn MarketDataSource>,
            clock,
            Duration::from_secs(3600),
            Duration::from_secs(5),
        ));
        EvaluationPool::new(
            2,
            cache,
            BacktestEvaluator::default(),
            RetryPolicy {
                max_attempts: attempts,
                base_delay: Duration::from_millis(1),
            },
        )
        .unwrap()
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    fn schema() -> ParameterSchema {
        ParameterSchema::from_ranges(&ParameterSchema::default_ranges()).unwrap()
    }

    #[test]
    fn evaluates_every_descriptor_in_order() {
        let schema = schema();
        let pop = population(&schema);
        let source = Arc::new(InMemorySource::new().with_series(request().key, series(200)));
        let pool = pool(source.clone(), 3);

        let out = pool.evaluate_all(&pop, &schema, &request(), far_deadline(), &CancelToken::default());
        assert_eq!(out.len(), pop.len());
        assert!(out.iter().all(|o| matches!(o, Outcome::Evaluated(_))));
        assert_eq!(source.calls(), 1);

        let evaluator = BacktestEvaluator::default();
        for (d, o) in pop.iter().zip(&out) {
            assert_eq!(
                o.result(),
                Some(evaluator.evaluate(d, &schema, &series(200)))
            );
        }
    }

    #[test]
    fn permanent_failure_is_not_retried() {
        let schema = schema();
        let pop = population(&schema);
        let source = Arc::new(InMemorySource::new());
        source.fail_with(
            request().key,
            DataError::SymbolNotFound {
                symbol: "BTCUSDT".into(),
            },
        );
        let pool = pool(source.clone(), 3);
        let out = pool.evaluate_all(&pop, &schema, &request(), far_deadline(), &CancelToken::default());
        assert!(out
            .iter()
            .all(|o| matches!(o, Outcome::Failed(EvaluationFailure::Data(_)))));
        assert!(out.iter().all(|o| o.result() == Some(BacktestResult::zeroed())));
    }

    #[test]
    fn transient_failure_exhausts_retries() {
        let schema = schema();
        let pop = population(&schema)[..1].to_vec();
        let source = Arc::new(InMemorySource::new());
        source.fail_with(request().key, DataError::ServerError { status: 503 });
        let pool = pool(source.clone(), 3);
        let out = pool.evaluate_all(&pop, &schema, &request(), far_deadline(), &CancelToken::default());
        assert_eq!(
            out[0],
            Outcome::Failed(EvaluationFailure::RetriesExhausted {
                attempts: 3,
                last: DataError::ServerError { status: 503 },
            })
        );
        assert_eq!(source.calls(), 3);
    }

    #[test]
    fn short_series_fails_backtest() {
        let schema = schema();
        let pop = population(&schema);
        let source = Arc::new(InMemorySource::new().with_series(request().key, series(20)));
        let pool = pool(source, 1);
        let out = pool.evaluate_all(&pop, &schema, &request(), far_deadline(), &CancelToken::default());
        assert!(out
            .iter()
            .all(|o| matches!(o, Outcome::Failed(EvaluationFailure::Backtest(_)))));
    }

    #[test]
    fn cancelled_before_start_skips_everything() {
        let schema = schema();
        let pop = population(&schema);
        let source = Arc::new(InMemorySource::new().with_series(request().key, series(200)));
        let pool = pool(source.clone(), 3);
        let cancel = CancelToken::default();
        cancel.cancel();
        let out = pool.evaluate_all(&pop, &schema, &request(), far_deadline(), &cancel);
        assert!(out.iter().all(|o| *o == Outcome::Cancelled));
        assert_eq!(source.calls(), 0);
    }

    #[test]
    fn expired_deadline_zeroes_results() {
        let schema = schema();
        let pop = population(&schema);
        let source = Arc::new(InMemorySource::new().with_series(request().key, series(200)));
        let pool = pool(source, 3);
        let out = pool.evaluate_all(&pop, &schema, &request(), Instant::now(), &CancelToken::default());
        assert!(out
            .iter()
            .all(|o| *o == Outcome::Failed(EvaluationFailure::DeadlineExceeded)));
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(250));
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_millis(1000));
    }

    #[test]
    fn schema_unused_names_fall_back() {
        // A single-parameter schema still evaluates with the default periods.
        let schema =
            ParameterSchema::from_ranges(&BTreeMap::from([("p".to_string(), (0.0, 1.0))])).unwrap();
        let pop = population(&schema);
        let source = Arc::new(InMemorySource::new().with_series(request().key, series(200)));
        let pool = pool(source, 1);
        let out = pool.evaluate_all(&pop, &schema, &request(), far_deadline(), &CancelToken::default());
        assert!(out.iter().all(|o| matches!(o, Outcome::Evaluated(_))));
    }
}
