//! The evolution control loop.
//!
//! One controlling thread owns the population and state. Each tick:
//!
//! 1. evaluate the population on the worker pool (the only parallel phase),
//! 2. rank, summarize and append a history record,
//! 3. decide whether to evolve (cadence, underperformance, drawdown),
//! 4. run the genetic operators if so,
//! 5. validate invariants, commit, checkpoint and publish the snapshot.
//!
//! A tick works on a copy of the state and commits only after validation, so
//! an invariant violation leaves both memory and disk at the last good state.

use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use evolab_core::data::{DataError, MarketDataSource, MarketRequest, SeriesCache};
use evolab_core::domain::StrategyDescriptor;
use evolab_core::rng::streams;
use evolab_core::{BacktestEvaluator, CancelToken, Clock, ParameterSchema, RngHierarchy};

use crate::config::{ConfigError, EngineConfig, EvolutionConfig};
use crate::evaluation::{EvaluationPool, Outcome, RetryPolicy};
use crate::operators::GeneticOperators;
use crate::population::{self, InvariantViolation};
use crate::query::{EngineSnapshot, QueryHandle};
use crate::state::{EvolutionState, EvolutionTrigger, GenerationRecord, PerformanceMetrics};
use crate::store::{PopulationStore, StoreError};

/// How often the idle sleep checks for the stop file.
const STOP_FILE_POLL: Duration = Duration::from_millis(250);

/// Cadence intervals beyond a century are treated as a century.
const MAX_INTERVAL_SECS: u64 = 100 * 365 * 24 * 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnginePhase {
    Initializing,
    Idle,
    Evaluating,
    Evolving,
    Stopping,
    Terminated,
}

/// Errors that stop the engine. Everything else is logged and absorbed.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("invariant violated: {0}")]
    Invariant(#[from] InvariantViolation),
    #[error("checkpoint: {0}")]
    Store(#[from] StoreError),
    #[error("market data source: {0}")]
    Source(#[from] DataError),
    #[error("worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error("failed to spawn scheduler thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("scheduler thread panicked")]
    Panicked,
}

/// What one tick did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickReport {
    pub tick: u64,
    /// Generation after the tick.
    pub generation: u64,
    pub evaluated: usize,
    pub failed: usize,
    pub skipped: usize,
    pub best_fitness: f64,
    pub avg_fitness: f64,
    pub max_drawdown: f64,
    pub evolved: Option<EvolutionTrigger>,
    /// Cancellation arrived mid-evaluation; nothing was committed.
    pub interrupted: bool,
    pub checkpoint_written: bool,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Cancelled,
    StopFile,
    MaxTicks,
}

/// Outcome of [`EvolutionScheduler::run`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub ticks: u64,
    pub generation: u64,
    pub best_fitness: f64,
    pub stop_reason: StopReason,
}

/// Which trigger, if any, calls for a new generation.
///
/// Cadence always counts. The fitness and drawdown overrides only count when
/// at least one descriptor was evaluated successfully.
pub fn evolution_trigger(
    config: &EvolutionConfig,
    state: &EvolutionState,
    now: DateTime<Utc>,
) -> Option<EvolutionTrigger> {
    let secs = config.evolution_interval_secs.min(MAX_INTERVAL_SECS) as i64;
    if now - state.last_evolution_at >= chrono::Duration::seconds(secs) {
        return Some(EvolutionTrigger::Cadence);
    }
    if state.performance_metrics.evaluated == 0 {
        return None;
    }
    if state.best_fitness < config.min_fitness_threshold {
        return Some(EvolutionTrigger::Underperformance);
    }
    if state.performance_metrics.max_drawdown > config.max_drawdown_threshold {
        return Some(EvolutionTrigger::Drawdown);
    }
    None
}

pub struct EvolutionScheduler {
    config: EngineConfig,
    schema: ParameterSchema,
    request: MarketRequest,
    clock: Arc<dyn Clock>,
    rng: RngHierarchy,
    pool: EvaluationPool,
    store: PopulationStore,
    state: EvolutionState,
    query: QueryHandle,
    cancel: CancelToken,
    phase: EnginePhase,
    ticks: u64,
    stop_reason: Option<StopReason>,
}

impl EvolutionScheduler {
    /// Build the adapter named in `config.source`, then [`Self::new`].
    pub fn from_config(config: EngineConfig, clock: Arc<dyn Clock>) -> Result<Self, EngineError> {
        let source = config
            .source
            .build(&config.market, &config.runtime, clock.now())?;
        Self::new(config, source, clock)
    }

    /// Validate the configuration, load or create the state and go idle.
    pub fn new(
        mut config: EngineConfig,
        source: Arc<dyn MarketDataSource>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EngineError> {
        let schema = config.validate()?;
        let runtime = &config.runtime;
        let rng = RngHierarchy::new(runtime.master_seed);
        let now = clock.now();

        let cache = Arc::new(SeriesCache::new(
            Arc::clone(&source),
            Arc::clone(&clock),
            runtime.cache_ttl(),
            runtime.request_timeout(),
        ));
        let pool = EvaluationPool::new(
            runtime.worker_threads(),
            cache,
            BacktestEvaluator::new(runtime.initial_capital),
            RetryPolicy {
                max_attempts: runtime.max_fetch_attempts,
                base_delay: runtime.retry_base_delay(),
            },
        )?;
        let store = PopulationStore::new(
            runtime.checkpoint_path.clone(),
            schema.clone(),
            runtime.master_seed,
        );

        let placeholder = EvolutionState::fresh(Vec::new(), runtime.history_capacity, now);
        let query = QueryHandle::new(
            EngineSnapshot {
                phase: EnginePhase::Initializing,
                ticks: 0,
                state: Arc::new(placeholder.clone()),
            },
            config.evolution.clone(),
            schema.clone(),
        );

        info!(
            source = source.name(),
            market = %config.market.request(),
            population_size = config.evolution.population_size,
            elite_size = config.evolution.elite_size,
            workers = pool.workers(),
            checkpoint = %runtime.checkpoint_path.display(),
            "engine initializing"
        );

        let cancel = CancelToken::new(runtime.grace());
        let request = config.market.request();
        let mut scheduler = Self {
            request,
            cancel,
            config,
            schema,
            clock,
            rng,
            pool,
            store,
            state: placeholder,
            query,
            phase: EnginePhase::Initializing,
            ticks: 0,
            stop_reason: None,
        };
        scheduler.initialize(now)?;
        Ok(scheduler)
    }

    fn initialize(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        let evo = &self.config.evolution;
        let capacity = self.config.runtime.history_capacity;
        let loaded = match self.store.load(&evo.weights, evo.population_size) {
            Ok(mut state) => {
                state.history.set_capacity(capacity);
                info!(
                    generation = state.current_generation,
                    population = state.population.len(),
                    best_fitness = state.best_fitness,
                    "resumed from checkpoint"
                );
                Some(state)
            }
            Err(StoreError::NotFound(path)) => {
                info!(path = %path.display(), "no checkpoint found; starting fresh");
                None
            }
            Err(e) if e.is_recoverable_on_load() => {
                let quarantined = self.store.quarantine();
                error!(
                    event = "checkpoint_corrupt",
                    error = %e,
                    moved_to = ?quarantined,
                    "discarding unusable checkpoint; starting fresh"
                );
                None
            }
            Err(e) => return Err(e.into()),
        };

        let fresh = loaded.is_none();
        let mut state = loaded.unwrap_or_else(|| EvolutionState::fresh(Vec::new(), capacity, now));
        if state.population.is_empty() {
            let mut rng = self.rng.rng_for(streams::GENESIS, state.current_generation);
            state.population = GeneticOperators::new(evo, &self.schema).genesis(&mut rng, now);
            state.refresh_fitness_summary();
            info!(
                generation = state.current_generation,
                population = state.population.len(),
                "created random population"
            );
        }
        population::validate(&state.population, &self.schema, evo.population_size, &evo.weights)
            .map_err(|v| {
                error!(event = "invariant_violated", error = %v, "initial population is invalid");
                v
            })?;

        self.state = state;
        if fresh {
            self.checkpoint();
        }
        self.publish();
        self.set_phase(EnginePhase::Idle);
        Ok(())
    }

    pub fn query(&self) -> QueryHandle {
        self.query.clone()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn phase(&self) -> EnginePhase {
        self.phase
    }

    pub fn state(&self) -> &EvolutionState {
        &self.state
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn schema(&self) -> &ParameterSchema {
        &self.schema
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn cache_stats(&self) -> &evolab_core::data::CacheStats {
        self.pool.cache().stats()
    }

    fn set_phase(&mut self, phase: EnginePhase) {
        if self.phase != phase {
            debug!(from = ?self.phase, to = ?phase, "phase change");
            self.phase = phase;
            self.query.set_phase(phase);
        }
    }

    fn publish(&self) {
        self.query.publish(EngineSnapshot {
            phase: self.phase,
            ticks: self.ticks,
            state: Arc::new(self.state.clone()),
        });
    }

    /// Persist the committed state. Failures are logged and retried next tick.
    fn checkpoint(&mut self) -> bool {
        match self.store.checkpoint(&self.state) {
            Ok(()) => {
                debug!(
                    event = "checkpoint_written",
                    generation = self.state.current_generation,
                    path = %self.store.path().display(),
                    "checkpoint written"
                );
                true
            }
            Err(e) => {
                warn!(event = "checkpoint_failed", error = %e, "checkpoint failed; keeping in-memory state");
                false
            }
        }
    }

    /// Run one evaluate → (evolve) → checkpoint cycle.
    pub fn tick(&mut self) -> Result<TickReport, EngineError> {
        let started = Instant::now();
        let tick = self.ticks + 1;
        let weights = self.config.evolution.weights;
        info!(
            event = "tick_start",
            tick,
            generation = self.state.current_generation,
            population = self.state.population.len(),
            "tick start"
        );

        self.set_phase(EnginePhase::Evaluating);
        let deadline = started + self.config.runtime.evaluation_deadline();
        let outcomes = self.pool.evaluate_all(
            &self.state.population,
            &self.schema,
            &self.request,
            deadline,
            &self.cancel,
        );

        let skipped = outcomes.iter().filter(|o| **o == Outcome::Cancelled).count();
        if skipped > 0 || self.cancel.is_cancelled() {
            info!(tick, skipped, "tick interrupted by cancellation; discarding partial results");
            self.set_phase(EnginePhase::Idle);
            return Ok(TickReport {
                tick,
                generation: self.state.current_generation,
                evaluated: 0,
                failed: 0,
                skipped: outcomes.len(),
                best_fitness: self.state.best_fitness,
                avg_fitness: self.state.avg_fitness,
                max_drawdown: self.state.performance_metrics.max_drawdown,
                evolved: None,
                interrupted: true,
                checkpoint_written: false,
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
        }

        let now = self.clock.now();
        let mut working = self.state.clone();
        let mut results = Vec::with_capacity(outcomes.len());
        let mut failed = 0;
        for (descriptor, outcome) in working.population.iter_mut().zip(&outcomes) {
            match outcome {
                Outcome::Evaluated(result) => {
                    descriptor.record_evaluation(*result, &weights, now);
                    results.push(*descriptor.performance());
                }
                Outcome::Failed(_) | Outcome::Cancelled => {
                    descriptor.reset_performance(now);
                    failed += 1;
                }
            }
        }
        population::rank(&mut working.population);
        working.refresh_fitness_summary();
        working.performance_metrics = PerformanceMetrics::aggregate(&results, failed);

        let warming_up = working.is_unevaluated();
        working.history.push(GenerationRecord {
            generation: working.current_generation,
            timestamp: now,
            best_fitness: working.best_fitness,
            avg_fitness: working.avg_fitness,
            population_size: working.population.len(),
            metrics: working.performance_metrics,
            trigger: None,
        });

        let trigger = if warming_up {
            debug!(tick, "first evaluation of this population; not evolving");
            None
        } else {
            evolution_trigger(&self.config.evolution, &working, now)
        };

        if let Some(trigger) = trigger {
            self.set_phase(EnginePhase::Evolving);
            let evo = &self.config.evolution;
            let generation = working.current_generation + 1;
            let mut rng = self.rng.rng_for(streams::OPERATORS, generation);
            working.population = GeneticOperators::new(evo, &self.schema).next_generation(
                &working.population,
                generation,
                &mut rng,
                now,
            );
            working.current_generation = generation;
            working.last_evolution_at = now;
            if let Some(record) = working.history.last_mut() {
                record.trigger = Some(trigger);
            }
            info!(
                event = "generation_advanced",
                generation,
                trigger = trigger.as_str(),
                best_fitness = working.best_fitness,
                "generation advanced"
            );
        }

        let evo = &self.config.evolution;
        if let Err(violation) =
            population::validate(&working.population, &self.schema, evo.population_size, &evo.weights)
        {
            error!(event = "invariant_violated", tick, error = %violation, "aborting tick; state not persisted");
            self.set_phase(EnginePhase::Terminated);
            return Err(violation.into());
        }

        self.state = working;
        self.ticks = tick;
        let checkpoint_written = self.checkpoint();
        self.set_phase(EnginePhase::Idle);
        self.publish();

        let report = TickReport {
            tick,
            generation: self.state.current_generation,
            evaluated: results.len(),
            failed,
            skipped: 0,
            best_fitness: self.state.best_fitness,
            avg_fitness: self.state.avg_fitness,
            max_drawdown: self.state.performance_metrics.max_drawdown,
            evolved: trigger,
            interrupted: false,
            checkpoint_written,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            event = "tick_end",
            tick,
            generation = report.generation,
            evaluated = report.evaluated,
            failed = report.failed,
            best_fitness = report.best_fitness,
            avg_fitness = report.avg_fitness,
            evolved = report.evolved.map(|t| t.as_str()),
            elapsed_ms = report.elapsed_ms,
            "tick end"
        );
        Ok(report)
    }

    /// Tick until cancelled, the stop file appears or `max_ticks` is reached,
    /// then write a final checkpoint.
    pub fn run(&mut self) -> Result<RunSummary, EngineError> {
        let stop_file = self.config.runtime.stop_file.clone();
        if stop_file.exists() {
            warn!(path = %stop_file.display(), "removing stale stop file");
            let _ = std::fs::remove_file(&stop_file);
        }
        let interval = self.config.runtime.tick_interval();
        let max_ticks = self.config.runtime.max_ticks;

        loop {
            if self.should_stop(&stop_file) {
                break;
            }
            if max_ticks.is_some_and(|max| self.ticks >= max) {
                self.stop_reason = Some(StopReason::MaxTicks);
                break;
            }
            let report = self.tick()?;
            if report.interrupted {
                self.stop_reason = self.stop_reason.or(Some(StopReason::Cancelled));
                break;
            }
            if max_ticks.is_some_and(|max| self.ticks >= max) {
                self.stop_reason = Some(StopReason::MaxTicks);
                break;
            }
            if self.idle(interval, &stop_file) {
                break;
            }
        }
        self.shutdown()
    }

    /// Sleep for one tick interval. Returns true when asked to stop.
    fn idle(&mut self, interval: Duration, stop_file: &Path) -> bool {
        let wake = Instant::now() + interval;
        loop {
            if self.should_stop(stop_file) {
                return true;
            }
            let remaining = wake.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            if self.cancel.wait_timeout(remaining.min(STOP_FILE_POLL)) {
                self.should_stop(stop_file);
                return true;
            }
        }
    }

    fn should_stop(&mut self, stop_file: &Path) -> bool {
        if self.cancel.is_cancelled() {
            self.stop_reason = self.stop_reason.or(Some(StopReason::Cancelled));
            return true;
        }
        if stop_file.exists() {
            info!(path = %stop_file.display(), "stop file found");
            let _ = std::fs::remove_file(stop_file);
            self.stop_reason = Some(StopReason::StopFile);
            self.cancel.cancel();
            return true;
        }
        false
    }

    fn shutdown(&mut self) -> Result<RunSummary, EngineError> {
        let stop_reason = self.stop_reason.unwrap_or(StopReason::Cancelled);
        if stop_reason != StopReason::MaxTicks {
            info!(event = "cancellation_received", reason = ?stop_reason, "stopping");
        }
        self.set_phase(EnginePhase::Stopping);
        let result = self.store.checkpoint(&self.state);
        self.set_phase(EnginePhase::Terminated);
        result.map_err(|e| {
            error!(event = "checkpoint_failed", error = %e, "final checkpoint failed");
            e
        })?;
        info!(
            event = "checkpoint_written",
            generation = self.state.current_generation,
            ticks = self.ticks,
            "final checkpoint written"
        );
        Ok(RunSummary {
            ticks: self.ticks,
            generation: self.state.current_generation,
            best_fitness: self.state.best_fitness,
            stop_reason,
        })
    }

    /// Ranked copies of the best `k` descriptors.
    pub fn top(&self, k: usize) -> Vec<StrategyDescriptor> {
        self.state.population.iter().take(k).cloned().collect()
    }
}

/// A scheduler running on its own named thread.
pub struct EngineHandle {
    cancel: CancelToken,
    query: QueryHandle,
    thread: JoinHandle<Result<RunSummary, EngineError>>,
}

impl EngineHandle {
    pub fn spawn(mut scheduler: EvolutionScheduler) -> Result<Self, EngineError> {
        let cancel = scheduler.cancel_token();
        let query = scheduler.query();
        let thread = thread::Builder::new()
            .name("evolab-scheduler".into())
            .spawn(move || scheduler.run())
            .map_err(EngineError::Spawn)?;
        Ok(Self {
            cancel,
            query,
            thread,
        })
    }

    /// Request a graceful shutdown.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn query(&self) -> &QueryHandle {
        &self.query
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the scheduler thread to terminate.
    pub fn join(self) -> Result<RunSummary, EngineError> {
        self.thread.join().map_err(|_| EngineError::Panicked)?
    }
}
