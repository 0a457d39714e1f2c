//! The durable evolution snapshot and its bounded history.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use evolab_core::domain::{BacktestResult, StrategyDescriptor};

/// Why a generation was advanced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvolutionTrigger {
    /// `evolution_interval_secs` elapsed since the last generation.
    Cadence,
    /// Best fitness fell below `min_fitness_threshold`.
    Underperformance,
    /// Observed drawdown exceeded `max_drawdown_threshold`.
    Drawdown,
}

impl EvolutionTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvolutionTrigger::Cadence => "cadence",
            EvolutionTrigger::Underperformance => "underperformance",
            EvolutionTrigger::Drawdown => "drawdown",
        }
    }
}

/// Aggregate over the descriptors evaluated successfully in one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub avg_return: f64,
    pub avg_sharpe: f64,
    /// Worst drawdown of any evaluated descriptor.
    pub max_drawdown: f64,
    pub avg_win_rate: f64,
    pub avg_profit_factor: f64,
    pub total_trades: u64,
    pub evaluated: usize,
    pub failed: usize,
}

impl PerformanceMetrics {
    pub fn aggregate(results: &[BacktestResult], failed: usize) -> Self {
        let n = results.len();
        if n == 0 {
            return Self {
                failed,
                ..Self::default()
            };
        }
        let mean = |f: fn(&BacktestResult) -> f64| results.iter().map(f).sum::<f64>() / n as f64;
        Self {
            avg_return: mean(|r| r.total_return),
            avg_sharpe: mean(|r| r.sharpe_ratio),
            max_drawdown: results.iter().map(|r| r.max_drawdown).fold(0.0, f64::max),
            avg_win_rate: mean(|r| r.win_rate),
            avg_profit_factor: mean(|r| r.profit_factor),
            total_trades: results.iter().map(|r| r.total_trades).sum(),
            evaluated: n,
            failed,
        }
    }
}

/// One history entry, appended after every evaluated tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub generation: u64,
    pub timestamp: DateTime<Utc>,
    pub best_fitness: f64,
    pub avg_fitness: f64,
    pub population_size: usize,
    pub metrics: PerformanceMetrics,
    /// Set when this tick advanced the generation.
    #[serde(default)]
    pub trigger: Option<EvolutionTrigger>,
}

/// Append-only ring of [`GenerationRecord`]s; the oldest entry is dropped
/// once `capacity` is reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct History {
    capacity: usize,
    records: VecDeque<GenerationRecord>,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            records: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn push(&mut self, record: GenerationRecord) {
        while self.records.len() >= self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    /// Change the capacity, dropping the oldest records if it shrinks.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.records.len() > self.capacity {
            self.records.pop_front();
        }
    }

    pub fn last_mut(&mut self) -> Option<&mut GenerationRecord> {
        self.records.back_mut()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &GenerationRecord> + ExactSizeIterator {
        self.records.iter()
    }

    /// The last `limit` records, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<GenerationRecord> {
        let skip = self.records.len().saturating_sub(limit);
        self.records.iter().skip(skip).cloned().collect()
    }
}

/// Everything the engine persists between restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionState {
    pub current_generation: u64,
    pub best_fitness: f64,
    pub avg_fitness: f64,
    pub last_evolution_at: DateTime<Utc>,
    /// Ranked by descending fitness, ties by id.
    pub population: Vec<StrategyDescriptor>,
    pub history: History,
    pub performance_metrics: PerformanceMetrics,
}

impl EvolutionState {
    /// Generation 0 around a freshly created population.
    pub fn fresh(
        population: Vec<StrategyDescriptor>,
        history_capacity: usize,
        now: DateTime<Utc>,
    ) -> Self {
        let mut state = Self {
            current_generation: 0,
            best_fitness: 0.0,
            avg_fitness: 0.0,
            last_evolution_at: now,
            population,
            history: History::new(history_capacity),
            performance_metrics: PerformanceMetrics::default(),
        };
        state.refresh_fitness_summary();
        state
    }

    /// Recompute `best_fitness` and `avg_fitness` from the population.
    pub fn refresh_fitness_summary(&mut self) {
        let n = self.population.len();
        if n == 0 {
            self.best_fitness = 0.0;
            self.avg_fitness = 0.0;
            return;
        }
        self.best_fitness = self
            .population
            .iter()
            .map(StrategyDescriptor::fitness)
            .fold(0.0, f64::max);
        self.avg_fitness =
            self.population.iter().map(StrategyDescriptor::fitness).sum::<f64>() / n as f64;
    }

    /// No tick has evaluated this population yet.
    pub fn is_unevaluated(&self) -> bool {
        self.history.is_empty()
    }
}
