//! Read-only view of the engine for dashboards and the CLI.
//!
//! The scheduler publishes an [`EngineSnapshot`] behind an `Arc` after every
//! write phase. Readers clone the `Arc` under a short read lock and never see
//! a half-applied tick.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use evolab_core::domain::{StrategyDescriptor, StrategyKind};
use evolab_core::ParameterSchema;

use crate::config::EvolutionConfig;
use crate::report::EvolutionReport;
use crate::scheduler::EnginePhase;
use crate::state::{EvolutionState, GenerationRecord, PerformanceMetrics};

/// History records included in a summary.
pub const SUMMARY_HISTORY: usize = 10;

/// Point-in-time engine view.
#[derive(Debug, Clone)]
pub struct EngineSnapshot {
    pub phase: EnginePhase,
    pub ticks: u64,
    pub state: Arc<EvolutionState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub current_generation: u64,
    pub best_fitness: f64,
    pub avg_fitness: f64,
    pub population_size: usize,
    pub last_evolution_at: DateTime<Utc>,
    pub performance_metrics: PerformanceMetrics,
    pub recent_history: Vec<GenerationRecord>,
    /// Absent when summarizing a checkpoint with no engine attached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<EnginePhase>,
    pub kind_distribution: BTreeMap<StrategyKind, usize>,
}

impl Summary {
    pub fn from_state(state: &EvolutionState, phase: Option<EnginePhase>, recent: usize) -> Self {
        let mut kind_distribution = BTreeMap::new();
        for d in &state.population {
            *kind_distribution.entry(d.kind).or_insert(0) += 1;
        }
        Self {
            current_generation: state.current_generation,
            best_fitness: state.best_fitness,
            avg_fitness: state.avg_fitness,
            population_size: state.population.len(),
            last_evolution_at: state.last_evolution_at,
            performance_metrics: state.performance_metrics,
            recent_history: state.history.recent(recent),
            phase,
            kind_distribution,
        }
    }
}

#[derive(Clone)]
pub struct QueryHandle {
    shared: Arc<RwLock<Arc<EngineSnapshot>>>,
    config: Arc<EvolutionConfig>,
    schema: Arc<ParameterSchema>,
}

impl QueryHandle {
    pub(crate) fn new(
        snapshot: EngineSnapshot,
        config: EvolutionConfig,
        schema: ParameterSchema,
    ) -> Self {
        Self {
            shared: Arc::new(RwLock::new(Arc::new(snapshot))),
            config: Arc::new(config),
            schema: Arc::new(schema),
        }
    }

    pub(crate) fn publish(&self, snapshot: EngineSnapshot) {
        let snapshot = Arc::new(snapshot);
        *self.shared.write().unwrap_or_else(|e| e.into_inner()) = snapshot;
    }

    /// Publish a phase change over the current state.
    pub(crate) fn set_phase(&self, phase: EnginePhase) {
        let mut guard = self.shared.write().unwrap_or_else(|e| e.into_inner());
        if guard.phase != phase {
            *guard = Arc::new(EngineSnapshot {
                phase,
                ticks: guard.ticks,
                state: Arc::clone(&guard.state),
            });
        }
    }

    pub fn snapshot(&self) -> Arc<EngineSnapshot> {
        Arc::clone(&self.shared.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn phase(&self) -> EnginePhase {
        self.snapshot().phase
    }

    pub fn get_summary(&self) -> Summary {
        let snap = self.snapshot();
        Summary::from_state(&snap.state, Some(snap.phase), SUMMARY_HISTORY)
    }

    /// The best `k` descriptors, ranked.
    pub fn get_top_strategies(&self, k: usize) -> Vec<StrategyDescriptor> {
        self.snapshot().state.population.iter().take(k).cloned().collect()
    }

    /// The last `limit` history records, oldest first.
    pub fn get_history(&self, limit: usize) -> Vec<GenerationRecord> {
        self.snapshot().state.history.recent(limit)
    }

    pub fn export_report(&self) -> EvolutionReport {
        let snap = self.snapshot();
        EvolutionReport::build(&snap.state, Some(snap.phase), &self.config, &self.schema, Utc::now())
    }
}
