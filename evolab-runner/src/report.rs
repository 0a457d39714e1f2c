//! Serializable report for rendering elsewhere.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use evolab_core::domain::{BacktestResult, DescriptorId, Origin, StrategyDescriptor, StrategyKind};
use evolab_core::ParameterSchema;

use crate::config::EvolutionConfig;
use crate::query::Summary;
use crate::scheduler::EnginePhase;
use crate::state::{EvolutionState, GenerationRecord};
use crate::store::{write_atomic, StoreError};

/// Strategies listed in a report.
pub const REPORT_TOP_K: usize = 10;

/// A descriptor with its parameters keyed by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportedStrategy {
    pub rank: usize,
    pub id: DescriptorId,
    pub name: String,
    pub kind: StrategyKind,
    pub origin: Origin,
    pub generation: u64,
    pub fitness: f64,
    pub parameters: BTreeMap<String, f64>,
    pub performance: BacktestResult,
}

impl ReportedStrategy {
    fn new(rank: usize, d: &StrategyDescriptor, schema: &ParameterSchema) -> Self {
        Self {
            rank,
            id: d.id.clone(),
            name: d.name.clone(),
            kind: d.kind,
            origin: d.origin,
            generation: d.generation,
            fitness: d.fitness(),
            parameters: d.parameters.to_named(schema),
            performance: *d.performance(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionReport {
    pub generated_at: DateTime<Utc>,
    pub summary: Summary,
    pub top_strategies: Vec<ReportedStrategy>,
    pub history: Vec<GenerationRecord>,
    pub config: EvolutionConfig,
}

impl EvolutionReport {
    pub fn build(
        state: &EvolutionState,
        phase: Option<EnginePhase>,
        config: &EvolutionConfig,
        schema: &ParameterSchema,
        generated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            generated_at,
            summary: Summary::from_state(state, phase, crate::query::SUMMARY_HISTORY),
            top_strategies: state
                .population
                .iter()
                .take(REPORT_TOP_K)
                .enumerate()
                .map(|(i, d)| ReportedStrategy::new(i + 1, d, schema))
                .collect(),
            history: state.history.iter().cloned().collect(),
            config: config.clone(),
        }
    }

    /// Write as pretty JSON, atomically.
    pub fn write(&self, path: &Path) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &json)
    }
}
