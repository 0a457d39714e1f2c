//! On-disk checkpoint of the evolution state.
//!
//! A checkpoint is one pretty-printed JSON file:
//!
//! ```json
//! { "schema_version": 1, "parameter_schema": [...], "master_seed": 42, "state": {...} }
//! ```
//!
//! Writes go to `<path>.tmp`, are fsynced, then renamed over the target, so a
//! reader never sees a partial file.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use evolab_core::{FitnessWeights, ParameterSchema};

use crate::population::{self, InvariantViolation};
use crate::state::EvolutionState;

/// Bumped whenever the checkpoint layout changes incompatibly.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no checkpoint at {0}")]
    NotFound(PathBuf),
    #[error("corrupt checkpoint {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("checkpoint schema_version {found} is not supported (expected {expected})")]
    IncompatibleVersion { found: u32, expected: u32 },
    #[error("checkpoint parameter schema differs from the configured one")]
    SchemaMismatch,
    #[error("checkpoint violates an invariant: {0}")]
    Invalid(#[from] InvariantViolation),
    #[error("checkpoint I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode checkpoint: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StoreError {
    /// Errors after which the engine starts from a fresh population.
    pub fn is_recoverable_on_load(&self) -> bool {
        !matches!(self, StoreError::Io { .. } | StoreError::Encode(_))
    }
}

#[derive(Debug, Serialize)]
struct EnvelopeRef<'a> {
    schema_version: u32,
    parameter_schema: &'a ParameterSchema,
    master_seed: u64,
    state: &'a EvolutionState,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    schema_version: u32,
    parameter_schema: ParameterSchema,
    #[allow(dead_code)]
    master_seed: u64,
    state: EvolutionState,
}

#[derive(Debug, Deserialize)]
struct VersionProbe {
    schema_version: u32,
}

pub struct PopulationStore {
    path: PathBuf,
    schema: ParameterSchema,
    master_seed: u64,
    committed: Option<EvolutionState>,
}

impl PopulationStore {
    pub fn new(path: impl Into<PathBuf>, schema: ParameterSchema, master_seed: u64) -> Self {
        Self {
            path: path.into(),
            schema,
            master_seed,
            committed: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and check the checkpoint against the configured schema.
    ///
    /// Descriptor fitness is recomputed with `weights` so a change of fitness
    /// weights between runs is picked up without re-evaluating.
    pub fn load(
        &mut self,
        weights: &FitnessWeights,
        population_size: usize,
    ) -> Result<EvolutionState, StoreError> {
        let state = read_checkpoint(&self.path, Some(&self.schema))?;
        let mut state = state;
        for d in &mut state.population {
            let performance = *d.performance();
            let updated = d.last_updated_at;
            d.record_evaluation(performance, weights, updated);
        }
        population::rank(&mut state.population);
        state.refresh_fitness_summary();
        if !state.population.is_empty() {
            population::validate(&state.population, &self.schema, population_size, weights)?;
        }
        self.committed = Some(state.clone());
        Ok(state)
    }

    /// Atomically persist `state`; it becomes the committed snapshot.
    pub fn checkpoint(&mut self, state: &EvolutionState) -> Result<(), StoreError> {
        let envelope = EnvelopeRef {
            schema_version: SCHEMA_VERSION,
            parameter_schema: &self.schema,
            master_seed: self.master_seed,
            state,
        };
        let json = serde_json::to_vec_pretty(&envelope)?;
        write_atomic(&self.path, &json)?;
        self.committed = Some(state.clone());
        Ok(())
    }

    /// Deep copy of the last state loaded or checkpointed.
    pub fn snapshot(&self) -> Option<EvolutionState> {
        self.committed.clone()
    }

    /// Move an unreadable checkpoint aside as `<path>.corrupt`.
    pub fn quarantine(&self) -> Option<PathBuf> {
        let target = sibling(&self.path, "corrupt");
        match fs::rename(&self.path, &target) {
            Ok(()) => Some(target),
            Err(_) => None,
        }
    }
}

/// Read a checkpoint without a store, e.g. for `status`. When `schema` is
/// given the stored parameter schema must equal it.
pub fn read_checkpoint(
    path: &Path,
    schema: Option<&ParameterSchema>,
) -> Result<EvolutionState, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StoreError::NotFound(path.to_path_buf()))
        }
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let corrupt = |e: serde_json::Error| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };
    let probe: VersionProbe = serde_json::from_slice(&bytes).map_err(corrupt)?;
    if probe.schema_version != SCHEMA_VERSION {
        return Err(StoreError::IncompatibleVersion {
            found: probe.schema_version,
            expected: SCHEMA_VERSION,
        });
    }
    let envelope: Envelope = serde_json::from_slice(&bytes).map_err(corrupt)?;
    if let Some(schema) = schema {
        if &envelope.parameter_schema != schema {
            return Err(StoreError::SchemaMismatch);
        }
    }
    Ok(envelope.state)
}

/// Write `bytes` to `path` via a fsynced temporary file and a rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let tmp = sibling(path, "tmp");
    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(io_err(e));
    }
    Ok(())
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use evolab_core::domain::BacktestResult;
    use evolab_core::RngHierarchy;
    use std::collections::BTreeMap;

    use crate::config::EvolutionConfig;
    use crate::operators::GeneticOperators;
    use crate::state::{GenerationRecord, PerformanceMetrics};

    fn schema() -> ParameterSchema {
        ParameterSchema::from_ranges(&BTreeMap::from([("p".to_string(), (0.0, 1.0))])).unwrap()
    }

    fn sample_state() -> EvolutionState {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 8, 30, 0).unwrap();
        let config = EvolutionConfig {
            population_size: 4,
            elite_size: 2,
            parameter_ranges: schema().ranges(),
            ..Default::default()
        };
        let schema = schema();
        let ops = GeneticOperators::new(&config, &schema);
        let mut pop = ops.genesis(&mut RngHierarchy::new(7).rng_for("genesis", 0), now);
        let result = BacktestResult {
            total_return: 0.123_456_789,
            sharpe_ratio: 1.0 / 3.0,
            max_drawdown: 0.07,
            win_rate: 0.6,
            profit_factor: 1.7,
            total_trades: 5,
            ..Default::default()
        };
        pop[1].record_evaluation(result, &config.weights, now);
        population::rank(&mut pop);
        let mut state = EvolutionState::fresh(pop, 10, now);
        state.history.push(GenerationRecord {
            generation: 0,
            timestamp: now,
            best_fitness: state.best_fitness,
            avg_fitness: state.avg_fitness,
            population_size: 4,
            metrics: PerformanceMetrics::aggregate(&[result], 3),
            trigger: None,
        });
        state
    }

    #[test]
    fn checkpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let state = sample_state();

        let mut store = PopulationStore::new(&path, schema(), 7);
        store.checkpoint(&state).unwrap();
        assert!(!sibling(&path, "tmp").exists());

        let mut reopened = PopulationStore::new(&path, schema(), 7);
        let loaded = reopened.load(&FitnessWeights::default(), 4).unwrap();
        assert_eq!(loaded, state);
        assert_eq!(reopened.snapshot(), Some(state));
    }

    #[test]
    fn load_then_checkpoint_is_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut store = PopulationStore::new(&path, schema(), 7);
        store.checkpoint(&sample_state()).unwrap();
        let first = fs::read(&path).unwrap();

        let loaded = store.load(&FitnessWeights::default(), 4).unwrap();
        store.checkpoint(&loaded).unwrap();
        assert_eq!(fs::read(&path).unwrap(), first);
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PopulationStore::new(dir.path().join("none.json"), schema(), 7);
        assert!(matches!(
            store.load(&FitnessWeights::default(), 4),
            Err(StoreError::NotFound(_))
        ));
        assert!(store.snapshot().is_none());
    }

    #[test]
    fn truncated_file_is_corrupt_and_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut store = PopulationStore::new(&path, schema(), 7);
        store.checkpoint(&sample_state()).unwrap();
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        let err = store.load(&FitnessWeights::default(), 4).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
        assert!(err.is_recoverable_on_load());
        let moved = store.quarantine().unwrap();
        assert!(moved.exists());
        assert!(!path.exists());
    }

    #[test]
    fn other_version_is_incompatible() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, r#"{"schema_version": 99, "state": null}"#).unwrap();
        let mut store = PopulationStore::new(&path, schema(), 7);
        assert!(matches!(
            store.load(&FitnessWeights::default(), 4),
            Err(StoreError::IncompatibleVersion { found: 99, .. })
        ));
    }

    #[test]
    fn schema_change_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        PopulationStore::new(&path, schema(), 7)
            .checkpoint(&sample_state())
            .unwrap();

        let wider =
            ParameterSchema::from_ranges(&BTreeMap::from([("p".to_string(), (0.0, 2.0))])).unwrap();
        let mut store = PopulationStore::new(&path, wider, 7);
        assert!(matches!(
            store.load(&FitnessWeights::default(), 4),
            Err(StoreError::SchemaMismatch)
        ));
    }

    #[test]
    fn population_size_drift_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut store = PopulationStore::new(&path, schema(), 7);
        store.checkpoint(&sample_state()).unwrap();
        assert!(matches!(
            store.load(&FitnessWeights::default(), 6),
            Err(StoreError::Invalid(InvariantViolation::SizeMismatch { .. }))
        ));
    }

    #[test]
    fn write_atomic_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/out.json");
        write_atomic(&path, b"{}").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"{}");
    }
}
