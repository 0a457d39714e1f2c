//! Evolab runner: the auto-evolution control loop around `evolab-core`.
//!
//! This crate provides:
//! - TOML engine configuration with validation
//! - Genetic operators (elitism, uniform crossover, clipped mutation, immigration)
//! - Evolution state with bounded history, and its atomic on-disk checkpoint
//! - Parallel population evaluation with retry, deadline and cancellation
//! - The tick scheduler, its background thread handle and the read-only query view

pub mod config;
pub mod evaluation;
pub mod operators;
pub mod population;
pub mod query;
pub mod report;
pub mod scheduler;
pub mod state;
pub mod store;

pub use config::{ConfigError, EngineConfig, EvolutionConfig, MarketConfig, RuntimeConfig, SourceConfig};
pub use evaluation::{EvaluationFailure, EvaluationPool, Outcome, RetryPolicy};
pub use operators::{GeneticOperators, PARAMETER_MUTATION_PROBABILITY};
pub use population::InvariantViolation;
pub use query::{EngineSnapshot, QueryHandle, Summary};
pub use report::{EvolutionReport, ReportedStrategy};
pub use scheduler::{
    evolution_trigger, EngineError, EngineHandle, EnginePhase, EvolutionScheduler, RunSummary,
    StopReason, TickReport,
};
pub use state::{EvolutionState, EvolutionTrigger, GenerationRecord, History, PerformanceMetrics};
pub use store::{read_checkpoint, PopulationStore, StoreError, SCHEMA_VERSION};
