//! Deterministic backtest evaluation.
//!
//! Signals are generated per strategy kind from the indicator library, then
//! replayed through a single long-or-flat position model. Nothing here draws
//! random numbers or reads the clock.

pub mod evaluator;
pub mod metrics;
pub mod signals;

pub use evaluator::{BacktestEvaluator, BacktestRun, ClosedTrade, EvaluationError, MIN_BARS};
pub use signals::{generate_signals, Signal, SignalParams};
