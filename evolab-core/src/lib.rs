//! Evolab Core: the pure building blocks of the strategy evolution engine.
//!
//! - Domain types (bars, series, descriptors, backtest results)
//! - Parameter schema and schema-indexed parameter sets
//! - Indicator library (RSI, EMA, SMA, MACD, Bollinger, ATR)
//! - Deterministic backtest evaluator and fitness function
//! - Seeded RNG hierarchy, injectable clock, cancellation token
//! - Market data sources and the shared TTL cache

pub mod backtest;
pub mod cancel;
pub mod clock;
pub mod data;
pub mod domain;
pub mod fitness;
pub mod indicators;
pub mod rng;
pub mod schema;

pub use backtest::{BacktestEvaluator, EvaluationError, MIN_BARS};
pub use cancel::CancelToken;
pub use clock::{Clock, ManualClock, SystemClock};
pub use fitness::FitnessWeights;
pub use rng::RngHierarchy;
pub use schema::{ParameterSchema, ParameterSet, ParameterSpec, SchemaError};
