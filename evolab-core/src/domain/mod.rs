//! Domain types for the evolution engine.

pub mod bar;
pub mod ids;
pub mod result;
pub mod strategy;

pub use bar::{MarketKey, OhlcvBar, OhlcvSeries, Timeframe, TimeframeParseError};
pub use ids::DescriptorId;
pub use result::BacktestResult;
pub use strategy::{Origin, Provenance, StrategyDescriptor, StrategyKind};
