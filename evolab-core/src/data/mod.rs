//! Market data: the source contract, concrete adapters and the shared cache.
//!
//! Sources only know how to fetch. Retry policy lives with the caller and
//! freshness lives in [`SeriesCache`].

pub mod cache;
pub mod circuit_breaker;
pub mod csv_source;
pub mod http;
pub mod memory;
pub mod source;
pub mod synthetic;

pub use cache::{CacheStats, SeriesCache, DEFAULT_TTL_SECS};
pub use circuit_breaker::CircuitBreaker;
pub use csv_source::CsvSource;
pub use http::HttpKlineSource;
pub use memory::InMemorySource;
pub use source::{DataError, ErrorClass, MarketDataSource, MarketRequest};
pub use synthetic::SyntheticSource;
