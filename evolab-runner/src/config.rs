//! Engine configuration: a single TOML file with four tables.
//!
//! ```toml
//! [evolution]
//! population_size = 20
//! elite_size = 5
//!
//! [evolution.parameter_ranges]
//! rsi_period = [10.0, 30.0]
//!
//! [runtime]
//! tick_interval_secs = 60
//!
//! [market]
//! symbol = "BTCUSDT"
//! timeframe = "1h"
//!
//! [source]
//! kind = "synthetic"
//! ```
//!
//! Every field has a default, so an empty file is valid. [`EngineConfig::validate`]
//! must run before the engine starts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use evolab_core::data::{
    CircuitBreaker, CsvSource, DataError, HttpKlineSource, MarketDataSource, MarketRequest,
    SyntheticSource,
};
use evolab_core::domain::Timeframe;
use evolab_core::{FitnessWeights, ParameterSchema, RngHierarchy, SchemaError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("fitness weight {name} must be finite and non-negative, got {value}")]
    NegativeWeight { name: &'static str, value: f64 },
    #[error("{name} must lie in [0, 1], got {value}")]
    RateOutOfRange { name: &'static str, value: f64 },
    #[error("{name} must be finite and non-negative, got {value}")]
    InvalidThreshold { name: &'static str, value: f64 },
    #[error("population_size must be at least 2, got {0}")]
    PopulationTooSmall(usize),
    #[error("elite_size {elite} leaves no room for offspring in a population of {population}")]
    EliteTooLarge { elite: usize, population: usize },
    #[error("elite_size must be at least 1")]
    NoElites,
    #[error("parameter ranges: {0}")]
    Schema(#[from] SchemaError),
    #[error("runtime.{field}: {reason}")]
    Runtime { field: &'static str, reason: String },
}

// ─── Evolution ───────────────────────────────────────────────────────

/// Genetic algorithm and trigger settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionConfig {
    pub population_size: usize,
    pub elite_size: usize,
    /// Probability that an offspring is mutated.
    pub mutation_rate: f64,
    /// Probability that an offspring slot is a crossover rather than a clone.
    pub crossover_rate: f64,
    /// Mutation step bound as a fraction of each parameter's span.
    pub mutation_magnitude: f64,
    pub immigration_fraction: f64,
    pub weights: FitnessWeights,
    pub evolution_interval_secs: u64,
    pub min_fitness_threshold: f64,
    pub max_drawdown_threshold: f64,
    /// Parameter name -> `[min, max]`.
    pub parameter_ranges: BTreeMap<String, (f64, f64)>,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            population_size: 20,
            elite_size: 5,
            mutation_rate: 0.1,
            crossover_rate: 0.8,
            mutation_magnitude: 0.1,
            immigration_fraction: 0.1,
            weights: FitnessWeights::default(),
            evolution_interval_secs: 3600,
            min_fitness_threshold: 0.6,
            max_drawdown_threshold: 0.2,
            parameter_ranges: ParameterSchema::default_ranges(),
        }
    }
}

impl EvolutionConfig {
    /// Check ranges and rates; clamp `elite_size` to half the population.
    pub fn validate(&mut self) -> Result<ParameterSchema, ConfigError> {
        for (name, value) in self.weights.as_array() {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::NegativeWeight { name, value });
            }
        }
        for (name, value) in [
            ("mutation_rate", self.mutation_rate),
            ("crossover_rate", self.crossover_rate),
            ("immigration_fraction", self.immigration_fraction),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::RateOutOfRange { name, value });
            }
        }
        for (name, value) in [
            ("mutation_magnitude", self.mutation_magnitude),
            ("min_fitness_threshold", self.min_fitness_threshold),
            ("max_drawdown_threshold", self.max_drawdown_threshold),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidThreshold { name, value });
            }
        }

        if self.population_size < 2 {
            return Err(ConfigError::PopulationTooSmall(self.population_size));
        }
        if self.elite_size == 0 {
            return Err(ConfigError::NoElites);
        }
        if self.elite_size >= self.population_size {
            return Err(ConfigError::EliteTooLarge {
                elite: self.elite_size,
                population: self.population_size,
            });
        }
        let max_elites = self.population_size / 2;
        if self.elite_size > max_elites {
            warn!(
                elite_size = self.elite_size,
                clamped_to = max_elites,
                "elite_size exceeds half the population; clamping"
            );
            self.elite_size = max_elites;
        }

        Ok(ParameterSchema::from_ranges(&self.parameter_ranges)?)
    }

    /// Number of random immigrants per generation.
    pub fn immigrant_count(&self) -> usize {
        let slots = self.population_size.saturating_sub(self.elite_size);
        let wanted = (self.immigration_fraction * self.population_size as f64).round() as usize;
        wanted.min(slots)
    }

    /// Number of crossover/clone offspring per generation.
    pub fn offspring_count(&self) -> usize {
        self.population_size
            .saturating_sub(self.elite_size)
            .saturating_sub(self.immigrant_count())
    }
}

// ─── Runtime ─────────────────────────────────────────────────────────

/// Scheduling, concurrency and persistence settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub tick_interval_secs: u64,
    /// Evaluation worker threads; 0 = available cores.
    pub workers: usize,
    pub grace_secs: u64,
    pub request_timeout_secs: u64,
    /// Overall evaluation deadline per tick; 0 = 10 × tick interval.
    pub evaluation_deadline_secs: u64,
    pub max_fetch_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub cache_ttl_secs: u64,
    pub checkpoint_path: PathBuf,
    /// Creating this file asks a running engine to stop.
    pub stop_file: PathBuf,
    pub history_capacity: usize,
    pub initial_capital: f64,
    pub master_seed: u64,
    pub max_ticks: Option<u64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            workers: 0,
            grace_secs: 5,
            request_timeout_secs: 15,
            evaluation_deadline_secs: 0,
            max_fetch_attempts: 3,
            retry_base_delay_ms: 250,
            cache_ttl_secs: evolab_core::data::DEFAULT_TTL_SECS,
            checkpoint_path: PathBuf::from("evolab_state.json"),
            stop_file: PathBuf::from("evolab.stop"),
            history_capacity: 500,
            initial_capital: 10_000.0,
            master_seed: 42,
            max_ticks: None,
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |field, reason: &str| {
            Err(ConfigError::Runtime {
                field,
                reason: reason.to_string(),
            })
        };
        if self.max_fetch_attempts == 0 {
            return fail("max_fetch_attempts", "must be at least 1");
        }
        if self.history_capacity == 0 {
            return fail("history_capacity", "must be at least 1");
        }
        if !(self.initial_capital.is_finite() && self.initial_capital > 0.0) {
            return fail("initial_capital", "must be finite and positive");
        }
        if self.request_timeout_secs == 0 {
            return fail("request_timeout_secs", "must be at least 1");
        }
        if self.checkpoint_path.as_os_str().is_empty() {
            return fail("checkpoint_path", "must not be empty");
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// Evaluation deadline, falling back to ten tick intervals.
    pub fn evaluation_deadline(&self) -> Duration {
        if self.evaluation_deadline_secs > 0 {
            Duration::from_secs(self.evaluation_deadline_secs)
        } else {
            Duration::from_secs(self.tick_interval_secs.saturating_mul(10).max(1))
        }
    }

    /// Worker thread count with 0 resolved to the core count.
    pub fn worker_threads(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

// ─── Market & source ─────────────────────────────────────────────────

/// The market every descriptor is evaluated against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    pub exchange: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub limit: usize,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            exchange: "binance".to_string(),
            symbol: "BTCUSDT".to_string(),
            timeframe: Timeframe::H1,
            limit: 1000,
        }
    }
}

impl MarketConfig {
    pub fn request(&self) -> MarketRequest {
        MarketRequest::new(&self.exchange, &self.symbol, self.timeframe, self.limit)
    }
}

/// Which [`MarketDataSource`] adapter to build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    /// Binance-compatible REST klines endpoint.
    Http {
        #[serde(default = "default_base_url")]
        base_url: String,
        #[serde(default = "default_breaker_cooldown")]
        breaker_cooldown_secs: u64,
    },
    /// `{path}/{SYMBOL}_{tf}.csv`, or `path` itself when it is a file.
    Csv { path: PathBuf },
    /// Seeded geometric random walk.
    Synthetic {
        #[serde(default = "default_start_price")]
        start_price: f64,
        #[serde(default = "default_volatility")]
        volatility: f64,
        #[serde(default)]
        drift: f64,
    },
}

fn default_base_url() -> String {
    evolab_core::data::http::DEFAULT_BASE_URL.to_string()
}

fn default_breaker_cooldown() -> u64 {
    600
}

fn default_start_price() -> f64 {
    50_000.0
}

fn default_volatility() -> f64 {
    0.02
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Synthetic {
            start_price: default_start_price(),
            volatility: default_volatility(),
            drift: 0.0,
        }
    }
}

impl SourceConfig {
    /// Build the adapter. `anchor` is the last bar time for synthetic data.
    pub fn build(
        &self,
        market: &MarketConfig,
        runtime: &RuntimeConfig,
        anchor: DateTime<Utc>,
    ) -> Result<Arc<dyn MarketDataSource>, DataError> {
        Ok(match self {
            SourceConfig::Http {
                base_url,
                breaker_cooldown_secs,
            } => Arc::new(HttpKlineSource::new(
                &market.exchange,
                base_url,
                runtime.request_timeout(),
                Arc::new(CircuitBreaker::new(Duration::from_secs(*breaker_cooldown_secs))),
            )?),
            SourceConfig::Csv { path } => Arc::new(CsvSource::new(path)),
            SourceConfig::Synthetic {
                start_price,
                volatility,
                drift,
            } => Arc::new(
                SyntheticSource::new(RngHierarchy::new(runtime.master_seed), anchor)
                    .with_walk(*start_price, *volatility, *drift),
            ),
        })
    }
}

// ─── Engine ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub evolution: EvolutionConfig,
    pub runtime: RuntimeConfig,
    pub market: MarketConfig,
    pub source: SourceConfig,
}

impl EngineConfig {
    /// Read and parse a TOML file. Does not validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Validate every table and return the parameter schema.
    pub fn validate(&mut self) -> Result<ParameterSchema, ConfigError> {
        self.runtime.validate()?;
        if self.market.limit == 0 {
            return Err(ConfigError::Runtime {
                field: "market.limit",
                reason: "must be at least 1".to_string(),
            });
        }
        self.evolution.validate()
    }
}
