//! Strategy descriptors: the unit of evolution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::DescriptorId;
use super::result::BacktestResult;
use crate::fitness::FitnessWeights;
use crate::schema::ParameterSet;

/// Signal family a descriptor trades with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    TrendFollowing,
    MeanReversion,
    Arbitrage,
    GridTrading,
    Hybrid,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 5] = [
        StrategyKind::TrendFollowing,
        StrategyKind::MeanReversion,
        StrategyKind::Arbitrage,
        StrategyKind::GridTrading,
        StrategyKind::Hybrid,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::TrendFollowing => "trend_following",
            StrategyKind::MeanReversion => "mean_reversion",
            StrategyKind::Arbitrage => "arbitrage",
            StrategyKind::GridTrading => "grid_trading",
            StrategyKind::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a descriptor entered the population.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Random member of the initial population.
    Genesis,
    /// Uniform crossover of two elites.
    Crossover,
    /// Copy of a single elite's parameters under a fresh id.
    Clone,
    /// Random descriptor injected for diversity.
    Immigrant,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Genesis => "genesis",
            Origin::Crossover => "crossover",
            Origin::Clone => "clone",
            Origin::Immigrant => "immigrant",
        }
    }
}

/// A concrete parameterized strategy candidate.
///
/// `performance` and `fitness` are private: they only change together
/// through [`StrategyDescriptor::record_evaluation`] and
/// [`StrategyDescriptor::reset_performance`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyDescriptor {
    pub id: DescriptorId,
    pub name: String,
    pub kind: StrategyKind,
    pub parameters: ParameterSet,
    pub generation: u64,
    pub origin: Origin,
    #[serde(default)]
    pub parents: Vec<DescriptorId>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    performance: BacktestResult,
    fitness: f64,
}

/// Everything that determines a descriptor's id.
#[derive(Debug, Clone, Copy)]
pub struct Provenance<'a> {
    pub origin: Origin,
    pub generation: u64,
    pub slot: usize,
    pub parents: &'a [DescriptorId],
    /// Random draw that separates otherwise identical creations.
    pub nonce: u64,
}

impl StrategyDescriptor {
    /// Create an unevaluated descriptor. The id is a content hash over the
    /// provenance, kind and parameter bits.
    pub fn new(
        kind: StrategyKind,
        parameters: ParameterSet,
        provenance: Provenance<'_>,
        now: DateTime<Utc>,
    ) -> Self {
        let id = Self::derive_id(kind, &parameters, &provenance);
        let name = format!(
            "{}_g{}_{}",
            kind.as_str(),
            provenance.generation,
            &id.as_str()[..6]
        );
        Self {
            id,
            name,
            kind,
            parameters,
            generation: provenance.generation,
            origin: provenance.origin,
            parents: provenance.parents.to_vec(),
            created_at: now,
            last_updated_at: now,
            performance: BacktestResult::zeroed(),
            fitness: 0.0,
        }
    }

    fn derive_id(
        kind: StrategyKind,
        parameters: &ParameterSet,
        provenance: &Provenance<'_>,
    ) -> DescriptorId {
        let mut hasher = blake3::Hasher::new();
        hasher.update(provenance.origin.as_str().as_bytes());
        hasher.update(&provenance.generation.to_le_bytes());
        hasher.update(&(provenance.slot as u64).to_le_bytes());
        for parent in provenance.parents {
            hasher.update(parent.as_str().as_bytes());
        }
        hasher.update(kind.as_str().as_bytes());
        for v in parameters.values() {
            hasher.update(&v.to_bits().to_le_bytes());
        }
        hasher.update(&provenance.nonce.to_le_bytes());
        DescriptorId::from_hash(&hasher.finalize())
    }

    pub fn performance(&self) -> &BacktestResult {
        &self.performance
    }

    pub fn fitness(&self) -> f64 {
        self.fitness
    }

    /// Store an evaluation result together with its fitness.
    pub fn record_evaluation(
        &mut self,
        result: BacktestResult,
        weights: &FitnessWeights,
        now: DateTime<Utc>,
    ) {
        let result = result.sanitized();
        self.fitness = weights.score(&result);
        self.performance = result;
        self.last_updated_at = now;
    }

    /// Back to the unevaluated state: zeroed result, fitness 0.
    pub fn reset_performance(&mut self, now: DateTime<Utc>) {
        self.performance = BacktestResult::zeroed();
        self.fitness = 0.0;
        self.last_updated_at = now;
    }

    /// True when the stored fitness is what the weights give for the stored result.
    pub fn is_consistent(&self, weights: &FitnessWeights) -> bool {
        self.fitness >= 0.0 && self.fitness.to_bits() == weights.score(&self.performance).to_bits()
    }
}
