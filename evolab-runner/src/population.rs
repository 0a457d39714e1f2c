//! Population ordering and the invariants checked before anything is persisted.

use std::cmp::Ordering;
use std::collections::HashSet;

use thiserror::Error;

use evolab_core::domain::{DescriptorId, StrategyDescriptor};
use evolab_core::{FitnessWeights, ParameterSchema, SchemaError};

/// A broken population invariant. Always a bug; never recovered from.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum InvariantViolation {
    #[error("population has {found} descriptors, expected {expected}")]
    SizeMismatch { expected: usize, found: usize },
    #[error("descriptor {id}: {source}")]
    Parameters {
        id: DescriptorId,
        #[source]
        source: SchemaError,
    },
    #[error("descriptor {id} has invalid fitness {fitness}")]
    InvalidFitness { id: DescriptorId, fitness: f64 },
    #[error("descriptor {id} fitness does not match its performance")]
    StaleFitness { id: DescriptorId },
    #[error("duplicate descriptor id {0}")]
    DuplicateId(DescriptorId),
    #[error("population is not ranked at position {0}")]
    Unranked(usize),
}

/// Descending fitness, then ascending id.
pub fn rank_order(a: &StrategyDescriptor, b: &StrategyDescriptor) -> Ordering {
    b.fitness()
        .total_cmp(&a.fitness())
        .then_with(|| a.id.cmp(&b.id))
}

pub fn rank(population: &mut [StrategyDescriptor]) {
    population.sort_by(rank_order);
}

pub fn is_ranked(population: &[StrategyDescriptor]) -> bool {
    population
        .windows(2)
        .all(|w| rank_order(&w[0], &w[1]) != Ordering::Greater)
}

/// Check every invariant a population must satisfy after a tick.
pub fn validate(
    population: &[StrategyDescriptor],
    schema: &ParameterSchema,
    expected_size: usize,
    weights: &FitnessWeights,
) -> Result<(), InvariantViolation> {
    if population.len() != expected_size {
        return Err(InvariantViolation::SizeMismatch {
            expected: expected_size,
            found: population.len(),
        });
    }
    let mut seen = HashSet::with_capacity(population.len());
    for d in population {
        d.parameters
            .validate(schema)
            .map_err(|source| InvariantViolation::Parameters {
                id: d.id.clone(),
                source,
            })?;
        if !d.fitness().is_finite() || d.fitness() < 0.0 {
            return Err(InvariantViolation::InvalidFitness {
                id: d.id.clone(),
                fitness: d.fitness(),
            });
        }
        if !d.is_consistent(weights) {
            return Err(InvariantViolation::StaleFitness { id: d.id.clone() });
        }
        if !seen.insert(&d.id) {
            return Err(InvariantViolation::DuplicateId(d.id.clone()));
        }
    }
    if let Some(i) = population
        .windows(2)
        .position(|w| rank_order(&w[0], &w[1]) == Ordering::Greater)
    {
        return Err(InvariantViolation::Unranked(i + 1));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use evolab_core::domain::{BacktestResult, Origin, Provenance, StrategyKind};
    use evolab_core::ParameterSet;
    use std::collections::BTreeMap;

    fn schema() -> ParameterSchema {
        ParameterSchema::from_ranges(&BTreeMap::from([("p".to_string(), (0.0, 1.0))])).unwrap()
    }

    fn descriptor(slot: usize, p: f64, total_return: Option<f64>) -> StrategyDescriptor {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut d = StrategyDescriptor::new(
            StrategyKind::TrendFollowing,
            ParameterSet(vec![p]),
            Provenance {
                origin: Origin::Genesis,
                generation: 0,
                slot,
                parents: &[],
                nonce: 0,
            },
            now,
        );
        if let Some(total_return) = total_return {
            let result = BacktestResult {
                total_return,
                total_trades: 1,
                ..Default::default()
            };
            d.record_evaluation(result, &FitnessWeights::default(), now);
        }
        d
    }

    #[test]
    fn rank_sorts_descending_with_id_tiebreak() {
        let mut pop = vec![
            descriptor(0, 0.5, None),
            descriptor(1, 0.5, Some(1.0)),
            descriptor(2, 0.5, None),
            descriptor(3, 0.5, Some(2.0)),
        ];
        rank(&mut pop);
        assert!(is_ranked(&pop));
        assert!(pop[0].fitness() > pop[1].fitness());
        assert_eq!(pop[2].fitness(), pop[3].fitness());
        assert!(pop[2].id < pop[3].id);
    }

    #[test]
    fn validate_accepts_ranked_population() {
        let mut pop = vec![descriptor(0, 0.1, Some(0.5)), descriptor(1, 0.9, None)];
        rank(&mut pop);
        validate(&pop, &schema(), 2, &FitnessWeights::default()).unwrap();
    }

    #[test]
    fn validate_rejects_wrong_size() {
        let pop = vec![descriptor(0, 0.1, None)];
        assert_eq!(
            validate(&pop, &schema(), 2, &FitnessWeights::default()),
            Err(InvariantViolation::SizeMismatch {
                expected: 2,
                found: 1
            })
        );
    }

    #[test]
    fn validate_rejects_out_of_range_parameter() {
        let pop = vec![descriptor(0, 1.5, None)];
        assert!(matches!(
            validate(&pop, &schema(), 1, &FitnessWeights::default()),
            Err(InvariantViolation::Parameters { .. })
        ));
    }

    #[test]
    fn validate_rejects_unranked() {
        let mut pop = vec![descriptor(0, 0.1, Some(0.5)), descriptor(1, 0.9, Some(3.0))];
        rank(&mut pop);
        pop.swap(0, 1);
        assert_eq!(
            validate(&pop, &schema(), 2, &FitnessWeights::default()),
            Err(InvariantViolation::Unranked(1))
        );
    }

    #[test]
    fn validate_rejects_duplicates() {
        let d = descriptor(0, 0.1, None);
        let pop = vec![d.clone(), d];
        assert!(matches!(
            validate(&pop, &schema(), 2, &FitnessWeights::default()),
            Err(InvariantViolation::DuplicateId(_))
        ));
    }

    #[test]
    fn validate_rejects_stale_fitness() {
        let pop = vec![descriptor(0, 0.1, Some(1.0))];
        let other = FitnessWeights {
            return_weight: 5.0,
            ..Default::default()
        };
        assert!(matches!(
            validate(&pop, &schema(), 1, &other),
            Err(InvariantViolation::StaleFitness { .. })
        ));
    }
}
