//! Property tests for the genetic operators.
//!
//! Covers: reproducible crossover, mutation clipping under oversized
//! magnitudes, and the size/ranking guarantees of a new generation across
//! arbitrary configurations.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

use evolab_core::domain::{BacktestResult, Origin, StrategyDescriptor};
use evolab_core::rng::streams;
use evolab_core::{FitnessWeights, ParameterSchema, ParameterSet, RngHierarchy};
use evolab_runner::{population, EvolutionConfig, GeneticOperators};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
}

fn unit_schema(names: &[&str]) -> ParameterSchema {
    let ranges: BTreeMap<String, (f64, f64)> =
        names.iter().map(|n| (n.to_string(), (0.0, 1.0))).collect();
    ParameterSchema::from_ranges(&ranges).unwrap()
}

fn scored(pop: &mut [StrategyDescriptor], returns: &[f64], weights: &FitnessWeights) {
    for (d, &r) in pop.iter_mut().zip(returns.iter().cycle()) {
        let result = BacktestResult {
            total_return: r,
            max_drawdown: 0.1,
            total_trades: 2,
            ..Default::default()
        };
        d.record_evaluation(result, weights, now());
    }
    population::rank(pop);
}

// ─── Crossover ───────────────────────────────────────────────────────

#[test]
fn crossover_is_reproducible_under_one_seed() {
    let schema = unit_schema(&["a", "b"]);
    let config = EvolutionConfig {
        population_size: 4,
        elite_size: 2,
        parameter_ranges: schema.ranges(),
        ..Default::default()
    };
    let ops = GeneticOperators::new(&config, &schema);
    let mut parents = ops.genesis(&mut StdRng::seed_from_u64(1), now());
    parents[0].parameters = ParameterSet(vec![0.1, 0.9]);
    parents[1].parameters = ParameterSet(vec![0.8, 0.2]);

    let hierarchy = RngHierarchy::new(42);
    let first = ops.crossover(&parents[0], &parents[1], &mut hierarchy.rng_for(streams::OPERATORS, 1));
    let second = ops.crossover(&parents[0], &parents[1], &mut hierarchy.rng_for(streams::OPERATORS, 1));
    assert_eq!(first, second);

    let (_, child) = first;
    assert!(child.0[0] == 0.1 || child.0[0] == 0.8);
    assert!(child.0[1] == 0.9 || child.0[1] == 0.2);
}

#[test]
fn crossover_mixes_across_seeds() {
    let schema = unit_schema(&["a", "b"]);
    let config = EvolutionConfig {
        population_size: 4,
        elite_size: 2,
        parameter_ranges: schema.ranges(),
        ..Default::default()
    };
    let ops = GeneticOperators::new(&config, &schema);
    let mut parents = ops.genesis(&mut StdRng::seed_from_u64(2), now());
    parents[0].parameters = ParameterSet(vec![0.1, 0.9]);
    parents[1].parameters = ParameterSet(vec![0.8, 0.2]);

    let children: std::collections::HashSet<Vec<u64>> = (0..64)
        .map(|seed| {
            let (_, child) = ops.crossover(&parents[0], &parents[1], &mut StdRng::seed_from_u64(seed));
            child.0.iter().map(|v| v.to_bits()).collect()
        })
        .collect();
    // All four gene combinations turn up.
    assert_eq!(children.len(), 4);
}

// ─── Mutation ────────────────────────────────────────────────────────

#[test]
fn oversized_mutation_clips_to_range() {
    let schema = unit_schema(&["p"]);
    let config = EvolutionConfig {
        population_size: 4,
        elite_size: 2,
        mutation_rate: 1.0,
        mutation_magnitude: 10.0,
        parameter_ranges: schema.ranges(),
        ..Default::default()
    };
    let ops = GeneticOperators::new(&config, &schema);
    let mut rng = StdRng::seed_from_u64(7);

    let mut at_max = 0;
    let mut at_min = 0;
    for _ in 0..1000 {
        let mut params = ParameterSet(vec![0.99]);
        assert!(ops.mutate(&mut params, &mut rng));
        let v = params.0[0];
        assert!((0.0..=1.0).contains(&v), "mutated value {v} escaped [0, 1]");
        if v == 1.0 {
            at_max += 1;
        }
        if v == 0.0 {
            at_min += 1;
        }
    }
    assert!(at_max > 0, "no mutation clipped at the upper bound");
    assert!(at_min > 0, "no mutation clipped at the lower bound");
}

// ─── Generations ─────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn next_generation_has_exact_size_and_is_ranked(
        population_size in 2usize..30,
        elite_pick in 0usize..1000,
        mutation_rate in 0.0f64..=1.0,
        crossover_rate in 0.0f64..=1.0,
        immigration_fraction in 0.0f64..=1.0,
        seed in any::<u64>(),
        returns in prop::collection::vec(-0.5f64..2.0, 1..8),
    ) {
        let elite_size = 1 + elite_pick % (population_size / 2).max(1);
        let schema = unit_schema(&["a", "b", "c"]);
        let config = EvolutionConfig {
            population_size,
            elite_size,
            mutation_rate,
            crossover_rate,
            immigration_fraction,
            parameter_ranges: schema.ranges(),
            ..Default::default()
        };
        let weights = config.weights;
        let ops = GeneticOperators::new(&config, &schema);
        let hierarchy = RngHierarchy::new(seed);

        let mut current = ops.genesis(&mut hierarchy.rng_for(streams::GENESIS, 0), now());
        scored(&mut current, &returns, &weights);
        let next = ops.next_generation(&current, 1, &mut hierarchy.rng_for(streams::OPERATORS, 1), now());

        prop_assert_eq!(next.len(), population_size);
        prop_assert!(population::is_ranked(&next));
        prop_assert!(population::validate(&next, &schema, population_size, &weights).is_ok());

        for elite in &current[..elite_size] {
            prop_assert!(next.contains(elite));
        }
        let immigrants = next.iter().filter(|d| d.origin == Origin::Immigrant).count();
        prop_assert_eq!(immigrants, config.immigrant_count());
        for d in next.iter().filter(|d| d.generation == 1) {
            prop_assert!(d.performance().is_zeroed());
            prop_assert!(d.parameters.validate(&schema).is_ok());
        }
    }
}
