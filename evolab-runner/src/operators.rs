//! Genetic operators: elitism, uniform crossover, clipped uniform mutation,
//! random immigration.
//!
//! Every random draw comes from the RNG handed in by the caller, so a
//! generation is reproducible from `(input population, RNG state)`.
//!
//! A new generation is assembled as
//! `elites → crossover/clone offspring (mutated) → immigrants`, then padded
//! with immigrants or truncated to exactly `population_size` and ranked.

use chrono::{DateTime, Utc};
use rand::Rng;

use evolab_core::domain::{Origin, Provenance, StrategyDescriptor, StrategyKind};
use evolab_core::{ParameterSchema, ParameterSet};

use crate::config::EvolutionConfig;
use crate::population;

/// Chance that a single parameter moves when an offspring is mutated.
pub const PARAMETER_MUTATION_PROBABILITY: f64 = 0.3;

pub struct GeneticOperators<'a> {
    config: &'a EvolutionConfig,
    schema: &'a ParameterSchema,
}

impl<'a> GeneticOperators<'a> {
    pub fn new(config: &'a EvolutionConfig, schema: &'a ParameterSchema) -> Self {
        Self { config, schema }
    }

    /// A random generation-0 population, ranked.
    pub fn genesis<R: Rng + ?Sized>(&self, rng: &mut R, now: DateTime<Utc>) -> Vec<StrategyDescriptor> {
        let mut pop: Vec<StrategyDescriptor> = (0..self.config.population_size)
            .map(|slot| self.random_descriptor(rng, Origin::Genesis, 0, slot, now))
            .collect();
        population::rank(&mut pop);
        pop
    }

    /// Uniform kind, every parameter uniform over its range.
    pub fn random_descriptor<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        origin: Origin,
        generation: u64,
        slot: usize,
        now: DateTime<Utc>,
    ) -> StrategyDescriptor {
        let kind = StrategyKind::ALL[rng.gen_range(0..StrategyKind::ALL.len())];
        let parameters = self.schema.sample(rng);
        let nonce = rng.gen();
        StrategyDescriptor::new(
            kind,
            parameters,
            Provenance {
                origin,
                generation,
                slot,
                parents: &[],
                nonce,
            },
            now,
        )
    }

    /// The top `elite_size` descriptors, unchanged.
    pub fn select_elites(&self, population: &[StrategyDescriptor]) -> Vec<StrategyDescriptor> {
        let mut ranked = population.to_vec();
        population::rank(&mut ranked);
        ranked.truncate(self.config.elite_size);
        ranked
    }

    /// Uniform crossover: each parameter and the kind come from `a` or `b`
    /// with equal probability.
    pub fn crossover<R: Rng + ?Sized>(
        &self,
        a: &StrategyDescriptor,
        b: &StrategyDescriptor,
        rng: &mut R,
    ) -> (StrategyKind, ParameterSet) {
        let kind = if rng.gen_bool(0.5) { a.kind } else { b.kind };
        let values = a
            .parameters
            .values()
            .iter()
            .zip(b.parameters.values())
            .map(|(&va, &vb)| if rng.gen_bool(0.5) { va } else { vb })
            .collect();
        (kind, ParameterSet(values))
    }

    /// With probability `mutation_rate`, move each parameter with probability
    /// [`PARAMETER_MUTATION_PROBABILITY`] by `δ ~ U(±magnitude·span)` and clip.
    /// Returns whether the offspring was selected for mutation.
    pub fn mutate<R: Rng + ?Sized>(&self, parameters: &mut ParameterSet, rng: &mut R) -> bool {
        if !rng.gen_bool(self.config.mutation_rate) {
            return false;
        }
        for (spec, value) in self.schema.specs().iter().zip(parameters.0.iter_mut()) {
            if rng.gen_bool(PARAMETER_MUTATION_PROBABILITY) {
                let step: f64 = rng.gen_range(-1.0..=1.0);
                let delta = step * self.config.mutation_magnitude * spec.span();
                *value = spec.clip(*value + delta);
            }
        }
        true
    }

    /// One offspring from the elites: a crossover of two distinct parents with
    /// probability `crossover_rate`, otherwise a clone of one.
    fn offspring<R: Rng + ?Sized>(
        &self,
        elites: &[StrategyDescriptor],
        rng: &mut R,
        generation: u64,
        slot: usize,
        now: DateTime<Utc>,
    ) -> StrategyDescriptor {
        let n = elites.len();
        let (origin, kind, mut parameters, parents) =
            if n >= 2 && rng.gen_bool(self.config.crossover_rate) {
                let i = rng.gen_range(0..n);
                let mut j = rng.gen_range(0..n - 1);
                if j >= i {
                    j += 1;
                }
                let (kind, params) = self.crossover(&elites[i], &elites[j], rng);
                (
                    Origin::Crossover,
                    kind,
                    params,
                    vec![elites[i].id.clone(), elites[j].id.clone()],
                )
            } else {
                let parent = &elites[rng.gen_range(0..n)];
                (
                    Origin::Clone,
                    parent.kind,
                    parent.parameters.clone(),
                    vec![parent.id.clone()],
                )
            };
        self.mutate(&mut parameters, rng);
        let nonce = rng.gen();
        StrategyDescriptor::new(
            kind,
            parameters,
            Provenance {
                origin,
                generation,
                slot,
                parents: &parents,
                nonce,
            },
            now,
        )
    }

    /// Build generation `generation` from the current population.
    pub fn next_generation<R: Rng + ?Sized>(
        &self,
        current: &[StrategyDescriptor],
        generation: u64,
        rng: &mut R,
        now: DateTime<Utc>,
    ) -> Vec<StrategyDescriptor> {
        let size = self.config.population_size;
        let elites = self.select_elites(current);

        let mut next = Vec::with_capacity(size);
        next.extend(elites.iter().cloned());

        if !elites.is_empty() {
            for _ in 0..self.config.offspring_count() {
                let slot = next.len();
                next.push(self.offspring(&elites, rng, generation, slot, now));
            }
        }
        for _ in 0..self.config.immigrant_count() {
            let slot = next.len();
            next.push(self.random_descriptor(rng, Origin::Immigrant, generation, slot, now));
        }
        while next.len() < size {
            let slot = next.len();
            next.push(self.random_descriptor(rng, Origin::Immigrant, generation, slot, now));
        }
        next.truncate(size);

        population::rank(&mut next);
        next
    }
}
