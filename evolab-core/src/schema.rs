//! Parameter schema: the authoritative list of evolvable parameters.
//!
//! The schema is fixed at configuration load. Descriptors carry a
//! [`ParameterSet`], a plain vector of values indexed by schema position, so
//! the only runtime checks are the length and each value's range.

use std::collections::{BTreeMap, HashSet};

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SchemaError {
    #[error("parameter schema is empty")]
    Empty,

    #[error("duplicate parameter name '{0}'")]
    DuplicateName(String),

    #[error("parameter '{name}' has invalid range [{min}, {max}] (need finite min < max with a finite span)")]
    InvalidRange { name: String, min: f64, max: f64 },

    #[error("parameter set has {found} values, schema expects {expected}")]
    LengthMismatch { expected: usize, found: usize },

    #[error("parameter '{name}' = {value} outside [{min}, {max}]")]
    OutOfRange {
        name: String,
        value: f64,
        min: f64,
        max: f64,
    },
}

/// One evolvable parameter and its closed range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub min: f64,
    pub max: f64,
}

impl ParameterSpec {
    pub fn new(name: impl Into<String>, min: f64, max: f64) -> Self {
        Self {
            name: name.into(),
            min,
            max,
        }
    }

    pub fn span(&self) -> f64 {
        self.max - self.min
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    pub fn clip(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }
}

/// Ordered, validated list of parameter specs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<ParameterSpec>", into = "Vec<ParameterSpec>")]
pub struct ParameterSchema {
    specs: Vec<ParameterSpec>,
}

impl ParameterSchema {
    pub fn new(specs: Vec<ParameterSpec>) -> Result<Self, SchemaError> {
        if specs.is_empty() {
            return Err(SchemaError::Empty);
        }
        let mut seen = HashSet::new();
        for spec in &specs {
            if !seen.insert(spec.name.as_str()) {
                return Err(SchemaError::DuplicateName(spec.name.clone()));
            }
            let finite = spec.min.is_finite() && spec.max.is_finite() && spec.span().is_finite();
            if !(finite && spec.min < spec.max) {
                return Err(SchemaError::InvalidRange {
                    name: spec.name.clone(),
                    min: spec.min,
                    max: spec.max,
                });
            }
        }
        Ok(Self { specs })
    }

    /// Build from a name → (min, max) mapping; positions follow key order.
    pub fn from_ranges(ranges: &BTreeMap<String, (f64, f64)>) -> Result<Self, SchemaError> {
        Self::new(
            ranges
                .iter()
                .map(|(name, &(min, max))| ParameterSpec::new(name.clone(), min, max))
                .collect(),
        )
    }

    /// The trading parameter set evolved by default.
    pub fn default_ranges() -> BTreeMap<String, (f64, f64)> {
        [
            ("position_size", (0.01, 0.5)),
            ("stop_loss", (0.01, 0.1)),
            ("take_profit", (0.02, 0.3)),
            ("rsi_period", (10.0, 30.0)),
            ("ma_short", (5.0, 20.0)),
            ("ma_long", (20.0, 100.0)),
            ("bollinger_period", (10.0, 30.0)),
            ("bollinger_std", (1.5, 3.0)),
        ]
        .into_iter()
        .map(|(name, range)| (name.to_string(), range))
        .collect()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn specs(&self) -> &[ParameterSpec] {
        &self.specs
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.specs.iter().position(|s| s.name == name)
    }

    /// Draw every parameter uniformly over its range.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> ParameterSet {
        ParameterSet(
            self.specs
                .iter()
                .map(|s| rng.gen_range(s.min..=s.max))
                .collect(),
        )
    }

    pub fn ranges(&self) -> BTreeMap<String, (f64, f64)> {
        self.specs
            .iter()
            .map(|s| (s.name.clone(), (s.min, s.max)))
            .collect()
    }
}

impl TryFrom<Vec<ParameterSpec>> for ParameterSchema {
    type Error = SchemaError;

    fn try_from(specs: Vec<ParameterSpec>) -> Result<Self, Self::Error> {
        Self::new(specs)
    }
}

impl From<ParameterSchema> for Vec<ParameterSpec> {
    fn from(schema: ParameterSchema) -> Self {
        schema.specs
    }
}

/// Parameter values indexed by schema position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSet(pub Vec<f64>);

impl ParameterSet {
    pub fn values(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Look a value up by parameter name.
    pub fn get(&self, schema: &ParameterSchema, name: &str) -> Option<f64> {
        schema.index_of(name).and_then(|i| self.0.get(i).copied())
    }

    /// Length check plus a range check on every value.
    pub fn validate(&self, schema: &ParameterSchema) -> Result<(), SchemaError> {
        if self.0.len() != schema.len() {
            return Err(SchemaError::LengthMismatch {
                expected: schema.len(),
                found: self.0.len(),
            });
        }
        for (spec, &value) in schema.specs().iter().zip(&self.0) {
            if !spec.contains(value) {
                return Err(SchemaError::OutOfRange {
                    name: spec.name.clone(),
                    value,
                    min: spec.min,
                    max: spec.max,
                });
            }
        }
        Ok(())
    }

    pub fn to_named(&self, schema: &ParameterSchema) -> BTreeMap<String, f64> {
        schema
            .specs()
            .iter()
            .zip(&self.0)
            .map(|(spec, &v)| (spec.name.clone(), v))
            .collect()
    }
}
