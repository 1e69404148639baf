//! Generated combinations: exhaustive search over a small local grid.
//!
//! Each parameter contributes `N` values centred on its default, alternating
//! upward and downward by its automatic step: `v, v+s, v-s, v+2s, v-2s, ...`.
//! The grid is the Cartesian product in declared parameter order, enumerated
//! odometer-style (the last parameter varies fastest), so the first
//! combination is always the defaults. Enumeration stops at the cap.

use super::hill_climb::auto_step;
use super::{try_candidate, Objective, SearchEnd, SearchObserver, SearchOutcome};
use crate::types::{round_real, ParamMap, ParamValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationOptions {
    pub values_per_param: usize,
    pub max_combinations: usize,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            values_per_param: 3,
            max_combinations: 1_000,
        }
    }
}

/// `n` values around `default`. `None` for a non-finite default.
pub fn combination_values(default: ParamValue, n: usize, epsilon: f64) -> Option<Vec<ParamValue>> {
    if !default.is_finite() {
        return None;
    }
    let step = auto_step(default, epsilon);
    let mut values = vec![default];
    let mut k = 1.0;
    while values.len() < n {
        for direction in [1.0, -1.0] {
            let offset = direction * k * step;
            let value = match default {
                ParamValue::Int(v) => ParamValue::Int(v.saturating_add(offset as i64)),
                ParamValue::Float(v) => ParamValue::Float(round_real(v + offset)),
            };
            if values.len() < n && value.is_finite() && !values.contains(&value) {
                values.push(value);
            }
        }
        k += 1.0;
        if k > (4 * n) as f64 {
            break;
        }
    }
    Some(values)
}

/// The discretised search space.
#[derive(Debug, Clone, PartialEq)]
pub struct CombinationGrid {
    names: Vec<String>,
    values: Vec<Vec<ParamValue>>,
    max_combinations: usize,
}

impl CombinationGrid {
    /// Build the grid, or explain why it cannot be built.
    pub fn new(
        parameters: &[(String, ParamValue)],
        options: GenerationOptions,
        epsilon: f64,
    ) -> Result<Self, String> {
        if parameters.is_empty() {
            return Err("algorithm declares no numeric parameters".into());
        }
        if options.values_per_param == 0 || options.max_combinations == 0 {
            return Err("values_per_param and max_combinations must be at least 1".into());
        }

        let mut names = Vec::with_capacity(parameters.len());
        let mut values = Vec::with_capacity(parameters.len());
        for (name, default) in parameters {
            let list = combination_values(*default, options.values_per_param, epsilon)
                .filter(|l| !l.is_empty())
                .ok_or_else(|| format!("cannot generate values for `{name}` (default {default})"))?;
            names.push(name.clone());
            values.push(list);
        }
        Ok(Self {
            names,
            values,
            max_combinations: options.max_combinations,
        })
    }

    /// Size of the full product, saturating.
    pub fn raw_count(&self) -> u64 {
        self.values
            .iter()
            .fold(1u64, |acc, v| acc.saturating_mul(v.len() as u64))
    }

    /// Number of combinations that will be enumerated.
    pub fn len(&self) -> usize {
        self.raw_count().min(self.max_combinations as u64) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = ParamMap> + '_ {
        let mut indices = vec![0usize; self.values.len()];
        let mut exhausted = false;
        std::iter::from_fn(move || {
            if exhausted {
                return None;
            }
            let combo: ParamMap = self
                .names
                .iter()
                .zip(&indices)
                .zip(&self.values)
                .map(|((name, i), vals)| (name.as_str(), vals[*i]))
                .collect();

            exhausted = true;
            for pos in (0..indices.len()).rev() {
                indices[pos] += 1;
                if indices[pos] < self.values[pos].len() {
                    exhausted = false;
                    break;
                }
                indices[pos] = 0;
            }
            Some(combo)
        })
        .take(self.len())
    }
}

pub struct CombinationSearch {
    grid: CombinationGrid,
}

impl CombinationSearch {
    pub fn new(grid: CombinationGrid) -> Self {
        Self { grid }
    }

    pub fn grid(&self) -> &CombinationGrid {
        &self.grid
    }

    /// Evaluate every combination once. The first successful one seeds the
    /// best; later ones must beat it strictly.
    pub fn run<O, W>(&self, objective: &mut O, observer: &mut W) -> SearchOutcome<O::Report>
    where
        O: Objective,
        W: SearchObserver<O::Report>,
    {
        let total = self.grid.len();
        let mut best = None;
        let mut improvements = 0;
        let mut evaluations = 0;

        for params in self.grid.iter() {
            let result = try_candidate(objective, observer, &mut best, params);
            evaluations += 1;
            let interrupted = match result {
                Ok(adopted) => {
                    improvements += usize::from(adopted);
                    observer.after_evaluation(evaluations, Some(total)).err()
                }
                Err(interrupt) => Some(interrupt),
            };
            if let Some(interrupt) = interrupted {
                return SearchOutcome {
                    best,
                    improvements,
                    evaluations,
                    end: SearchEnd::Interrupted(interrupt),
                };
            }
        }

        let end = if best.is_some() {
            SearchEnd::Completed
        } else {
            SearchEnd::NoResults
        };
        SearchOutcome {
            best,
            improvements,
            evaluations,
            end,
        }
    }
}
