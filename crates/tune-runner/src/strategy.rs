//! The search-algorithm seam.
//!
//! Strategies propose points from a categorical [`SearchSpace`] and observe
//! objective values; they know nothing about infrastructure. The two
//! built-in strategies do no modelling and exist so a run can be driven end
//! to end.

use crate::config::{ParamSet, ParamValue};
use crate::cost::{validate_shape, ProviderConstraints};
use crate::service::Service;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dimension {
    pub name: String,
    pub choices: Vec<ParamValue>,
}

/// Provider limits a point's resource shape must satisfy.
#[derive(Debug, Clone, PartialEq)]
pub struct Feasibility {
    pub service: Service,
    pub provider: String,
    pub constraints: ProviderConstraints,
}

impl Feasibility {
    /// Points that do not parse are admitted; the trial records why.
    pub fn admits(&self, point: &ParamSet) -> bool {
        match self.service.parse_config(point) {
            Ok(config) => validate_shape(&config.shape(), &self.constraints, &self.provider).is_ok(),
            Err(_) => true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchSpace {
    /// Merged into every proposed point.
    pub fixed: ParamSet,
    pub dims: Vec<Dimension>,
    #[serde(skip)]
    pub feasibility: Option<Feasibility>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fixed(mut self, name: &str, value: impl Into<ParamValue>) -> Self {
        self.fixed.insert(name, value);
        self
    }

    pub fn choice<V: Into<ParamValue>>(mut self, name: &str, choices: Vec<V>) -> Self {
        self.dims.push(Dimension {
            name: name.to_string(),
            choices: choices.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Pins dimensions named in `overrides` to the given values.
    pub fn with_fixed(mut self, overrides: &ParamSet) -> Self {
        self.dims.retain(|d| overrides.get(&d.name).is_none());
        self.fixed = self.fixed.merged(overrides);
        self
    }

    /// Strategies skip points whose shape `service` cannot get from
    /// `provider`.
    pub fn feasible_on(mut self, service: Service, provider: &str, constraints: &ProviderConstraints) -> Self {
        self.feasibility = Some(Feasibility {
            service,
            provider: provider.to_string(),
            constraints: constraints.clone(),
        });
        self
    }

    pub fn admits(&self, point: &ParamSet) -> bool {
        self.feasibility.as_ref().map_or(true, |f| f.admits(point))
    }

    /// Number of distinct points, feasible or not.
    pub fn size(&self) -> usize {
        self.dims.iter().map(|d| d.choices.len()).product()
    }

    pub fn feasible_size(&self) -> usize {
        (0..self.size())
            .filter_map(|i| self.point(i))
            .filter(|p| self.admits(p))
            .count()
    }

    /// The `index`-th point in grid order, last dimension varying fastest.
    pub fn point(&self, index: usize) -> Option<ParamSet> {
        if index >= self.size() {
            return None;
        }
        let mut out = self.fixed.clone();
        let mut rest = index;
        for dim in self.dims.iter().rev() {
            let n = dim.choices.len();
            out.insert(&dim.name, dim.choices[rest % n].clone());
            rest /= n;
        }
        Some(out)
    }
}

pub trait SearchStrategy {
    fn name(&self) -> &'static str;
    /// Next configuration to evaluate, or `None` when the strategy is done.
    fn propose(&mut self) -> Option<ParamSet>;
    fn observe(&mut self, params: &ParamSet, value: f64);
}

/// Every feasible point of the space, in grid order, skipping evaluated
/// points.
pub struct GridSearch {
    space: SearchSpace,
    next: usize,
    seen: BTreeSet<String>,
}

impl GridSearch {
    pub fn new(space: SearchSpace) -> Self {
        Self {
            space,
            next: 0,
            seen: BTreeSet::new(),
        }
    }
}

impl SearchStrategy for GridSearch {
    fn name(&self) -> &'static str {
        "grid"
    }

    fn propose(&mut self) -> Option<ParamSet> {
        while let Some(point) = self.space.point(self.next) {
            self.next += 1;
            if self.space.admits(&point) && !self.seen.contains(&point.canonical_key()) {
                return Some(point);
            }
        }
        None
    }

    fn observe(&mut self, params: &ParamSet, _value: f64) {
        self.seen.insert(params.canonical_key());
    }
}

/// Uniform sampling without replacement from a seeded generator.
pub struct RandomSearch {
    order: Vec<usize>,
    space: SearchSpace,
    seen: BTreeSet<String>,
}

impl RandomSearch {
    pub fn new(space: SearchSpace, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut order: Vec<usize> = (0..space.size()).collect();
        order.shuffle(&mut rng);
        // popped from the back
        order.reverse();
        Self {
            order,
            space,
            seen: BTreeSet::new(),
        }
    }
}

impl SearchStrategy for RandomSearch {
    fn name(&self) -> &'static str {
        "random"
    }

    fn propose(&mut self) -> Option<ParamSet> {
        while let Some(index) = self.order.pop() {
            if let Some(point) = self.space.point(index) {
                if self.space.admits(&point) && !self.seen.contains(&point.canonical_key()) {
                    return Some(point);
                }
            }
        }
        None
    }

    fn observe(&mut self, params: &ParamSet, _value: f64) {
        self.seen.insert(params.canonical_key());
    }
}

/// Feeds prior results to a fresh strategy so they are not proposed again.
pub fn warm_start(strategy: &mut dyn SearchStrategy, history: &[(ParamSet, f64)]) {
    for (params, value) in history {
        strategy.observe(params, *value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> SearchSpace {
        SearchSpace::new()
            .fixed("mode", "single")
            .choice("cpu", vec![2i64, 4])
            .choice("disk_type", vec!["fast", "basic", "universal"])
    }

    #[test]
    fn grid_enumerates_every_point_once() {
        let mut grid = GridSearch::new(space());
        let mut keys = BTreeSet::new();
        while let Some(p) = grid.propose() {
            assert_eq!(p.get("mode"), Some(&ParamValue::from("single")));
            keys.insert(p.canonical_key());
        }
        assert_eq!(keys.len(), 6);
    }

    #[test]
    fn warm_start_skips_already_evaluated_points() {
        let mut grid = GridSearch::new(space());
        let done = space().point(0).expect("first point");
        warm_start(&mut grid, &[(done.clone(), 10.0)]);
        let first = grid.propose().expect("second point");
        assert_ne!(first, done);

        let mut random = RandomSearch::new(space(), 7);
        warm_start(&mut random, &[(done.clone(), 10.0)]);
        let proposed: Vec<ParamSet> = std::iter::from_fn(|| random.propose()).collect();
        assert_eq!(proposed.len(), 5);
        assert!(!proposed.contains(&done));
    }

    #[test]
    fn random_search_is_reproducible_for_a_seed() {
        let a: Vec<String> = {
            let mut s = RandomSearch::new(space(), 42);
            std::iter::from_fn(|| s.propose()).map(|p| p.canonical_key()).collect()
        };
        let b: Vec<String> = {
            let mut s = RandomSearch::new(space(), 42);
            std::iter::from_fn(|| s.propose()).map(|p| p.canonical_key()).collect()
        };
        assert_eq!(a, b);
        assert_eq!(a.len(), 6);
    }

    #[test]
    fn infeasible_shapes_are_never_proposed() {
        let constraints = ProviderConstraints {
            min_ram_gb_by_cpu: [(2, 2), (16, 32)].into_iter().collect(),
        };
        let space = SearchSpace::new()
            .fixed("mode", "single")
            .fixed("maxmemory_policy", "allkeys-lru")
            .fixed("io_threads", 2i64)
            .fixed("persistence", "none")
            .choice("cpu_per_node", vec![2i64, 16])
            .choice("ram_per_node", vec![4i64, 16])
            .feasible_on(Service::Redis, "selectel", &constraints);
        assert_eq!(space.size(), 4);
        assert_eq!(space.feasible_size(), 2);

        let too_small = |p: &ParamSet| p.get("cpu_per_node") == Some(&ParamValue::Int(16));
        let mut grid = GridSearch::new(space.clone());
        let proposed: Vec<ParamSet> = std::iter::from_fn(|| grid.propose()).collect();
        assert_eq!(proposed.len(), 2);
        assert!(!proposed.iter().any(too_small));

        let mut random = RandomSearch::new(space, 3);
        let proposed: Vec<ParamSet> = std::iter::from_fn(|| random.propose()).collect();
        assert_eq!(proposed.len(), 2);
        assert!(!proposed.iter().any(too_small));
    }

    #[test]
    fn with_fixed_pins_dimensions() {
        let pinned = space().with_fixed(&ParamSet::new().with("cpu", 8i64));
        assert_eq!(pinned.size(), 3);
        let p = pinned.point(2).expect("point");
        assert_eq!(p.get("cpu"), Some(&ParamValue::Int(8)));
        assert_eq!(pinned.point(3), None);
    }
}
