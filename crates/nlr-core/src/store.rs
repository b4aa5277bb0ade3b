//! Seams to the external bound store and proof-explanation layer.

use crate::{Bound, Query, Variable};

/// Source of the current concrete bounds of solver variables.
///
/// The outer search owns variable bounds; the reasoner only reads them
/// through this trait and reports improvements through its tightening log.
pub trait BoundStore {
    fn lower_bound(&self, variable: Variable) -> f64;
    fn upper_bound(&self, variable: Variable) -> f64;

    fn bound(&self, variable: Variable) -> Bound {
        Bound {
            lower: self.lower_bound(variable),
            upper: self.upper_bound(variable),
        }
    }
}

impl BoundStore for Query {
    fn lower_bound(&self, variable: Variable) -> f64 {
        Query::lower_bound(self, variable)
    }

    fn upper_bound(&self, variable: Variable) -> f64 {
        Query::upper_bound(self, variable)
    }
}

/// Bounds indexed by variable; variables past the end are unbounded.
impl BoundStore for [Bound] {
    fn lower_bound(&self, variable: Variable) -> f64 {
        self.get(variable).map_or(f64::NEG_INFINITY, |b| b.lower)
    }

    fn upper_bound(&self, variable: Variable) -> f64 {
        self.get(variable).map_or(f64::INFINITY, |b| b.upper)
    }
}

impl BoundStore for Vec<Bound> {
    fn lower_bound(&self, variable: Variable) -> f64 {
        self.as_slice().lower_bound(variable)
    }

    fn upper_bound(&self, variable: Variable) -> f64 {
        self.as_slice().upper_bound(variable)
    }
}

/// Hooks of a proof-production component.
///
/// When attached to a reasoner, every bound it accepts is reported here so
/// the explainer can reconstruct why the bound holds.
pub trait BoundExplainer {
    fn update_lb_explanation(&mut self, variable: Variable, value: f64);
    fn update_ub_explanation(&mut self, variable: Variable, value: f64);
}
