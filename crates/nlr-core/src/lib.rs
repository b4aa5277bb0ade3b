//! Core types for network-level bound reasoning.
//!
//! This crate provides the value types shared by the propagation engine and
//! its external collaborators: concrete bounds, neuron addresses, discovered
//! tightenings, the flat constraint system handed to the downstream solver,
//! and the seams through which the engine talks to a bound store and a
//! proof-explanation layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;
use thiserror::Error;

pub mod query;
pub mod store;

pub use query::{Addend, Equation, LinearExpression, PiecewiseLinearConstraint, Query};
pub use store::{BoundExplainer, BoundStore};

/// External solver variable id.
pub type Variable = usize;

/// Dense layer id, assigned at construction.
pub type LayerId = usize;

/// Default slack used when comparing bounds.
pub const BOUND_EPSILON: f64 = 1e-9;

/// A bound on a scalar value: [lower, upper].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    pub lower: f64,
    pub upper: f64,
}

impl Bound {
    /// Create a new bound.
    #[inline]
    pub fn new(lower: f64, upper: f64) -> Self {
        debug_assert!(lower <= upper, "Invalid bound: {lower} > {upper}");
        Self { lower, upper }
    }

    /// The whole real line.
    #[inline]
    pub fn unbounded() -> Self {
        Self {
            lower: f64::NEG_INFINITY,
            upper: f64::INFINITY,
        }
    }

    /// Create a concrete (point) bound.
    #[inline]
    pub fn concrete(value: f64) -> Self {
        Self {
            lower: value,
            upper: value,
        }
    }

    #[inline]
    pub fn contains(&self, value: f64) -> bool {
        self.lower <= value && value <= self.upper
    }

    #[inline]
    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }

    /// Check if this bound is a single point (up to `epsilon`).
    #[inline]
    pub fn is_fixed(&self, epsilon: f64) -> bool {
        self.width() <= epsilon
    }

    /// Check if either end is infinite.
    #[inline]
    pub fn is_unbounded(&self) -> bool {
        self.lower.is_infinite() || self.upper.is_infinite()
    }

    /// Intersect two bounds, `None` when they are disjoint.
    #[inline]
    pub fn intersect(&self, other: &Bound) -> Option<Bound> {
        let lower = self.lower.max(other.lower);
        let upper = self.upper.min(other.upper);
        if lower <= upper {
            Some(Bound { lower, upper })
        } else {
            None
        }
    }

    /// Convex hull of two bounds.
    #[inline]
    pub fn union(&self, other: &Bound) -> Bound {
        Bound {
            lower: self.lower.min(other.lower),
            upper: self.upper.max(other.upper),
        }
    }

    /// Distance of the interval from zero: `min(|lower|, |upper|)`.
    ///
    /// For a pre-activation bound this is the stability score: a small value
    /// means the sign could plausibly flip, a large one means the neuron sits
    /// comfortably on one side.
    #[inline]
    pub fn stability_score(&self) -> f64 {
        self.lower.abs().min(self.upper.abs())
    }
}

impl Default for Bound {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl From<RangeInclusive<f64>> for Bound {
    fn from(range: RangeInclusive<f64>) -> Self {
        Self::new(*range.start(), *range.end())
    }
}

/// Address of one neuron: `(layer, neuron)`.
///
/// Ordered lexicographically, which is the order the reducer uses to break
/// ties between equal stability scores.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct NeuronIndex {
    pub layer: LayerId,
    pub neuron: usize,
}

impl NeuronIndex {
    #[inline]
    pub const fn new(layer: LayerId, neuron: usize) -> Self {
        Self { layer, neuron }
    }
}

impl fmt::Display for NeuronIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.layer, self.neuron)
    }
}

/// Layer types understood by the reasoner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayerType {
    Input,
    WeightedSum,
    Relu,
    Sigmoid,
    /// y = -1 if x < 0, 1 if x >= 0
    Sign,
    AbsoluteValue,
    /// Maximum over a set of source neurons.
    Max,
}

impl LayerType {
    /// Layers whose neurons read activation sources rather than weights.
    pub fn is_activation(self) -> bool {
        !matches!(self, LayerType::Input | LayerType::WeightedSum)
    }

    /// Activations with a piecewise-linear graph.
    pub fn is_piecewise_linear(self) -> bool {
        matches!(
            self,
            LayerType::Relu | LayerType::Sign | LayerType::AbsoluteValue | LayerType::Max
        )
    }

    /// Activations that read exactly one source neuron.
    pub fn is_single_source(self) -> bool {
        matches!(
            self,
            LayerType::Relu | LayerType::Sigmoid | LayerType::Sign | LayerType::AbsoluteValue
        )
    }
}

impl fmt::Display for LayerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LayerType::Input => "INPUT",
            LayerType::WeightedSum => "WEIGHTED_SUM",
            LayerType::Relu => "RELU",
            LayerType::Sigmoid => "SIGMOID",
            LayerType::Sign => "SIGN",
            LayerType::AbsoluteValue => "ABSOLUTE_VALUE",
            LayerType::Max => "MAX",
        };
        f.write_str(name)
    }
}

/// Which side of a variable's domain a tightening refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BoundKind {
    Lower,
    Upper,
}

/// A discovered bound fact: `variable >= value` or `variable <= value`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tightening {
    pub variable: Variable,
    pub value: f64,
    pub kind: BoundKind,
}

impl Tightening {
    #[inline]
    pub fn new(variable: Variable, value: f64, kind: BoundKind) -> Self {
        Self {
            variable,
            value,
            kind,
        }
    }

    #[inline]
    pub fn lower(variable: Variable, value: f64) -> Self {
        Self::new(variable, value, BoundKind::Lower)
    }

    #[inline]
    pub fn upper(variable: Variable, value: f64) -> Self {
        Self::new(variable, value, BoundKind::Upper)
    }
}

impl fmt::Display for Tightening {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.kind {
            BoundKind::Lower => ">=",
            BoundKind::Upper => "<=",
        };
        write!(f, "x{} {} {}", self.variable, op, self.value)
    }
}

/// Error types for network-level reasoning.
#[derive(Debug, Error)]
pub enum NlrError {
    /// Malformed construction call: unknown layer, wrong operation for the
    /// layer type, neuron out of range, cyclic dependency.
    #[error("Topology error: {0}")]
    Topology(String),

    #[error("Unknown variable: x{0}")]
    UnknownVariable(Variable),

    /// A bound update would leave `lower > upper`. This is a proof that the
    /// current subproblem is infeasible.
    #[error("Bound inconsistency at neuron {neuron}: lower {lower} > upper {upper}")]
    BoundInconsistency {
        neuron: NeuronIndex,
        lower: f64,
        upper: f64,
    },

    /// The LP/MILP oracle proved the relaxation of the current box empty.
    #[error("Relaxation infeasible while tightening layer {layer}")]
    InfeasibleRelaxation { layer: LayerId },

    #[error("LP oracle unavailable: {0}")]
    OracleUnavailable(String),

    #[error("Unsupported activation {layer_type} for {operation}")]
    UnsupportedActivation {
        layer_type: LayerType,
        operation: &'static str,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl NlrError {
    /// True when the error is a proof that the current bound box is empty.
    pub fn is_infeasibility(&self) -> bool {
        matches!(
            self,
            NlrError::BoundInconsistency { .. } | NlrError::InfeasibleRelaxation { .. }
        )
    }

    pub fn is_topology(&self) -> bool {
        matches!(self, NlrError::Topology(_))
    }
}

pub type Result<T> = std::result::Result<T, NlrError>;
