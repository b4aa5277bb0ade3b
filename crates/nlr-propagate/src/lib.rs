//! Topology-aware bound propagation and network reduction.
//!
//! Implements several propagation passes with increasing precision and cost:
//! - Interval arithmetic: fastest, loosest bounds
//! - Symbolic: forward affine relaxation over the input box
//! - DeepPoly: backward substitution of the relaxations to the input box
//! - LP: per-layer linear relaxation solved by an external oracle
//! - MILP: exact big-M encoding of unstable neurons, same oracle
//!
//! [`NetworkLevelReasoner`] owns the network, runs the passes and logs the
//! tightenings it finds for solver variables. [`NetworkReducer`] fixes the
//! activation state of neurons whose bounds certify it.

pub mod activation;
pub mod deep_poly;
pub mod encode;
pub mod interval;
pub mod layer;
pub mod lp;
pub mod merge;
pub mod network;
pub mod reasoner;
pub mod reducer;
pub mod symbolic;
pub mod types;

pub use activation::{ActivationOps, Line, Relaxation};
pub use deep_poly::{back_substitute, deep_poly_pass};
pub use interval::{interval_pass, safe_mul_for_bounds};
pub use layer::{Layer, Phase};
pub use lp::{
    build_model, ConstraintSense, Encoding, LpConstraint, LpModel, LpOracle, LpVariable,
    Objective, OracleOutcome,
};
pub use merge::MergeGuards;
pub use network::NetworkGraph;
pub use reasoner::NetworkLevelReasoner;
pub use reducer::{stability_buckets, NetworkReducer, Reduction, ReductionReport, StabilityBucket};
pub use symbolic::{symbolic_pass, SymbolicBounds};
pub use types::{
    BoundUpdate, PropagationConfig, PropagationPass, PropagationSummary, ReluLowerRelaxation,
};

// Re-export core types for tests and downstream use
pub use nlr_core::{
    Bound, BoundExplainer, BoundKind, BoundStore, Equation, LayerId, LayerType,
    LinearExpression, NeuronIndex, NlrError, PiecewiseLinearConstraint, Query, Result,
    Tightening, Variable,
};

#[cfg(test)]
mod tests;
