//! Configuration and result types for bound propagation.

use nlr_core::{BoundKind, LayerType, NeuronIndex};
use serde::{Deserialize, Serialize};

/// Configuration for iterated bound propagation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropagationConfig {
    /// Passes run by `iterative_propagation`, cheapest first.
    pub passes: Vec<PropagationPass>,
    /// Maximum number of rounds over `passes`.
    pub max_iterations: usize,
    /// A round whose best improvement is at most this counts as a fixpoint.
    pub tolerance: f64,
    /// Lower relaxation used for crossing ReLUs.
    #[serde(default)]
    pub relu_lower_relaxation: ReluLowerRelaxation,
    /// Maximum oracle calls per LP/MILP pass; `None` is unlimited.
    #[serde(default)]
    pub oracle_call_budget: Option<usize>,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            passes: vec![PropagationPass::Interval, PropagationPass::Symbolic],
            max_iterations: 10,
            tolerance: 1e-6,
            relu_lower_relaxation: ReluLowerRelaxation::Zero,
            oracle_call_budget: None,
        }
    }
}

/// Available propagation passes, ordered by increasing cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PropagationPass {
    /// Interval arithmetic: fastest, loosest.
    Interval,
    /// Forward affine relaxation over the input box.
    Symbolic,
    /// Backward substitution of the relaxations down to the input box.
    DeepPoly,
    /// LP relaxation per layer through the oracle.
    Lp,
    /// Exact MILP encoding of unstable neurons through the oracle.
    Milp,
}

impl PropagationPass {
    pub fn needs_oracle(self) -> bool {
        matches!(self, PropagationPass::Lp | PropagationPass::Milp)
    }

    /// Whether this pass can bound layers of `layer_type`. Sigmoid has no
    /// exact mixed-integer encoding.
    pub fn supports(self, layer_type: LayerType) -> bool {
        !(self == PropagationPass::Milp && layer_type == LayerType::Sigmoid)
    }
}

/// Lower line for a ReLU whose input interval crosses zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReluLowerRelaxation {
    /// `y >= 0`.
    #[default]
    Zero,
    /// `y >= x` when `u > -l`, else `y >= 0` (smaller-area triangle).
    Adaptive,
}

/// One bound a pass improved on a neuron.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundUpdate {
    pub neuron: NeuronIndex,
    pub kind: BoundKind,
    pub value: f64,
    pub previous: f64,
}

impl BoundUpdate {
    /// How far the bound moved; infinite when it was unbounded before.
    pub fn improvement(&self) -> f64 {
        (self.value - self.previous).abs()
    }
}

/// Outcome of `iterative_propagation`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropagationSummary {
    /// Rounds executed.
    pub iterations: usize,
    /// Neuron bounds improved across all rounds.
    pub updates: usize,
    /// Tightenings appended to the log (bound neurons only).
    pub tightenings: usize,
    /// Whether the loop stopped at a fixpoint rather than the budget.
    pub converged: bool,
}
