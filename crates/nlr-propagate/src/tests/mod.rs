//! Integration-style suites for the propagation crate, with shared fixtures.

mod interval;
mod proptest_soundness;
mod symbolic;

use crate::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Slack for floating-point noise in containment checks.
pub(crate) const FP_TOLERANCE: f64 = 1e-7;

/// Build `Input -> (WS -> activation)* -> WS` with random weights in
/// `[-1, 1]` and variables numbered layer by layer.
///
/// `widths[0]` is the input width, the last entry the output width. A
/// `Max` activation halves the width by pairing neighbouring neurons.
pub(crate) fn random_network(seed: u64, widths: &[usize], activation: LayerType) -> NetworkLevelReasoner {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut nlr = NetworkLevelReasoner::new();
    let mut next_variable = 0;
    let mut bind = |nlr: &mut NetworkLevelReasoner, layer: LayerId, size: usize| {
        for neuron in 0..size {
            nlr.set_neuron_variable(NeuronIndex::new(layer, neuron), next_variable)
                .unwrap();
            next_variable += 1;
        }
    };

    nlr.add_layer(0, LayerType::Input, widths[0]).unwrap();
    bind(&mut nlr, 0, widths[0]);
    let mut previous = (0, widths[0]);
    let mut id = 1;
    let hidden = widths.len() - 1;
    for (step, &width) in widths[1..].iter().enumerate() {
        nlr.add_layer(id, LayerType::WeightedSum, width).unwrap();
        nlr.add_layer_dependency(previous.0, id).unwrap();
        for target in 0..width {
            for source in 0..previous.1 {
                nlr.set_weight(previous.0, source, id, target, rng.random_range(-1.0..1.0))
                    .unwrap();
            }
            nlr.set_bias(id, target, rng.random_range(-0.5..0.5)).unwrap();
        }
        bind(&mut nlr, id, width);
        previous = (id, width);
        id += 1;

        if step + 1 == hidden {
            break;
        }
        let size = if activation == LayerType::Max {
            width.div_ceil(2)
        } else {
            width
        };
        nlr.add_layer(id, activation, size).unwrap();
        for neuron in 0..size {
            if activation == LayerType::Max {
                nlr.add_activation_source(previous.0, 2 * neuron, id, neuron)
                    .unwrap();
                nlr.add_activation_source(previous.0, (2 * neuron + 1) % width, id, neuron)
                    .unwrap();
            } else {
                nlr.add_activation_source(previous.0, neuron, id, neuron)
                    .unwrap();
            }
        }
        bind(&mut nlr, id, size);
        previous = (id, size);
        id += 1;
    }
    nlr
}

/// Store with the given box on the input variables `0..n` and nothing else.
pub(crate) fn input_box(bounds: &[(f64, f64)]) -> Vec<Bound> {
    bounds.iter().map(|&(l, u)| Bound::new(l, u)).collect()
}

pub(crate) fn sample_input(rng: &mut StdRng, bounds: &[Bound]) -> Vec<f64> {
    bounds
        .iter()
        .map(|b| {
            if b.lower == b.upper {
                b.lower
            } else {
                rng.random_range(b.lower..=b.upper)
            }
        })
        .collect()
}

/// Every neuron's concrete value lies in its current interval.
pub(crate) fn check_contains(graph: &NetworkGraph, values: &BTreeMap<LayerId, Vec<f64>>) -> std::result::Result<(), String> {
    for layer in graph.layers() {
        for (neuron, &value) in values[&layer.id()].iter().enumerate() {
            let b = layer.bound(neuron);
            if value < b.lower - FP_TOLERANCE || value > b.upper + FP_TOLERANCE {
                return Err(format!(
                    "neuron ({}, {}) = {} outside [{}, {}]",
                    layer.id(),
                    neuron,
                    value,
                    b.lower,
                    b.upper
                ));
            }
        }
    }
    Ok(())
}

/// All `(lb, ub)` pairs, keyed by neuron.
pub(crate) fn snapshot(graph: &NetworkGraph) -> BTreeMap<NeuronIndex, Bound> {
    graph
        .layers()
        .flat_map(|l| (0..l.size()).map(move |n| (NeuronIndex::new(l.id(), n), l.bound(n))))
        .collect()
}

/// The worked example: `INPUT(3) -> WS(identity) -> RELU(3) -> WS(1)`,
/// variables 0..=9, query generated and input bounds set on variables 0..=2.
pub(crate) fn reducer_example() -> (NetworkLevelReasoner, Query) {
    let mut nlr = NetworkLevelReasoner::new();
    nlr.add_layer(0, LayerType::Input, 3).unwrap();
    nlr.add_layer(1, LayerType::WeightedSum, 3).unwrap();
    nlr.add_layer(2, LayerType::Relu, 3).unwrap();
    nlr.add_layer(3, LayerType::WeightedSum, 1).unwrap();
    for i in 1..=3 {
        nlr.add_layer_dependency(i - 1, i).unwrap();
    }
    for i in 0..3 {
        nlr.set_weight(0, i, 1, i, 1.0).unwrap();
        nlr.set_bias(1, i, 0.0).unwrap();
        nlr.add_activation_source(1, i, 2, i).unwrap();
        nlr.set_weight(2, i, 3, 0, 1.0).unwrap();
    }
    nlr.set_bias(3, 0, 0.0).unwrap();

    let mut variable = 0;
    for (layer, size) in [(0, 3), (1, 3), (2, 3), (3, 1)] {
        for neuron in 0..size {
            nlr.set_neuron_variable(NeuronIndex::new(layer, neuron), variable)
                .unwrap();
            variable += 1;
        }
    }

    let mut query = nlr.generate_query().unwrap();
    // ReLU 0 stable false, ReLU 1 stable true, ReLU 2 unstable.
    for (v, (l, u)) in [(-2.0, -1.0), (1.0, 2.0), (-1.0, 1.0)].into_iter().enumerate() {
        query.set_lower_bound(v, l);
        query.set_upper_bound(v, u);
    }
    (nlr, query)
}

pub(crate) type ExplanationLog = Arc<Mutex<Vec<(BoundKind, Variable, f64)>>>;

/// Explainer that records every bound update it is told about.
pub(crate) struct Recorder(ExplanationLog);

impl BoundExplainer for Recorder {
    fn update_lb_explanation(&mut self, variable: Variable, value: f64) {
        self.0.lock().unwrap().push((BoundKind::Lower, variable, value));
    }

    fn update_ub_explanation(&mut self, variable: Variable, value: f64) {
        self.0.lock().unwrap().push((BoundKind::Upper, variable, value));
    }
}

pub(crate) fn recorder() -> (Box<Recorder>, ExplanationLog) {
    let log = ExplanationLog::default();
    (Box::new(Recorder(log.clone())), log)
}

/// Oracle test double that replays a fixed script of outcomes.
///
/// Once the script runs out it answers `Unknown`.
pub(crate) struct ScriptedOracle {
    pub script: VecDeque<Result<OracleOutcome>>,
    pub calls: Vec<Objective>,
    pub models: Vec<LpModel>,
}

impl ScriptedOracle {
    pub fn new(script: Vec<Result<OracleOutcome>>) -> Self {
        Self {
            script: script.into(),
            calls: Vec::new(),
            models: Vec::new(),
        }
    }
}

impl LpOracle for ScriptedOracle {
    fn solve(&mut self, model: &LpModel, objective: Objective) -> Result<OracleOutcome> {
        self.calls.push(objective);
        self.models.push(model.clone());
        self.script
            .pop_front()
            .unwrap_or(Ok(OracleOutcome::Unknown))
    }
}

/// Oracle that answers with the current box of the objective column, which
/// is always a valid (if loose) bound on the optimum.
pub(crate) struct BoxOracle;

impl LpOracle for BoxOracle {
    fn solve(&mut self, model: &LpModel, objective: Objective) -> Result<OracleOutcome> {
        let value = match objective {
            Objective::Minimize(c) => model.variables()[c].lower,
            Objective::Maximize(c) => model.variables()[c].upper,
        };
        Ok(OracleOutcome::Optimal(value))
    }
}
