//! Backward (DeepPoly-style) bound propagation.
//!
//! Each layer is bounded by back-substituting the identity on its neurons
//! through the weights and activation relaxations of every ancestor, down
//! to the input neurons, and concretizing the result over the input box.
//! Layers are visited in topological order, so the relaxation of every
//! activation is built from source bounds already tightened by this pass.

use crate::activation::{self, ActivationOps, Line, Relaxation};
use crate::layer::Layer;
use crate::network::NetworkGraph;
use crate::symbolic::SymbolicBounds;
use crate::types::{BoundUpdate, PropagationConfig};
use ndarray::Array2;
use nlr_core::{BoundKind, LayerId, LayerType, NeuronIndex, NlrError, Result};
use std::collections::BTreeMap;
use tracing::{debug, instrument, trace};

/// Back-substitution coefficients waiting on one layer's neurons:
/// shape (target size, layer size).
struct Pending {
    lower: Array2<f64>,
    upper: Array2<f64>,
}

impl Pending {
    fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            lower: Array2::zeros((rows, cols)),
            upper: Array2::zeros((rows, cols)),
        }
    }

    fn side_mut(&mut self, kind: BoundKind) -> &mut Array2<f64> {
        match kind {
            BoundKind::Lower => &mut self.lower,
            BoundKind::Upper => &mut self.upper,
        }
    }
}

/// Lower and upper line of one activation neuron, each over one source.
#[derive(Debug, Clone, Copy)]
struct NeuronLines {
    lower: (Line, NeuronIndex),
    upper: (Line, NeuronIndex),
}

/// Run one backward pass over every non-input layer.
#[instrument(skip_all)]
pub fn deep_poly_pass(
    graph: &mut NetworkGraph,
    config: &PropagationConfig,
    updates: &mut Vec<BoundUpdate>,
) -> Result<()> {
    let inputs = graph.input_neurons();
    let columns: BTreeMap<NeuronIndex, usize> = inputs
        .iter()
        .enumerate()
        .map(|(column, &input)| (input, column))
        .collect();
    let mut input_box = Vec::with_capacity(inputs.len());
    for &input in &inputs {
        input_box.push(graph.bound(input)?);
    }

    let start = updates.len();
    for id in graph.topological_order()? {
        if graph.layer(id)?.layer_type() == LayerType::Input {
            continue;
        }
        let concrete = back_substitute(graph, id, &columns, config)?.concretize(&input_box);
        for (neuron, bound) in concrete.into_iter().enumerate() {
            let index = NeuronIndex::new(id, neuron);
            for (kind, value) in [(BoundKind::Lower, bound.lower), (BoundKind::Upper, bound.upper)]
            {
                if let Some(update) = graph.tighten(index, kind, value)? {
                    trace!(neuron = %index, ?kind, value, "back-substitution tightening");
                    updates.push(update);
                }
            }
        }
    }
    debug!(updates = updates.len() - start, "deep poly pass finished");
    Ok(())
}

/// Affine bounds of `target` over the input neurons, obtained by walking
/// its ancestors in reverse topological order.
pub fn back_substitute(
    graph: &NetworkGraph,
    target: LayerId,
    columns: &BTreeMap<NeuronIndex, usize>,
    config: &PropagationConfig,
) -> Result<SymbolicBounds> {
    let rows = graph.layer(target)?.size();
    let mut out = SymbolicBounds::zeros(rows, columns.len());
    let members = graph.ancestors_and_self(target)?;
    let order: Vec<LayerId> = graph
        .topological_order()?
        .into_iter()
        .filter(|id| members.contains(id))
        .collect();

    let mut pending = BTreeMap::new();
    pending.insert(
        target,
        Pending {
            lower: Array2::eye(rows),
            upper: Array2::eye(rows),
        },
    );

    for &id in order.iter().rev() {
        let Some(mut current) = pending.remove(&id) else {
            continue;
        };
        let layer = graph.layer(id)?;
        fold_eliminated(layer, &mut current, &mut out);

        match layer.layer_type() {
            LayerType::Input => {
                for neuron in 0..layer.size() {
                    let Some(&column) = columns.get(&NeuronIndex::new(id, neuron)) else {
                        continue;
                    };
                    out.lower_a
                        .column_mut(column)
                        .scaled_add(1.0, &current.lower.column(neuron));
                    out.upper_a
                        .column_mut(column)
                        .scaled_add(1.0, &current.upper.column(neuron));
                }
            }
            LayerType::WeightedSum => {
                out.lower_b = &out.lower_b + &current.lower.dot(layer.biases());
                out.upper_b = &out.upper_b + &current.upper.dot(layer.biases());
                for &source in layer.source_layers().keys() {
                    let Some(weights) = layer.weights(source) else {
                        continue;
                    };
                    let entry = pending
                        .entry(source)
                        .or_insert_with(|| Pending::zeros(rows, weights.nrows()));
                    entry.lower = &entry.lower + &current.lower.dot(&weights.t());
                    entry.upper = &entry.upper + &current.upper.dot(&weights.t());
                }
            }
            kind => {
                let ops = activation::ops(kind).ok_or(NlrError::UnsupportedActivation {
                    layer_type: kind,
                    operation: "back-substitution",
                })?;
                for neuron in 0..layer.size() {
                    if layer.neuron_eliminated(neuron) {
                        continue;
                    }
                    let lines = neuron_lines(graph, layer, neuron, ops, config)?;
                    substitute(graph, &mut pending, &mut out, &current, neuron, lines, rows)?;
                }
            }
        }
    }
    Ok(out)
}

/// Move eliminated neurons into the constants; they have no ancestors.
fn fold_eliminated(layer: &Layer, current: &mut Pending, out: &mut SymbolicBounds) {
    for (&neuron, &value) in layer.eliminated_neurons() {
        for (coefficients, constants) in [
            (&mut current.lower, &mut out.lower_b),
            (&mut current.upper, &mut out.upper_b),
        ] {
            for (constant, lambda) in constants
                .iter_mut()
                .zip(coefficients.column_mut(neuron).iter_mut())
            {
                if *lambda != 0.0 {
                    *constant += *lambda * value;
                    *lambda = 0.0;
                }
            }
        }
    }
}

fn neuron_lines(
    graph: &NetworkGraph,
    layer: &Layer,
    neuron: usize,
    ops: &ActivationOps,
    config: &PropagationConfig,
) -> Result<NeuronLines> {
    let sources = layer.activation_sources(neuron);
    let first = sources.first().copied().ok_or_else(|| {
        NlrError::Topology(format!(
            "neuron ({}, {neuron}) has no activation source",
            layer.id()
        ))
    })?;
    if let Some(line) = layer
        .fixed_phase(neuron)
        .and_then(|p| activation::phase_line(layer.layer_type(), p))
    {
        return Ok(NeuronLines {
            lower: (line, first),
            upper: (line, first),
        });
    }
    let bounds = graph.source_bounds(layer, neuron)?;
    Ok(match (ops.relaxation)(&bounds, config.relu_lower_relaxation) {
        Relaxation::Affine { lower, upper } => NeuronLines {
            lower: (lower, first),
            upper: (upper, first),
        },
        Relaxation::Select(k) => NeuronLines {
            lower: (Line::IDENTITY, sources[k]),
            upper: (Line::IDENTITY, sources[k]),
        },
        Relaxation::Dominated {
            lower_source,
            upper,
        } => NeuronLines {
            lower: (Line::IDENTITY, sources[lower_source]),
            upper: (Line::constant(upper), sources[lower_source]),
        },
    })
}

/// Replace column `neuron` of `current` by its relaxation lines. A positive
/// coefficient in a lower bound takes the lower line, a negative one the
/// upper line, and the other way round for upper bounds.
fn substitute(
    graph: &NetworkGraph,
    pending: &mut BTreeMap<LayerId, Pending>,
    out: &mut SymbolicBounds,
    current: &Pending,
    neuron: usize,
    lines: NeuronLines,
    rows: usize,
) -> Result<()> {
    for (kind, coefficients) in [
        (BoundKind::Lower, &current.lower),
        (BoundKind::Upper, &current.upper),
    ] {
        for (row, &lambda) in coefficients.column(neuron).iter().enumerate() {
            if lambda == 0.0 {
                continue;
            }
            let (line, source) = if (kind == BoundKind::Lower) == (lambda > 0.0) {
                lines.lower
            } else {
                lines.upper
            };
            let constants = match kind {
                BoundKind::Lower => &mut out.lower_b,
                BoundKind::Upper => &mut out.upper_b,
            };
            constants[row] += lambda * line.intercept;
            if line.slope != 0.0 {
                let cols = graph.layer(source.layer)?.size();
                pending
                    .entry(source.layer)
                    .or_insert_with(|| Pending::zeros(rows, cols))
                    .side_mut(kind)[[row, source.neuron]] += lambda * line.slope;
            }
        }
    }
    Ok(())
}
