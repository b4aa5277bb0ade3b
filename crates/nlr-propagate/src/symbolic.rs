//! Forward symbolic (affine-relaxation) bound propagation.
//!
//! Every neuron carries a certified lower and upper affine expression over
//! the input-layer neurons. Expressions are composed layer by layer and
//! then concretized over the input box.

use crate::activation::{self, Line, Relaxation};
use crate::network::NetworkGraph;
use crate::types::{BoundUpdate, PropagationConfig};
use ndarray::{Array1, Array2, ArrayView1};
use nlr_core::{Bound, BoundKind, LayerType, NeuronIndex, NlrError, Result};
use tracing::{debug, instrument, trace};

/// Affine lower/upper bounds of one layer over the input neurons.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolicBounds {
    /// Lower bound coefficient matrix: shape (size, num_inputs)
    pub lower_a: Array2<f64>,
    /// Lower bound constant: shape (size,)
    pub lower_b: Array1<f64>,
    /// Upper bound coefficient matrix: shape (size, num_inputs)
    pub upper_a: Array2<f64>,
    /// Upper bound constant: shape (size,)
    pub upper_b: Array1<f64>,
}

impl SymbolicBounds {
    /// All-zero expressions.
    pub fn zeros(size: usize, num_inputs: usize) -> Self {
        Self {
            lower_a: Array2::zeros((size, num_inputs)),
            lower_b: Array1::zeros(size),
            upper_a: Array2::zeros((size, num_inputs)),
            upper_b: Array1::zeros(size),
        }
    }

    pub fn num_outputs(&self) -> usize {
        self.lower_a.nrows()
    }

    pub fn num_inputs(&self) -> usize {
        self.lower_a.ncols()
    }

    fn row(&self, kind: BoundKind, neuron: usize) -> (ArrayView1<'_, f64>, f64) {
        match kind {
            BoundKind::Lower => (self.lower_a.row(neuron), self.lower_b[neuron]),
            BoundKind::Upper => (self.upper_a.row(neuron), self.upper_b[neuron]),
        }
    }

    /// Set one side of `neuron` to `line(source expression)`.
    fn set_row(
        &mut self,
        kind: BoundKind,
        neuron: usize,
        line: Line,
        source: Option<(ArrayView1<'_, f64>, f64)>,
    ) {
        let (a, b) = match kind {
            BoundKind::Lower => (&mut self.lower_a, &mut self.lower_b),
            BoundKind::Upper => (&mut self.upper_a, &mut self.upper_b),
        };
        let mut row = a.row_mut(neuron);
        match source {
            Some((coeffs, constant)) if line.slope != 0.0 => {
                row.assign(&(&coeffs * line.slope));
                b[neuron] = line.slope * constant + line.intercept;
            }
            _ => {
                row.fill(0.0);
                b[neuron] = line.intercept;
            }
        }
    }

    fn set_constant(&mut self, neuron: usize, lower: f64, upper: f64) {
        self.set_row(BoundKind::Lower, neuron, Line::constant(lower), None);
        self.set_row(BoundKind::Upper, neuron, Line::constant(upper), None);
    }

    /// Concretize the expressions over the input box.
    ///
    /// Zero coefficients are skipped so that `0 * inf` contributes `0`.
    pub fn concretize(&self, inputs: &[Bound]) -> Vec<Bound> {
        (0..self.num_outputs())
            .map(|i| {
                let mut lower = self.lower_b[i];
                let mut upper = self.upper_b[i];
                for (j, input) in inputs.iter().enumerate() {
                    let a = self.lower_a[[i, j]];
                    if a > 0.0 {
                        lower += a * input.lower;
                    } else if a < 0.0 {
                        lower += a * input.upper;
                    }
                    let a = self.upper_a[[i, j]];
                    if a > 0.0 {
                        upper += a * input.upper;
                    } else if a < 0.0 {
                        upper += a * input.lower;
                    }
                }
                Bound {
                    lower,
                    upper: upper.max(lower),
                }
            })
            .collect()
    }
}

fn flip(kind: BoundKind) -> BoundKind {
    match kind {
        BoundKind::Lower => BoundKind::Upper,
        BoundKind::Upper => BoundKind::Lower,
    }
}

/// Which side of the source expression feeds `kind` through a line of this slope.
fn source_side(kind: BoundKind, slope: f64) -> BoundKind {
    if slope >= 0.0 {
        kind
    } else {
        flip(kind)
    }
}

/// Run one symbolic pass over the whole network.
///
/// Layers are visited in topological order; each layer's expressions are
/// stored on the layer and its concretization tightens the concrete bounds
/// before later layers read them. Improvements are appended to `updates`.
#[instrument(skip_all)]
pub fn symbolic_pass(
    graph: &mut NetworkGraph,
    config: &PropagationConfig,
    updates: &mut Vec<BoundUpdate>,
) -> Result<()> {
    let order = graph.topological_order()?;
    let inputs = graph.input_neurons();
    let mut input_box = Vec::with_capacity(inputs.len());
    for &input in &inputs {
        input_box.push(graph.bound(input)?);
    }

    let start = updates.len();
    for id in order {
        let symbolic = layer_expressions(graph, id, &inputs, config)?;
        let concrete = symbolic.concretize(&input_box);
        graph.layer_mut(id)?.set_symbolic_bounds(symbolic);

        for (neuron, bound) in concrete.into_iter().enumerate() {
            let index = NeuronIndex::new(id, neuron);
            for (kind, value) in [(BoundKind::Lower, bound.lower), (BoundKind::Upper, bound.upper)]
            {
                if let Some(update) = graph.tighten(index, kind, value)? {
                    trace!(neuron = %index, ?kind, value, "symbolic tightening");
                    updates.push(update);
                }
            }
        }
    }
    debug!(updates = updates.len() - start, "symbolic pass finished");
    Ok(())
}

fn layer_expressions(
    graph: &NetworkGraph,
    id: usize,
    inputs: &[NeuronIndex],
    config: &PropagationConfig,
) -> Result<SymbolicBounds> {
    let layer = graph.layer(id)?;
    let n_inputs = inputs.len();
    let mut out = SymbolicBounds::zeros(layer.size(), n_inputs);

    match layer.layer_type() {
        LayerType::Input => {
            for (column, input) in inputs.iter().enumerate() {
                if input.layer == id {
                    out.lower_a[[input.neuron, column]] = 1.0;
                    out.upper_a[[input.neuron, column]] = 1.0;
                }
            }
        }
        LayerType::WeightedSum => {
            out.lower_b.assign(layer.biases());
            out.upper_b.assign(layer.biases());
            for &source in layer.source_layers().keys() {
                let Some(weights) = layer.weights(source) else {
                    continue;
                };
                let from = source_expressions(graph, source)?;
                let w_pos = weights.mapv(|w| w.max(0.0));
                let w_neg = weights.mapv(|w| w.min(0.0));
                out.lower_a = &out.lower_a
                    + &w_pos.t().dot(&from.lower_a)
                    + &w_neg.t().dot(&from.upper_a);
                out.upper_a = &out.upper_a
                    + &w_pos.t().dot(&from.upper_a)
                    + &w_neg.t().dot(&from.lower_a);
                // Constants can be infinite after a degraded relaxation.
                for ((i, j), &w) in weights.indexed_iter() {
                    if w > 0.0 {
                        out.lower_b[j] += w * from.lower_b[i];
                        out.upper_b[j] += w * from.upper_b[i];
                    } else if w < 0.0 {
                        out.lower_b[j] += w * from.upper_b[i];
                        out.upper_b[j] += w * from.lower_b[i];
                    }
                }
            }
        }
        kind => {
            let ops = activation::ops(kind)
                .ok_or(NlrError::UnsupportedActivation {
                    layer_type: kind,
                    operation: "symbolic propagation",
                })?;
            for neuron in 0..layer.size() {
                let sources = layer.activation_sources(neuron);
                let Some(&first) = sources.first() else {
                    continue;
                };
                if let Some(line) = layer
                    .fixed_phase(neuron)
                    .and_then(|p| activation::phase_line(kind, p))
                {
                    let from = source_expressions(graph, first.layer)?;
                    apply_line(&mut out, neuron, line, line, from, first.neuron);
                    continue;
                }
                let bounds = graph.source_bounds(layer, neuron)?;
                match (ops.relaxation)(&bounds, config.relu_lower_relaxation) {
                    Relaxation::Affine { lower, upper } => {
                        let from = source_expressions(graph, first.layer)?;
                        apply_line(&mut out, neuron, lower, upper, from, first.neuron);
                    }
                    Relaxation::Select(k) => {
                        let source = sources[k];
                        let from = source_expressions(graph, source.layer)?;
                        apply_line(
                            &mut out,
                            neuron,
                            Line::IDENTITY,
                            Line::IDENTITY,
                            from,
                            source.neuron,
                        );
                    }
                    Relaxation::Dominated {
                        lower_source,
                        upper,
                    } => {
                        let source = sources[lower_source];
                        let from = source_expressions(graph, source.layer)?;
                        out.set_row(
                            BoundKind::Lower,
                            neuron,
                            Line::IDENTITY,
                            Some(from.row(BoundKind::Lower, source.neuron)),
                        );
                        out.set_row(BoundKind::Upper, neuron, Line::constant(upper), None);
                    }
                }
            }
        }
    }

    for (&neuron, &value) in layer.eliminated_neurons() {
        out.set_constant(neuron, value, value);
    }
    Ok(out)
}

fn apply_line(
    out: &mut SymbolicBounds,
    neuron: usize,
    lower: Line,
    upper: Line,
    from: &SymbolicBounds,
    source: usize,
) {
    out.set_row(
        BoundKind::Lower,
        neuron,
        lower,
        Some(from.row(source_side(BoundKind::Lower, lower.slope), source)),
    );
    out.set_row(
        BoundKind::Upper,
        neuron,
        upper,
        Some(from.row(source_side(BoundKind::Upper, upper.slope), source)),
    );
}

fn source_expressions(graph: &NetworkGraph, layer: usize) -> Result<&SymbolicBounds> {
    graph.layer(layer)?.symbolic_bounds().ok_or_else(|| {
        NlrError::Topology(format!(
            "layer {layer} has no symbolic bounds; visit order is broken"
        ))
    })
}
