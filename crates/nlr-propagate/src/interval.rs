//! Interval-arithmetic bound propagation.

use crate::activation;
use crate::network::NetworkGraph;
use crate::types::BoundUpdate;
use nlr_core::{Bound, BoundKind, LayerType, NeuronIndex, NlrError, Result};
use tracing::{debug, instrument, trace};

/// Multiply for bound computation, treating `0 * inf` as `0`.
#[inline]
pub fn safe_mul_for_bounds(a: f64, x: f64) -> f64 {
    if a == 0.0 || x == 0.0 {
        0.0
    } else {
        a * x
    }
}

/// Interval image of `w * x` for `x` in `bound`.
#[inline]
pub fn scale_interval(w: f64, bound: Bound) -> Bound {
    if w >= 0.0 {
        Bound {
            lower: safe_mul_for_bounds(w, bound.lower),
            upper: safe_mul_for_bounds(w, bound.upper),
        }
    } else {
        Bound {
            lower: safe_mul_for_bounds(w, bound.upper),
            upper: safe_mul_for_bounds(w, bound.lower),
        }
    }
}

/// Run one interval pass over the whole network in topological order.
///
/// New intervals are intersected with the stored ones; a neuron whose
/// image is disjoint from its stored interval surfaces as
/// `BoundInconsistency`. Improvements are appended to `updates` as they
/// are written, so an aborted pass still reports what it changed.
#[instrument(skip_all)]
pub fn interval_pass(graph: &mut NetworkGraph, updates: &mut Vec<BoundUpdate>) -> Result<()> {
    let start = updates.len();
    for id in graph.topological_order()? {
        let images = layer_images(graph, id)?;
        for (neuron, image) in images.into_iter().enumerate() {
            let Some(image) = image else {
                continue;
            };
            let index = NeuronIndex::new(id, neuron);
            for (kind, value) in [(BoundKind::Lower, image.lower), (BoundKind::Upper, image.upper)]
            {
                if let Some(update) = graph.tighten(index, kind, value)? {
                    trace!(neuron = %index, ?kind, value, "interval tightening");
                    updates.push(update);
                }
            }
        }
    }
    debug!(updates = updates.len() - start, "interval pass finished");
    Ok(())
}

/// Interval image of every neuron of one layer; `None` for neurons that are
/// not recomputed (inputs and eliminated neurons).
fn layer_images(graph: &NetworkGraph, id: usize) -> Result<Vec<Option<Bound>>> {
    let layer = graph.layer(id)?;
    let kind = layer.layer_type();
    let mut images = Vec::with_capacity(layer.size());
    for neuron in 0..layer.size() {
        if kind == LayerType::Input || layer.neuron_eliminated(neuron) {
            images.push(None);
            continue;
        }
        let image = if kind == LayerType::WeightedSum {
            let bias = layer.bias(neuron);
            let mut sum = Bound::concrete(bias);
            for &source in layer.source_layers().keys() {
                let Some(weights) = layer.weights(source) else {
                    continue;
                };
                let from = graph.layer(source)?;
                for (i, &w) in weights.column(neuron).iter().enumerate() {
                    if w == 0.0 {
                        continue;
                    }
                    let term = scale_interval(w, from.bound(i));
                    sum.lower += term.lower;
                    sum.upper += term.upper;
                }
            }
            sum
        } else {
            let bounds = graph.source_bounds(layer, neuron)?;
            match layer
                .fixed_phase(neuron)
                .and_then(|p| activation::phase_line(kind, p))
            {
                Some(line) => {
                    let (a, b) = (line.at(bounds[0].lower), line.at(bounds[0].upper));
                    Bound {
                        lower: a.min(b),
                        upper: a.max(b),
                    }
                }
                None => {
                    let ops = activation::ops(kind).ok_or(NlrError::UnsupportedActivation {
                        layer_type: kind,
                        operation: "interval propagation",
                    })?;
                    (ops.interval)(&bounds)
                }
            }
        };
        images.push(Some(image));
    }
    Ok(images)
}
