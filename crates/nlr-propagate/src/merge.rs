//! Merging consecutive weighted-sum layers.
//!
//! Two weighted-sum layers `first -> second` with nothing in between
//! compose into one: `W_s' = W1_s · W2` for every source `s` of `first`
//! and `b' = b1 · W2 + b2`. The neurons of `first` disappear; each one is
//! reported as an affine expression over the variables of its sources.

use crate::network::NetworkGraph;
use ndarray::Array2;
use nlr_core::{LayerId, LayerType, LinearExpression, NlrError, Result, Variable};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Variables that must survive merging.
pub struct MergeGuards<'a> {
    pub lower_bounds: &'a BTreeMap<Variable, f64>,
    pub upper_bounds: &'a BTreeMap<Variable, f64>,
    pub vars_in_unhandled: &'a BTreeSet<Variable>,
}

impl MergeGuards<'_> {
    fn protects(&self, variable: Variable) -> bool {
        self.vars_in_unhandled.contains(&variable)
            || self.lower_bounds.get(&variable).is_some_and(|b| b.is_finite())
            || self.upper_bounds.get(&variable).is_some_and(|b| b.is_finite())
    }
}

/// Merge every mergeable pair until none is left. Returns the number of
/// merges; merged-away neurons are added to `eliminated`.
pub fn merge_consecutive_ws_layers(
    graph: &mut NetworkGraph,
    guards: &MergeGuards<'_>,
    eliminated: &mut BTreeMap<Variable, LinearExpression>,
) -> Result<usize> {
    let mut merges = 0;
    while let Some((first, second)) = find_mergeable(graph, guards)? {
        merge_pair(graph, first, second, eliminated)?;
        merges += 1;
    }
    if merges > 0 {
        for layer in graph.layers_mut() {
            layer.clear_symbolic_bounds();
        }
        info!(merges, layers = graph.number_of_layers(), "merged weighted-sum layers");
    }
    Ok(merges)
}

fn find_mergeable(
    graph: &NetworkGraph,
    guards: &MergeGuards<'_>,
) -> Result<Option<(LayerId, LayerId)>> {
    for second in graph.layers() {
        if second.layer_type() != LayerType::WeightedSum || second.source_layers().len() != 1 {
            continue;
        }
        let Some(&first_id) = second.source_layers().keys().next() else {
            continue;
        };
        let first = graph.layer(first_id)?;
        let suitable = first.layer_type() == LayerType::WeightedSum
            && first.successor_layers().len() == 1
            && first.successor_layers().contains(&second.id())
            && first.eliminated_neurons().is_empty()
            && first.variables().all(|(_, v)| !guards.protects(v));
        if suitable {
            return Ok(Some((first_id, second.id())));
        }
    }
    Ok(None)
}

fn merge_pair(
    graph: &mut NetworkGraph,
    first_id: LayerId,
    second_id: LayerId,
    eliminated: &mut BTreeMap<Variable, LinearExpression>,
) -> Result<()> {
    let first = graph.layer(first_id)?.clone();
    let second = graph.layer(second_id)?;
    let w2 = second
        .weights(first_id)
        .ok_or_else(|| {
            NlrError::Topology(format!(
                "layer {second_id} has no weights from layer {first_id}"
            ))
        })?
        .clone();

    // Record the merged-away neurons before touching the graph.
    let mut expressions = Vec::new();
    for (neuron, variable) in first.variables() {
        let mut expression = LinearExpression::constant(first.bias(neuron));
        for &source in first.source_layers().keys() {
            let Some(w1) = first.weights(source) else {
                continue;
            };
            let from = graph.layer(source)?;
            for (i, &w) in w1.column(neuron).iter().enumerate() {
                if w == 0.0 {
                    continue;
                }
                match (from.eliminated_value(i), from.neuron_to_variable(i)) {
                    (Some(value), _) => expression.constant += w * value,
                    (None, Some(v)) => expression.add_term(v, w),
                    (None, None) => {
                        return Err(NlrError::Topology(format!(
                            "cannot express merged neuron ({first_id}, {neuron}): \
                             source ({source}, {i}) has no variable"
                        )))
                    }
                }
            }
        }
        expressions.push((variable, expression));
    }

    let bias = first.biases().dot(&w2) + second.biases();
    let composed: Vec<(LayerId, Array2<f64>)> = first
        .source_layers()
        .keys()
        .filter_map(|&s| first.weights(s).map(|w1| (s, w1.dot(&w2))))
        .collect();

    {
        let second = graph.layer_mut(second_id)?;
        second.remove_source_layer(first_id);
        second.set_biases(bias);
        for (source, matrix) in &composed {
            second.set_weight_matrix(*source, matrix.clone());
        }
    }
    for (source, _) in &composed {
        let layer = graph.layer_mut(*source)?;
        layer.remove_successor_layer(first_id);
        layer.add_successor_layer(second_id);
    }
    graph.remove_layer_and_compact(first_id);
    debug!(first = first_id, second = second_id, "merged layer pair");

    eliminated.extend(expressions);
    Ok(())
}
