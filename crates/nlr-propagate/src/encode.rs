//! Flattening the network into a [`Query`].
//!
//! Each weighted-sum neuron becomes `Σ w·f − b + aux = −bias` with a fresh
//! auxiliary variable fixed to zero. Each remaining nonlinear neuron
//! becomes one piecewise-linear constraint, or a linear equation when its
//! phase is fixed. Eliminated neurons only keep their fixed bounds.

use crate::layer::{Layer, Phase};
use crate::network::NetworkGraph;
use nlr_core::{
    Equation, LayerType, NeuronIndex, NlrError, PiecewiseLinearConstraint, Query, Result,
    Variable,
};
use tracing::debug;

fn variable_of(graph: &NetworkGraph, index: NeuronIndex) -> Result<Variable> {
    graph
        .layer(index.layer)?
        .neuron_to_variable(index.neuron)
        .ok_or_else(|| NlrError::Topology(format!("neuron {index} is not bound to a variable")))
}

/// Append one equation per non-eliminated weighted-sum neuron.
///
/// Auxiliary variables are allocated past `query.number_of_variables()`.
pub fn encode_affine_layers(graph: &NetworkGraph, query: &mut Query) -> Result<()> {
    let mut count = 0;
    for layer in graph.layers() {
        if layer.layer_type() != LayerType::WeightedSum {
            continue;
        }
        for neuron in 0..layer.size() {
            if layer.neuron_eliminated(neuron) {
                continue;
            }
            let b = variable_of(graph, NeuronIndex::new(layer.id(), neuron))?;
            let mut equation = Equation::new();
            let mut scalar = -layer.bias(neuron);
            for &source in layer.source_layers().keys() {
                let Some(weights) = layer.weights(source) else {
                    continue;
                };
                let from = graph.layer(source)?;
                for (i, &w) in weights.column(neuron).iter().enumerate() {
                    if w == 0.0 {
                        continue;
                    }
                    match from.eliminated_value(i) {
                        Some(value) => scalar -= w * value,
                        None => {
                            equation.add_addend(w, variable_of(graph, NeuronIndex::new(source, i))?)
                        }
                    }
                }
            }
            equation.add_addend(-1.0, b);
            let aux = query.new_variable();
            query.set_lower_bound(aux, 0.0);
            query.set_upper_bound(aux, 0.0);
            equation.add_addend(1.0, aux);
            equation.mark_auxiliary_variable(aux);
            equation.set_scalar(scalar);
            query.add_equation(equation);
            count += 1;
        }
    }
    debug!(equations = count, "encoded affine layers");
    Ok(())
}

/// Flatten the whole network.
///
/// Bound variables get the current neuron bounds (where finite). The
/// variable space covers every bound variable, followed by one auxiliary
/// variable per weighted-sum equation.
pub fn generate_query(graph: &NetworkGraph) -> Result<Query> {
    let mut query = Query::new();
    let num_variables = graph
        .layers()
        .flat_map(|l| l.variables().map(|(_, v)| v + 1))
        .max()
        .unwrap_or(0);
    query.set_number_of_variables(num_variables);

    for layer in graph.layers() {
        for (neuron, variable) in layer.variables() {
            let bound = layer.bound(neuron);
            if bound.lower.is_finite() {
                query.set_lower_bound(variable, bound.lower);
            }
            if bound.upper.is_finite() {
                query.set_upper_bound(variable, bound.upper);
            }
        }
    }

    encode_affine_layers(graph, &mut query)?;

    for layer in graph.layers() {
        if layer.layer_type().is_activation() {
            encode_activation_layer(graph, layer, &mut query)?;
        }
    }
    Ok(query)
}

/// The piecewise-linear constraints `generate_query` emits, ordered by the
/// layer they come from in dependency order. Eliminated and phase-fixed
/// neurons have none.
pub fn constraints_in_topological_order(
    graph: &NetworkGraph,
) -> Result<Vec<PiecewiseLinearConstraint>> {
    let mut constraints = Vec::new();
    for id in graph.topological_order()? {
        let layer = graph.layer(id)?;
        if !layer.layer_type().is_activation() {
            continue;
        }
        let mut scratch = Query::new();
        encode_activation_layer(graph, layer, &mut scratch)?;
        constraints.extend_from_slice(scratch.piecewise_linear_constraints());
    }
    Ok(constraints)
}

fn encode_activation_layer(graph: &NetworkGraph, layer: &Layer, query: &mut Query) -> Result<()> {
    let kind = layer.layer_type();
    for neuron in 0..layer.size() {
        if layer.neuron_eliminated(neuron) {
            continue;
        }
        let f = variable_of(graph, NeuronIndex::new(layer.id(), neuron))?;
        let sources: Vec<Variable> = layer
            .activation_sources(neuron)
            .iter()
            .map(|&s| variable_of(graph, s))
            .collect::<Result<_>>()?;
        let Some(&b) = sources.first() else {
            return Err(NlrError::Topology(format!(
                "{kind} neuron ({}, {neuron}) has no activation source",
                layer.id()
            )));
        };

        if let Some(phase) = layer.fixed_phase(neuron) {
            match (kind, phase) {
                (LayerType::Relu | LayerType::AbsoluteValue, Phase::Active) => {
                    query.add_equation(two_term_equation(b, f, -1.0));
                }
                (LayerType::AbsoluteValue, Phase::Inactive) => {
                    query.add_equation(two_term_equation(b, f, 1.0));
                }
                (LayerType::Relu, Phase::Inactive) => {
                    query.set_lower_bound(f, 0.0);
                    query.set_upper_bound(f, 0.0);
                }
                (LayerType::Sign, phase) => {
                    let value = if phase == Phase::Active { 1.0 } else { -1.0 };
                    query.set_lower_bound(f, value);
                    query.set_upper_bound(f, value);
                }
                _ => {
                    return Err(NlrError::UnsupportedActivation {
                        layer_type: kind,
                        operation: "phase fixing",
                    })
                }
            }
            continue;
        }

        let constraint = match kind {
            LayerType::Relu => PiecewiseLinearConstraint::Relu { b, f },
            LayerType::Sign => PiecewiseLinearConstraint::Sign { b, f },
            LayerType::AbsoluteValue => PiecewiseLinearConstraint::AbsoluteValue { b, f },
            LayerType::Sigmoid => PiecewiseLinearConstraint::Sigmoid { b, f },
            LayerType::Max => PiecewiseLinearConstraint::Max { elements: sources, f },
            LayerType::Input | LayerType::WeightedSum => continue,
        };
        query.add_piecewise_linear_constraint(constraint);
    }
    Ok(())
}

/// `b + coefficient·f = 0`.
pub(crate) fn two_term_equation(b: Variable, f: Variable, coefficient: f64) -> Equation {
    let mut equation = Equation::new();
    equation.add_addend(1.0, b);
    equation.add_addend(coefficient, f);
    equation.set_scalar(0.0);
    equation
}
