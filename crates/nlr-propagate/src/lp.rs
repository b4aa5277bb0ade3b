//! LP/MILP relaxation tightening.
//!
//! [`build_model`] encodes a target layer and all of its ancestors as a
//! linear program over one column per neuron, boxed by the current
//! concrete bounds. Weighted-sum neurons contribute exact equations.
//! Activations contribute either their linear relaxation or, for
//! [`Encoding::Exact`], a big-M encoding with binary indicators. The
//! solver itself sits behind [`LpOracle`].

use crate::activation::{self, Line, Relaxation};
use crate::layer::Layer;
use crate::network::NetworkGraph;
use crate::types::{BoundUpdate, PropagationConfig};
use nlr_core::{Bound, BoundKind, LayerId, LayerType, NeuronIndex, NlrError, Result};
use std::collections::BTreeMap;
use tracing::{debug, instrument, trace, warn};

/// One column of an [`LpModel`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LpVariable {
    pub lower: f64,
    pub upper: f64,
    /// Binary indicators are integer columns boxed to `[0, 1]`.
    pub integer: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintSense {
    LessEq,
    GreaterEq,
    Equal,
}

/// `Σ coefficient · column (sense) rhs`.
#[derive(Debug, Clone, PartialEq)]
pub struct LpConstraint {
    pub terms: Vec<(usize, f64)>,
    pub sense: ConstraintSense,
    pub rhs: f64,
}

impl LpConstraint {
    pub fn holds(&self, assignment: &[f64], tolerance: f64) -> bool {
        let lhs: f64 = self
            .terms
            .iter()
            .map(|&(column, coefficient)| coefficient * assignment[column])
            .sum();
        match self.sense {
            ConstraintSense::LessEq => lhs <= self.rhs + tolerance,
            ConstraintSense::GreaterEq => lhs >= self.rhs - tolerance,
            ConstraintSense::Equal => (lhs - self.rhs).abs() <= tolerance,
        }
    }
}

/// Objective of one oracle call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Objective {
    Minimize(usize),
    Maximize(usize),
}

/// What the oracle reports for one objective.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OracleOutcome {
    Optimal(f64),
    /// The model has no solution; the current bound box is infeasible.
    Infeasible,
    /// Timeout or any other inconclusive result.
    Unknown,
}

/// External LP/MILP solver.
///
/// An `Err` is recovered locally: the pass logs it and stops querying the
/// current layer, keeping the tightenings it already has.
pub trait LpOracle {
    fn solve(&mut self, model: &LpModel, objective: Objective) -> Result<OracleOutcome>;
}

/// How activations are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Linear relaxation only.
    Relaxation,
    /// Big-M encoding with a binary indicator for every unstable neuron.
    Exact,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LpModel {
    variables: Vec<LpVariable>,
    constraints: Vec<LpConstraint>,
    neuron_columns: BTreeMap<NeuronIndex, usize>,
}

impl LpModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_variable(&mut self, lower: f64, upper: f64, integer: bool) -> usize {
        self.variables.push(LpVariable {
            lower,
            upper,
            integer,
        });
        self.variables.len() - 1
    }

    pub fn add_constraint(&mut self, terms: Vec<(usize, f64)>, sense: ConstraintSense, rhs: f64) {
        let terms = terms.into_iter().filter(|&(_, c)| c != 0.0).collect();
        self.constraints.push(LpConstraint { terms, sense, rhs });
    }

    pub fn variables(&self) -> &[LpVariable] {
        &self.variables
    }

    pub fn constraints(&self) -> &[LpConstraint] {
        &self.constraints
    }

    /// Column of a neuron, if the neuron is part of the model.
    pub fn column(&self, neuron: NeuronIndex) -> Option<usize> {
        self.neuron_columns.get(&neuron).copied()
    }

    pub fn neuron_columns(&self) -> &BTreeMap<NeuronIndex, usize> {
        &self.neuron_columns
    }

    pub fn num_integer_variables(&self) -> usize {
        self.variables.iter().filter(|v| v.integer).count()
    }

    fn tighten_column(&mut self, column: usize, kind: BoundKind, value: f64) {
        let var = &mut self.variables[column];
        match kind {
            BoundKind::Lower => var.lower = var.lower.max(value),
            BoundKind::Upper => var.upper = var.upper.min(value),
        }
    }

    /// Whether `assignment` respects every box, integrality and constraint.
    pub fn is_satisfied(&self, assignment: &[f64], tolerance: f64) -> bool {
        assignment.len() == self.variables.len()
            && self.variables.iter().zip(assignment).all(|(v, &x)| {
                x >= v.lower - tolerance
                    && x <= v.upper + tolerance
                    && (!v.integer || (x - x.round()).abs() <= tolerance)
            })
            && self.constraints.iter().all(|c| c.holds(assignment, tolerance))
    }
}

/// Encode `target` and every layer it depends on.
pub fn build_model(graph: &NetworkGraph, target: LayerId, encoding: Encoding) -> Result<LpModel> {
    let members = graph.ancestors_and_self(target)?;
    let order: Vec<LayerId> = graph
        .topological_order()?
        .into_iter()
        .filter(|id| members.contains(id))
        .collect();

    let mut model = LpModel::new();
    for &id in &order {
        let layer = graph.layer(id)?;
        for neuron in 0..layer.size() {
            let b = layer.bound(neuron);
            let column = model.add_variable(b.lower, b.upper, false);
            model
                .neuron_columns
                .insert(NeuronIndex::new(id, neuron), column);
        }
    }

    for &id in &order {
        let layer = graph.layer(id)?;
        match layer.layer_type() {
            LayerType::Input => {}
            LayerType::WeightedSum => encode_weighted_sum(&mut model, layer, id),
            kind => {
                for neuron in 0..layer.size() {
                    if !layer.neuron_eliminated(neuron) {
                        encode_activation(&mut model, graph, layer, kind, neuron, encoding)?;
                    }
                }
            }
        }
    }
    Ok(model)
}

fn column(model: &LpModel, neuron: NeuronIndex) -> Result<usize> {
    model
        .column(neuron)
        .ok_or_else(|| NlrError::Topology(format!("neuron {neuron} is not in the model")))
}

/// `y - Σ w·x = bias` for every non-eliminated neuron.
fn encode_weighted_sum(model: &mut LpModel, layer: &Layer, id: LayerId) {
    for neuron in 0..layer.size() {
        if layer.neuron_eliminated(neuron) {
            continue;
        }
        let Some(y) = model.column(NeuronIndex::new(id, neuron)) else {
            continue;
        };
        let mut terms = vec![(y, 1.0)];
        for &source in layer.source_layers().keys() {
            let Some(weights) = layer.weights(source) else {
                continue;
            };
            for (i, &w) in weights.column(neuron).iter().enumerate() {
                if let Some(x) = model.column(NeuronIndex::new(source, i)) {
                    terms.push((x, -w));
                }
            }
        }
        model.add_constraint(terms, ConstraintSense::Equal, layer.bias(neuron));
    }
}

/// `y (sense) line(x)`, skipped when the line has an infinite intercept.
fn add_line(model: &mut LpModel, y: usize, x: usize, line: Line, sense: ConstraintSense) {
    if !line.intercept.is_finite() || !line.slope.is_finite() {
        return;
    }
    model.add_constraint(vec![(y, 1.0), (x, -line.slope)], sense, line.intercept);
}

fn encode_activation(
    model: &mut LpModel,
    graph: &NetworkGraph,
    layer: &Layer,
    kind: LayerType,
    neuron: usize,
    encoding: Encoding,
) -> Result<()> {
    let y = column(model, NeuronIndex::new(layer.id(), neuron))?;
    let sources = layer.activation_sources(neuron);
    let xs: Vec<usize> = sources
        .iter()
        .map(|&s| column(model, s))
        .collect::<Result<_>>()?;
    let Some(&x) = xs.first() else {
        return Ok(());
    };

    if let Some(line) = layer
        .fixed_phase(neuron)
        .and_then(|p| activation::phase_line(kind, p))
    {
        add_line(model, y, x, line, ConstraintSense::Equal);
        return Ok(());
    }

    let ops = activation::ops(kind).ok_or(NlrError::UnsupportedActivation {
        layer_type: kind,
        operation: "LP encoding",
    })?;
    let bounds = graph.source_bounds(layer, neuron)?;
    let relaxation = (ops.relaxation)(&bounds, Default::default());

    if encoding == Encoding::Exact && !relaxation.is_exact() {
        if kind == LayerType::Sigmoid {
            return Err(NlrError::UnsupportedActivation {
                layer_type: kind,
                operation: "MILP encoding",
            });
        }
        if encode_exact(model, kind, y, &xs, &bounds) {
            return Ok(());
        }
        trace!(neuron, %kind, "infinite big-M, using relaxation");
    }

    match relaxation {
        Relaxation::Affine { lower, upper } => {
            add_line(model, y, x, lower, ConstraintSense::GreaterEq);
            add_line(model, y, x, upper, ConstraintSense::LessEq);
            // Cuts valid on the whole line, tighter than `y >= 0` on one side.
            match kind {
                LayerType::Relu => add_line(model, y, x, Line::IDENTITY, ConstraintSense::GreaterEq),
                LayerType::AbsoluteValue => {
                    add_line(model, y, x, Line::IDENTITY, ConstraintSense::GreaterEq);
                    add_line(
                        model,
                        y,
                        x,
                        Line {
                            slope: -1.0,
                            intercept: 0.0,
                        },
                        ConstraintSense::GreaterEq,
                    );
                }
                _ => {}
            }
        }
        Relaxation::Select(k) => {
            add_line(model, y, xs[k], Line::IDENTITY, ConstraintSense::Equal);
        }
        Relaxation::Dominated { .. } => {
            for &xi in &xs {
                add_line(model, y, xi, Line::IDENTITY, ConstraintSense::GreaterEq);
            }
        }
    }
    Ok(())
}

/// Big-M encoding of one unstable neuron. Returns `false` (adding nothing)
/// when a needed bound is infinite.
fn encode_exact(
    model: &mut LpModel,
    kind: LayerType,
    y: usize,
    xs: &[usize],
    bounds: &[Bound],
) -> bool {
    use ConstraintSense::{Equal, GreaterEq, LessEq};

    if bounds.iter().any(|b| b.is_unbounded()) {
        return false;
    }
    let x = xs[0];
    let Bound { lower: l, upper: u } = bounds[0];
    match kind {
        LayerType::Relu => {
            // d = 1 iff active.
            let d = model.add_variable(0.0, 1.0, true);
            model.add_constraint(vec![(y, 1.0)], GreaterEq, 0.0);
            model.add_constraint(vec![(y, 1.0), (x, -1.0)], GreaterEq, 0.0);
            model.add_constraint(vec![(y, 1.0), (x, -1.0), (d, -l)], LessEq, -l);
            model.add_constraint(vec![(y, 1.0), (d, -u)], LessEq, 0.0);
        }
        LayerType::AbsoluteValue => {
            let d = model.add_variable(0.0, 1.0, true);
            model.add_constraint(vec![(y, 1.0), (x, -1.0)], GreaterEq, 0.0);
            model.add_constraint(vec![(y, 1.0), (x, 1.0)], GreaterEq, 0.0);
            model.add_constraint(vec![(y, 1.0), (x, -1.0), (d, -2.0 * l)], LessEq, -2.0 * l);
            model.add_constraint(vec![(y, 1.0), (x, 1.0), (d, -2.0 * u)], LessEq, 0.0);
            model.add_constraint(vec![(x, 1.0), (d, l)], GreaterEq, l);
            model.add_constraint(vec![(x, 1.0), (d, -u)], LessEq, 0.0);
        }
        LayerType::Sign => {
            // y = 2d - 1.
            let d = model.add_variable(0.0, 1.0, true);
            model.add_constraint(vec![(y, 1.0), (d, -2.0)], Equal, -1.0);
            model.add_constraint(vec![(x, 1.0), (d, l)], GreaterEq, l);
            model.add_constraint(vec![(x, 1.0), (d, -u)], LessEq, 0.0);
        }
        LayerType::Max => {
            let top = bounds
                .iter()
                .map(|b| b.upper)
                .fold(f64::NEG_INFINITY, f64::max);
            let mut selectors = Vec::with_capacity(xs.len());
            for (&xi, b) in xs.iter().zip(bounds) {
                let d = model.add_variable(0.0, 1.0, true);
                selectors.push((d, 1.0));
                let m = top - b.lower;
                model.add_constraint(vec![(y, 1.0), (xi, -1.0)], GreaterEq, 0.0);
                model.add_constraint(vec![(y, 1.0), (xi, -1.0), (d, m)], LessEq, m);
            }
            model.add_constraint(selectors, Equal, 1.0);
        }
        _ => return false,
    }
    true
}

/// Minimize and maximize every neuron of `target` and tighten its bounds.
///
/// `budget` counts down oracle calls across layers; `None` is unlimited.
/// Improvements are appended to `updates` as they are found.
pub fn tighten_layer(
    graph: &mut NetworkGraph,
    target: LayerId,
    oracle: &mut dyn LpOracle,
    encoding: Encoding,
    budget: &mut Option<usize>,
    updates: &mut Vec<BoundUpdate>,
) -> Result<()> {
    let mut model = build_model(graph, target, encoding)?;
    let size = graph.layer(target)?.size();

    for neuron in 0..size {
        if graph.layer(target)?.neuron_eliminated(neuron) {
            continue;
        }
        let index = NeuronIndex::new(target, neuron);
        let col = column(&model, index)?;
        for (objective, kind) in [
            (Objective::Minimize(col), BoundKind::Lower),
            (Objective::Maximize(col), BoundKind::Upper),
        ] {
            if let Some(remaining) = budget {
                if *remaining == 0 {
                    debug!(layer = target, "oracle call budget exhausted");
                    return Ok(());
                }
                *remaining -= 1;
            }
            match oracle.solve(&model, objective) {
                Ok(OracleOutcome::Optimal(value)) => {
                    if let Some(update) = graph.tighten(index, kind, value)? {
                        trace!(neuron = %index, ?kind, value, "LP tightening");
                        model.tighten_column(col, kind, value);
                        updates.push(update);
                    }
                }
                Ok(OracleOutcome::Infeasible) => {
                    return Err(NlrError::InfeasibleRelaxation { layer: target });
                }
                Ok(OracleOutcome::Unknown) => {
                    warn!(neuron = %index, ?objective, "oracle returned no result");
                }
                Err(e) => {
                    warn!(layer = target, error = %e, "oracle failed, skipping layer");
                    return Ok(());
                }
            }
        }
    }
    Ok(())
}

/// Tighten every non-input layer in topological order.
#[instrument(skip_all, fields(encoding = ?encoding))]
pub fn lp_pass(
    graph: &mut NetworkGraph,
    oracle: &mut dyn LpOracle,
    encoding: Encoding,
    config: &PropagationConfig,
    updates: &mut Vec<BoundUpdate>,
) -> Result<()> {
    let mut budget = config.oracle_call_budget;
    let start = updates.len();
    for id in graph.topological_order()? {
        if graph.layer(id)?.layer_type() == LayerType::Input {
            continue;
        }
        tighten_layer(graph, id, oracle, encoding, &mut budget, updates)?;
        if budget == Some(0) {
            break;
        }
    }
    debug!(updates = updates.len() - start, "LP pass finished");
    Ok(())
}
