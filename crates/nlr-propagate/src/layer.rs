//! Per-layer neuron state.
//!
//! A [`Layer`] owns everything the reasoner knows about one layer of the
//! network: its topology role, weights and bias (weighted-sum layers),
//! activation sources (nonlinear layers), current concrete bounds, symbolic
//! bounds, eliminated neurons and variable bindings.

use crate::symbolic::SymbolicBounds;
use nlr_core::{
    Bound, BoundKind, LayerId, LayerType, NeuronIndex, NlrError, Result, Variable, BOUND_EPSILON,
};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Phase a piecewise-linear neuron has been fixed to.
///
/// A phase-fixed neuron keeps its variable but is encoded as a linear
/// relation instead of a piecewise-linear constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// Pre-activation is non-negative.
    Active,
    /// Pre-activation is non-positive.
    Inactive,
}

#[derive(Debug, Clone)]
pub struct Layer {
    id: LayerId,
    layer_type: LayerType,
    size: usize,
    /// Predecessor layer -> its size.
    source_layers: BTreeMap<LayerId, usize>,
    successor_layers: BTreeSet<LayerId>,
    /// Shape `(size(source), size)`, weighted-sum layers only.
    weights: BTreeMap<LayerId, Array2<f64>>,
    bias: Array1<f64>,
    activation_sources: Vec<Vec<NeuronIndex>>,
    lb: Vec<f64>,
    ub: Vec<f64>,
    symbolic: Option<SymbolicBounds>,
    eliminated: BTreeMap<usize, f64>,
    fixed_phases: BTreeMap<usize, Phase>,
    neuron_to_variable: BTreeMap<usize, Variable>,
    variable_to_neuron: BTreeMap<Variable, usize>,
}

impl Layer {
    pub fn new(id: LayerId, layer_type: LayerType, size: usize) -> Self {
        Self {
            id,
            layer_type,
            size,
            source_layers: BTreeMap::new(),
            successor_layers: BTreeSet::new(),
            weights: BTreeMap::new(),
            bias: Array1::zeros(size),
            activation_sources: vec![Vec::new(); size],
            lb: vec![f64::NEG_INFINITY; size],
            ub: vec![f64::INFINITY; size],
            symbolic: None,
            eliminated: BTreeMap::new(),
            fixed_phases: BTreeMap::new(),
            neuron_to_variable: BTreeMap::new(),
            variable_to_neuron: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> LayerId {
        self.id
    }

    pub fn layer_type(&self) -> LayerType {
        self.layer_type
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn check_neuron(&self, neuron: usize) -> Result<()> {
        if neuron < self.size {
            Ok(())
        } else {
            Err(NlrError::Topology(format!(
                "neuron {} out of range for layer {} of size {}",
                neuron, self.id, self.size
            )))
        }
    }

    // ---------------------------------------------------------------------
    // Topology
    // ---------------------------------------------------------------------

    pub(crate) fn add_source_layer(&mut self, source: LayerId, source_size: usize) {
        self.source_layers.insert(source, source_size);
        if self.layer_type == LayerType::WeightedSum {
            self.weights
                .entry(source)
                .or_insert_with(|| Array2::zeros((source_size, self.size)));
        }
    }

    pub(crate) fn remove_source_layer(&mut self, source: LayerId) {
        self.source_layers.remove(&source);
        self.weights.remove(&source);
    }

    pub fn source_layers(&self) -> &BTreeMap<LayerId, usize> {
        &self.source_layers
    }

    pub fn successor_layers(&self) -> &BTreeSet<LayerId> {
        &self.successor_layers
    }

    pub(crate) fn add_successor_layer(&mut self, successor: LayerId) {
        self.successor_layers.insert(successor);
    }

    pub(crate) fn remove_successor_layer(&mut self, successor: LayerId) {
        self.successor_layers.remove(&successor);
    }

    pub(crate) fn clear_successor_layers(&mut self) {
        self.successor_layers.clear();
    }

    pub(crate) fn set_weight(
        &mut self,
        source: LayerId,
        source_neuron: usize,
        neuron: usize,
        weight: f64,
    ) -> Result<()> {
        self.check_neuron(neuron)?;
        let matrix = self.weights.get_mut(&source).ok_or_else(|| {
            NlrError::Topology(format!(
                "layer {} does not depend on layer {}",
                self.id, source
            ))
        })?;
        if source_neuron >= matrix.nrows() {
            return Err(NlrError::Topology(format!(
                "neuron {} out of range for layer {} of size {}",
                source_neuron,
                source,
                matrix.nrows()
            )));
        }
        matrix[[source_neuron, neuron]] = weight;
        Ok(())
    }

    pub fn weight(&self, source: LayerId, source_neuron: usize, neuron: usize) -> f64 {
        self.weights
            .get(&source)
            .and_then(|m| m.get([source_neuron, neuron]).copied())
            .unwrap_or(0.0)
    }

    /// Weight matrix from `source`, shape `(size(source), size)`.
    pub fn weights(&self, source: LayerId) -> Option<&Array2<f64>> {
        self.weights.get(&source)
    }

    pub(crate) fn set_weight_matrix(&mut self, source: LayerId, matrix: Array2<f64>) {
        debug_assert_eq!(matrix.ncols(), self.size);
        self.source_layers.insert(source, matrix.nrows());
        self.weights.insert(source, matrix);
    }

    pub(crate) fn set_bias(&mut self, neuron: usize, bias: f64) -> Result<()> {
        self.check_neuron(neuron)?;
        self.bias[neuron] = bias;
        Ok(())
    }

    pub(crate) fn bias(&self, neuron: usize) -> f64 {
        self.bias[neuron]
    }

    pub fn biases(&self) -> &Array1<f64> {
        &self.bias
    }

    pub(crate) fn set_biases(&mut self, bias: Array1<f64>) {
        debug_assert_eq!(bias.len(), self.size);
        self.bias = bias;
    }

    pub(crate) fn add_activation_source(&mut self, source: NeuronIndex, neuron: usize) -> Result<()> {
        self.check_neuron(neuron)?;
        let sources = &mut self.activation_sources[neuron];
        if self.layer_type.is_single_source() && !sources.is_empty() && !sources.contains(&source)
        {
            return Err(NlrError::Topology(format!(
                "{} neuron ({}, {}) already has an activation source",
                self.layer_type, self.id, neuron
            )));
        }
        if !sources.contains(&source) {
            sources.push(source);
        }
        Ok(())
    }

    pub(crate) fn activation_sources(&self, neuron: usize) -> &[NeuronIndex] {
        &self.activation_sources[neuron]
    }

    /// Rewrite every layer id this layer refers to.
    pub(crate) fn relabel(&mut self, relabel: impl Fn(LayerId) -> LayerId) {
        self.id = relabel(self.id);
        self.source_layers = self
            .source_layers
            .iter()
            .map(|(&l, &s)| (relabel(l), s))
            .collect();
        self.successor_layers = self.successor_layers.iter().map(|&l| relabel(l)).collect();
        self.weights = std::mem::take(&mut self.weights)
            .into_iter()
            .map(|(l, m)| (relabel(l), m))
            .collect();
        for sources in &mut self.activation_sources {
            for source in sources.iter_mut() {
                source.layer = relabel(source.layer);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Bounds
    // ---------------------------------------------------------------------

    // Unchecked accessors index directly; outside the crate use
    // `NetworkGraph::bound`, which reports an out-of-range neuron.

    pub(crate) fn lb(&self, neuron: usize) -> f64 {
        self.lb[neuron]
    }

    pub(crate) fn ub(&self, neuron: usize) -> f64 {
        self.ub[neuron]
    }

    pub(crate) fn bound(&self, neuron: usize) -> Bound {
        Bound {
            lower: self.lb[neuron],
            upper: self.ub[neuron],
        }
    }

    /// Overwrite both bounds of a neuron, rejecting `lower > upper`.
    ///
    /// Eliminated neurons keep their fixed value.
    pub fn set_bounds(&mut self, neuron: usize, lower: f64, upper: f64) -> Result<()> {
        self.check_neuron(neuron)?;
        if self.eliminated.contains_key(&neuron) {
            return Ok(());
        }
        if lower > upper + BOUND_EPSILON {
            return Err(NlrError::BoundInconsistency {
                neuron: NeuronIndex::new(self.id, neuron),
                lower,
                upper,
            });
        }
        self.lb[neuron] = lower.min(upper);
        self.ub[neuron] = upper;
        Ok(())
    }

    /// Tighten one side of a neuron's interval.
    ///
    /// Returns the previous value if `value` improves the bound by more than
    /// [`BOUND_EPSILON`], `None` otherwise. A value crossing the opposite
    /// bound is an inconsistency and leaves the layer untouched.
    pub fn tighten(&mut self, neuron: usize, kind: BoundKind, value: f64) -> Result<Option<f64>> {
        self.check_neuron(neuron)?;
        if value.is_nan() || self.eliminated.contains_key(&neuron) {
            return Ok(None);
        }
        let (lb, ub) = (self.lb[neuron], self.ub[neuron]);
        match kind {
            BoundKind::Lower => {
                if value <= lb + BOUND_EPSILON {
                    return Ok(None);
                }
                if value > ub + BOUND_EPSILON {
                    return Err(NlrError::BoundInconsistency {
                        neuron: NeuronIndex::new(self.id, neuron),
                        lower: value,
                        upper: ub,
                    });
                }
                self.lb[neuron] = value.min(ub);
                Ok(Some(lb))
            }
            BoundKind::Upper => {
                if value >= ub - BOUND_EPSILON {
                    return Ok(None);
                }
                if value < lb - BOUND_EPSILON {
                    return Err(NlrError::BoundInconsistency {
                        neuron: NeuronIndex::new(self.id, neuron),
                        lower: lb,
                        upper: value,
                    });
                }
                self.ub[neuron] = value.max(lb);
                Ok(Some(ub))
            }
        }
    }

    pub fn symbolic_bounds(&self) -> Option<&SymbolicBounds> {
        self.symbolic.as_ref()
    }

    pub(crate) fn set_symbolic_bounds(&mut self, symbolic: SymbolicBounds) {
        self.symbolic = Some(symbolic);
    }

    pub(crate) fn clear_symbolic_bounds(&mut self) {
        self.symbolic = None;
    }

    // ---------------------------------------------------------------------
    // Elimination and phases
    // ---------------------------------------------------------------------

    /// Fix a neuron to `value`. It no longer takes part in propagation or
    /// query generation, but keeps its variable binding.
    ///
    /// `value` must lie within the current bounds; re-eliminating to the
    /// same value is a no-op.
    pub(crate) fn eliminate_neuron(&mut self, neuron: usize, value: f64) -> Result<()> {
        self.check_neuron(neuron)?;
        let (lb, ub) = (self.lb[neuron], self.ub[neuron]);
        if value.is_nan() || value < lb - BOUND_EPSILON || value > ub + BOUND_EPSILON {
            return Err(NlrError::BoundInconsistency {
                neuron: NeuronIndex::new(self.id, neuron),
                lower: lb.max(value),
                upper: ub.min(value),
            });
        }
        self.eliminated.insert(neuron, value);
        self.lb[neuron] = value;
        self.ub[neuron] = value;
        self.fixed_phases.remove(&neuron);
        Ok(())
    }

    pub fn neuron_eliminated(&self, neuron: usize) -> bool {
        self.eliminated.contains_key(&neuron)
    }

    pub fn eliminated_value(&self, neuron: usize) -> Option<f64> {
        self.eliminated.get(&neuron).copied()
    }

    pub fn eliminated_neurons(&self) -> &BTreeMap<usize, f64> {
        &self.eliminated
    }

    pub(crate) fn fix_phase(&mut self, neuron: usize, phase: Phase) {
        self.fixed_phases.insert(neuron, phase);
    }

    pub fn fixed_phase(&self, neuron: usize) -> Option<Phase> {
        self.fixed_phases.get(&neuron).copied()
    }

    // ---------------------------------------------------------------------
    // Variables
    // ---------------------------------------------------------------------

    pub(crate) fn set_neuron_variable(&mut self, neuron: usize, variable: Variable) -> Result<()> {
        self.check_neuron(neuron)?;
        if let Some(old) = self.neuron_to_variable.insert(neuron, variable) {
            self.variable_to_neuron.remove(&old);
        }
        self.variable_to_neuron.insert(variable, neuron);
        Ok(())
    }

    pub fn neuron_to_variable(&self, neuron: usize) -> Option<Variable> {
        self.neuron_to_variable.get(&neuron).copied()
    }

    pub fn variable_to_neuron(&self, variable: Variable) -> Option<usize> {
        self.variable_to_neuron.get(&variable).copied()
    }

    pub fn variables(&self) -> impl Iterator<Item = (usize, Variable)> + '_ {
        self.neuron_to_variable.iter().map(|(&n, &v)| (n, v))
    }

    /// Follow `merged` chains, then rename through `old_to_new`.
    ///
    /// An eliminated neuron whose variable vanished keeps its old binding.
    pub(crate) fn update_variable_indices(
        &mut self,
        old_to_new: &BTreeMap<Variable, Variable>,
        merged: &BTreeMap<Variable, Variable>,
    ) -> Result<()> {
        let mut renamed = BTreeMap::new();
        for (&neuron, &variable) in &self.neuron_to_variable {
            let mut current = variable;
            let mut hops = 0;
            while let Some(&next) = merged.get(&current) {
                current = next;
                hops += 1;
                if hops > merged.len() {
                    return Err(NlrError::InvalidConfig(format!(
                        "cyclic variable merge involving x{variable}"
                    )));
                }
            }
            let new = match old_to_new.get(&current) {
                Some(&new) => new,
                None if self.eliminated.contains_key(&neuron) => current,
                None => return Err(NlrError::UnknownVariable(current)),
            };
            renamed.insert(neuron, new);
        }
        self.variable_to_neuron = renamed.iter().map(|(&n, &v)| (v, n)).collect();
        self.neuron_to_variable = renamed;
        Ok(())
    }
}
