//! Layered network topology.
//!
//! [`NetworkGraph`] is an arena of [`Layer`]s keyed by id. All cross
//! references (predecessors, successors, activation sources) are ids or
//! [`NeuronIndex`]es resolved through the arena, so a clone is a fully
//! independent copy.

use crate::activation;
use crate::layer::Layer;
use crate::types::BoundUpdate;
use nlr_core::{Bound, BoundKind, LayerId, LayerType, NeuronIndex, NlrError, Result, Variable};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

#[derive(Debug, Clone, Default)]
pub struct NetworkGraph {
    layers: BTreeMap<LayerId, Layer>,
}

impl NetworkGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_layer(&mut self, id: LayerId, layer_type: LayerType, size: usize) -> Result<()> {
        if self.layers.contains_key(&id) {
            return Err(NlrError::Topology(format!("layer {id} already exists")));
        }
        self.layers.insert(id, Layer::new(id, layer_type, size));
        Ok(())
    }

    /// Add the edge `source -> target`, keeping successor sets in sync.
    pub fn add_layer_dependency(&mut self, source: LayerId, target: LayerId) -> Result<()> {
        let source_size = self.layer(source)?.size();
        let target_type = self.layer(target)?.layer_type();
        if target_type == LayerType::Input {
            return Err(NlrError::Topology(format!(
                "input layer {target} cannot depend on layer {source}"
            )));
        }
        if source == target || self.reaches(target, source) {
            return Err(NlrError::Topology(format!(
                "dependency {source} -> {target} would create a cycle"
            )));
        }
        self.layer_mut(target)?.add_source_layer(source, source_size);
        self.layer_mut(source)?.add_successor_layer(target);
        Ok(())
    }

    /// True if `to` is reachable from `from` along dependency edges.
    fn reaches(&self, from: LayerId, to: LayerId) -> bool {
        let mut stack = vec![from];
        let mut seen = BTreeSet::new();
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            for layer in self.layers.values() {
                if layer.source_layers().contains_key(&id) {
                    stack.push(layer.id());
                }
            }
        }
        false
    }

    /// Rebuild every successor set from the predecessor links.
    pub fn compute_successor_layers(&mut self) {
        let edges: Vec<(LayerId, LayerId)> = self
            .layers
            .values()
            .flat_map(|l| l.source_layers().keys().map(move |&s| (s, l.id())))
            .collect();
        for layer in self.layers.values_mut() {
            layer.clear_successor_layers();
        }
        for (source, target) in edges {
            if let Some(layer) = self.layers.get_mut(&source) {
                layer.add_successor_layer(target);
            }
        }
    }

    pub fn set_weight(
        &mut self,
        source_layer: LayerId,
        source_neuron: usize,
        target_layer: LayerId,
        target_neuron: usize,
        weight: f64,
    ) -> Result<()> {
        self.layer(source_layer)?.check_neuron(source_neuron)?;
        let target = self.layer_mut(target_layer)?;
        if target.layer_type() != LayerType::WeightedSum {
            return Err(NlrError::Topology(format!(
                "setWeight on {} layer {}",
                target.layer_type(),
                target_layer
            )));
        }
        target.set_weight(source_layer, source_neuron, target_neuron, weight)
    }

    pub fn set_bias(&mut self, layer: LayerId, neuron: usize, bias: f64) -> Result<()> {
        let target = self.layer_mut(layer)?;
        if target.layer_type() != LayerType::WeightedSum {
            return Err(NlrError::Topology(format!(
                "setBias on {} layer {}",
                target.layer_type(),
                layer
            )));
        }
        target.set_bias(neuron, bias)
    }

    /// Record that `(target_layer, target_neuron)` reads `(source_layer, source_neuron)`.
    ///
    /// Adds the layer dependency if it is not there yet.
    pub fn add_activation_source(
        &mut self,
        source_layer: LayerId,
        source_neuron: usize,
        target_layer: LayerId,
        target_neuron: usize,
    ) -> Result<()> {
        self.layer(source_layer)?.check_neuron(source_neuron)?;
        let target = self.layer(target_layer)?;
        if !target.layer_type().is_activation() {
            return Err(NlrError::Topology(format!(
                "addActivationSource on {} layer {}",
                target.layer_type(),
                target_layer
            )));
        }
        if !target.source_layers().contains_key(&source_layer) {
            self.add_layer_dependency(source_layer, target_layer)?;
        }
        self.layer_mut(target_layer)?
            .add_activation_source(NeuronIndex::new(source_layer, source_neuron), target_neuron)
    }

    pub fn set_neuron_variable(&mut self, index: NeuronIndex, variable: Variable) -> Result<()> {
        self.layer_mut(index.layer)?
            .set_neuron_variable(index.neuron, variable)
    }

    pub fn layer(&self, id: LayerId) -> Result<&Layer> {
        self.layers
            .get(&id)
            .ok_or_else(|| NlrError::Topology(format!("unknown layer {id}")))
    }

    pub fn layer_mut(&mut self, id: LayerId) -> Result<&mut Layer> {
        self.layers
            .get_mut(&id)
            .ok_or_else(|| NlrError::Topology(format!("unknown layer {id}")))
    }

    pub fn layers(&self) -> impl Iterator<Item = &Layer> {
        self.layers.values()
    }

    pub(crate) fn layers_mut(&mut self) -> impl Iterator<Item = &mut Layer> {
        self.layers.values_mut()
    }

    pub fn number_of_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn max_layer_size(&self) -> usize {
        self.layers.values().map(Layer::size).max().unwrap_or(0)
    }

    pub fn bound(&self, index: NeuronIndex) -> Result<Bound> {
        let layer = self.layer(index.layer)?;
        layer.check_neuron(index.neuron)?;
        Ok(layer.bound(index.neuron))
    }

    pub fn neuron_for_variable(&self, variable: Variable) -> Option<NeuronIndex> {
        self.layers.values().find_map(|layer| {
            layer
                .variable_to_neuron(variable)
                .map(|neuron| NeuronIndex::new(layer.id(), neuron))
        })
    }

    /// Input neurons in `(layer, neuron)` order; the coordinate space of
    /// symbolic bounds.
    pub fn input_neurons(&self) -> Vec<NeuronIndex> {
        self.layers
            .values()
            .filter(|l| l.layer_type() == LayerType::Input)
            .flat_map(|l| (0..l.size()).map(move |n| NeuronIndex::new(l.id(), n)))
            .collect()
    }

    /// Tighten one side of a neuron's interval.
    ///
    /// This is the only place propagation writes bounds; an inversion is
    /// reported as `BoundInconsistency` and nothing is stored.
    pub fn tighten(
        &mut self,
        neuron: NeuronIndex,
        kind: BoundKind,
        value: f64,
    ) -> Result<Option<BoundUpdate>> {
        let layer = self.layer_mut(neuron.layer)?;
        layer.check_neuron(neuron.neuron)?;
        Ok(layer
            .tighten(neuron.neuron, kind, value)?
            .map(|previous| BoundUpdate {
                neuron,
                kind,
                value,
                previous,
            }))
    }

    /// Check the topology invariants and return the layers in dependency
    /// order (ties broken by id).
    pub fn topological_order(&self) -> Result<Vec<LayerId>> {
        self.validate()?;
        let mut in_degree: BTreeMap<LayerId, usize> = self
            .layers
            .values()
            .map(|l| (l.id(), l.source_layers().len()))
            .collect();
        let mut ready: BTreeSet<LayerId> = in_degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&id, _)| id)
            .collect();
        let mut order = Vec::with_capacity(self.layers.len());
        while let Some(id) = ready.pop_first() {
            order.push(id);
            for layer in self.layers.values() {
                if layer.source_layers().contains_key(&id) {
                    let degree = in_degree.entry(layer.id()).or_insert(0);
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(layer.id());
                    }
                }
            }
        }
        if order.len() != self.layers.len() {
            return Err(NlrError::Topology(
                "layer dependencies contain a cycle".to_string(),
            ));
        }
        Ok(order)
    }

    fn validate(&self) -> Result<()> {
        for layer in self.layers.values() {
            let kind = layer.layer_type();
            if kind == LayerType::Input {
                continue;
            }
            if layer.source_layers().is_empty() {
                return Err(NlrError::Topology(format!(
                    "{} layer {} has no predecessor",
                    kind,
                    layer.id()
                )));
            }
            for source in layer.source_layers().keys() {
                if !self.layers.contains_key(source) {
                    return Err(NlrError::Topology(format!(
                        "layer {} depends on unknown layer {}",
                        layer.id(),
                        source
                    )));
                }
            }
            if kind.is_activation() {
                for neuron in 0..layer.size() {
                    let sources = layer.activation_sources(neuron);
                    if sources.is_empty() {
                        return Err(NlrError::Topology(format!(
                            "{} neuron ({}, {}) has no activation source",
                            kind,
                            layer.id(),
                            neuron
                        )));
                    }
                    for source in sources {
                        self.bound(*source)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Concrete bounds of the activation sources of one neuron.
    pub(crate) fn source_bounds(&self, layer: &Layer, neuron: usize) -> Result<Vec<Bound>> {
        layer
            .activation_sources(neuron)
            .iter()
            .map(|&s| self.bound(s))
            .collect()
    }

    /// Evaluate every layer for one concrete input vector.
    ///
    /// `input` covers the input neurons in [`Self::input_neurons`] order.
    /// Eliminated neurons take their fixed value and phase-fixed neurons
    /// their linear form.
    pub fn evaluate_all(&self, input: &[f64]) -> Result<BTreeMap<LayerId, Vec<f64>>> {
        let inputs = self.input_neurons();
        if inputs.len() != input.len() {
            return Err(NlrError::InvalidConfig(format!(
                "expected {} input values, got {}",
                inputs.len(),
                input.len()
            )));
        }
        let mut values: BTreeMap<LayerId, Vec<f64>> = BTreeMap::new();
        for (index, &x) in inputs.iter().zip(input) {
            values
                .entry(index.layer)
                .or_insert_with(|| vec![0.0; self.layers[&index.layer].size()])[index.neuron] = x;
        }
        for id in self.topological_order()? {
            let layer = &self.layers[&id];
            let mut out = match layer.layer_type() {
                LayerType::Input => values.remove(&id).unwrap_or_default(),
                LayerType::WeightedSum => {
                    let mut out = layer.biases().to_vec();
                    for (source, weights) in layer.source_layers().keys().filter_map(|s| {
                        layer.weights(*s).map(|w| (*s, w))
                    }) {
                        let x = &values[&source];
                        for (i, &xi) in x.iter().enumerate() {
                            for (j, o) in out.iter_mut().enumerate() {
                                *o += weights[[i, j]] * xi;
                            }
                        }
                    }
                    out
                }
                kind => {
                    let ops = activation::ops(kind).ok_or_else(|| {
                        NlrError::Topology(format!("no activation functions for {kind}"))
                    })?;
                    (0..layer.size())
                        .map(|n| {
                            let args: Vec<f64> = layer
                                .activation_sources(n)
                                .iter()
                                .map(|s| values[&s.layer][s.neuron])
                                .collect();
                            match layer
                                .fixed_phase(n)
                                .and_then(|p| activation::phase_line(kind, p))
                            {
                                Some(line) => line.at(args[0]),
                                None => (ops.evaluate)(&args),
                            }
                        })
                        .collect()
                }
            };
            for (&neuron, &value) in layer.eliminated_neurons() {
                out[neuron] = value;
            }
            values.insert(id, out);
        }
        Ok(values)
    }

    /// Ids of layers nothing depends on, in id order.
    pub fn output_layers(&self) -> Vec<LayerId> {
        self.layers
            .values()
            .filter(|l| l.successor_layers().is_empty())
            .map(Layer::id)
            .collect()
    }

    /// Every layer `target` (transitively) depends on, plus `target`.
    pub fn ancestors_and_self(&self, target: LayerId) -> Result<BTreeSet<LayerId>> {
        self.layer(target)?;
        let mut seen = BTreeSet::new();
        let mut stack = vec![target];
        while let Some(id) = stack.pop() {
            if seen.insert(id) {
                stack.extend(self.layer(id)?.source_layers().keys().copied());
            }
        }
        Ok(seen)
    }

    /// Remove `id` and shift every larger id down by one so ids stay dense.
    ///
    /// The caller must already have detached `id` from all other layers.
    pub(crate) fn remove_layer_and_compact(&mut self, id: LayerId) {
        self.layers.remove(&id);
        let relabel = |l: LayerId| if l > id { l - 1 } else { l };
        self.layers = std::mem::take(&mut self.layers)
            .into_values()
            .map(|mut layer| {
                layer.relabel(relabel);
                (layer.id(), layer)
            })
            .collect();
    }

    /// One line per layer: id, type, size, predecessors.
    pub fn topology_summary(&self) -> String {
        let mut out = String::new();
        for layer in self.layers.values() {
            let sources: Vec<String> = layer
                .source_layers()
                .keys()
                .map(ToString::to_string)
                .collect();
            let _ = writeln!(
                out,
                "Layer {}: {} size {} sources [{}]",
                layer.id(),
                layer.layer_type(),
                layer.size(),
                sources.join(", ")
            );
        }
        out
    }

    /// One line per neuron: variable and current interval.
    pub fn bounds_summary(&self) -> String {
        let mut out = String::new();
        for layer in self.layers.values() {
            let _ = writeln!(out, "Layer {}:", layer.id());
            for neuron in 0..layer.size() {
                let variable = layer
                    .neuron_to_variable(neuron)
                    .map_or_else(|| "-".to_string(), |v| format!("x{v}"));
                let _ = writeln!(
                    out,
                    "\tNeuron {} ({}): [{}, {}]{}",
                    neuron,
                    variable,
                    layer.lb(neuron),
                    layer.ub(neuron),
                    if layer.neuron_eliminated(neuron) {
                        " (eliminated)"
                    } else {
                        ""
                    }
                );
            }
        }
        out
    }
}
