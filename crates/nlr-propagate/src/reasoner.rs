//! The network-level reasoner.
//!
//! [`NetworkLevelReasoner`] owns the topology graph, binds neurons to
//! solver variables, runs the propagation passes and keeps the log of
//! tightenings discovered for bound variables. Passes append
//! [`BoundUpdate`] events to a list the reasoner owns; the reasoner turns
//! the ones on bound neurons into [`Tightening`]s and forwards them to the
//! explainer, if any, even when the pass then fails.

use crate::activation;
use crate::deep_poly::deep_poly_pass;
use crate::encode;
use crate::interval::interval_pass;
use crate::layer::{Layer, Phase};
use crate::lp::{lp_pass, tighten_layer, Encoding, LpOracle};
use crate::merge::{self, MergeGuards};
use crate::network::NetworkGraph;
use crate::symbolic::symbolic_pass;
use crate::types::{BoundUpdate, PropagationConfig, PropagationPass, PropagationSummary};
use nlr_core::{
    BoundExplainer, BoundKind, BoundStore, LayerId, LayerType, LinearExpression, NeuronIndex,
    NlrError, PiecewiseLinearConstraint, Query, Result, Tightening, Variable, BOUND_EPSILON,
};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, info, instrument, warn};

pub struct NetworkLevelReasoner {
    graph: NetworkGraph,
    config: PropagationConfig,
    tightenings: Vec<Tightening>,
    explainer: Option<Box<dyn BoundExplainer + Send>>,
}

impl Default for NetworkLevelReasoner {
    fn default() -> Self {
        Self::new()
    }
}

/// Copies topology, bounds and the tightening log. The explainer stays
/// with the original.
impl Clone for NetworkLevelReasoner {
    fn clone(&self) -> Self {
        Self {
            graph: self.graph.clone(),
            config: self.config.clone(),
            tightenings: self.tightenings.clone(),
            explainer: None,
        }
    }
}

impl fmt::Debug for NetworkLevelReasoner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkLevelReasoner")
            .field("layers", &self.graph.number_of_layers())
            .field("config", &self.config)
            .field("tightenings", &self.tightenings.len())
            .field("explainer", &self.explainer.is_some())
            .finish()
    }
}

impl NetworkLevelReasoner {
    pub fn new() -> Self {
        Self::with_config(PropagationConfig::default())
    }

    pub fn with_config(config: PropagationConfig) -> Self {
        Self {
            graph: NetworkGraph::new(),
            config,
            tightenings: Vec::new(),
            explainer: None,
        }
    }

    pub fn config(&self) -> &PropagationConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: PropagationConfig) {
        self.config = config;
    }

    /// Attach the proof-explanation hooks.
    pub fn set_explainer(&mut self, explainer: Box<dyn BoundExplainer + Send>) {
        self.explainer = Some(explainer);
    }

    pub fn take_explainer(&mut self) -> Option<Box<dyn BoundExplainer + Send>> {
        self.explainer.take()
    }

    // ---------------------------------------------------------------------
    // Construction
    // ---------------------------------------------------------------------

    pub fn add_layer(&mut self, id: LayerId, layer_type: LayerType, size: usize) -> Result<()> {
        self.graph.add_layer(id, layer_type, size)
    }

    pub fn add_layer_dependency(&mut self, source: LayerId, target: LayerId) -> Result<()> {
        self.graph.add_layer_dependency(source, target)
    }

    pub fn set_weight(
        &mut self,
        source_layer: LayerId,
        source_neuron: usize,
        target_layer: LayerId,
        target_neuron: usize,
        weight: f64,
    ) -> Result<()> {
        self.graph
            .set_weight(source_layer, source_neuron, target_layer, target_neuron, weight)
    }

    pub fn set_bias(&mut self, layer: LayerId, neuron: usize, bias: f64) -> Result<()> {
        self.graph.set_bias(layer, neuron, bias)
    }

    pub fn add_activation_source(
        &mut self,
        source_layer: LayerId,
        source_neuron: usize,
        target_layer: LayerId,
        target_neuron: usize,
    ) -> Result<()> {
        self.graph
            .add_activation_source(source_layer, source_neuron, target_layer, target_neuron)
    }

    pub fn set_neuron_variable(&mut self, index: NeuronIndex, variable: Variable) -> Result<()> {
        self.graph.set_neuron_variable(index, variable)
    }

    pub fn compute_successor_layers(&mut self) {
        self.graph.compute_successor_layers();
    }

    // ---------------------------------------------------------------------
    // Access
    // ---------------------------------------------------------------------

    pub fn graph(&self) -> &NetworkGraph {
        &self.graph
    }

    pub fn layer(&self, id: LayerId) -> Result<&Layer> {
        self.graph.layer(id)
    }

    /// Direct access to a layer's bounds and bindings; topology edits go
    /// through the builder methods.
    pub fn layer_mut(&mut self, id: LayerId) -> Result<&mut Layer> {
        self.graph.layer_mut(id)
    }

    pub fn layers(&self) -> impl Iterator<Item = &Layer> {
        self.graph.layers()
    }

    pub fn number_of_layers(&self) -> usize {
        self.graph.number_of_layers()
    }

    pub fn max_layer_size(&self) -> usize {
        self.graph.max_layer_size()
    }

    pub fn neuron_for_variable(&self, variable: Variable) -> Option<NeuronIndex> {
        self.graph.neuron_for_variable(variable)
    }

    fn neuron_of(&self, variable: Variable) -> Result<NeuronIndex> {
        self.graph
            .neuron_for_variable(variable)
            .ok_or(NlrError::UnknownVariable(variable))
    }

    // ---------------------------------------------------------------------
    // Bounds
    // ---------------------------------------------------------------------

    /// Overwrite the bounds of every bound, non-eliminated neuron with the
    /// store's current values.
    pub fn obtain_current_bounds<S: BoundStore + ?Sized>(&mut self, store: &S) -> Result<()> {
        for layer in self.graph.layers_mut() {
            let bound: Vec<(usize, Variable)> = layer.variables().collect();
            for (neuron, variable) in bound {
                let b = store.bound(variable);
                layer.set_bounds(neuron, b.lower, b.upper)?;
            }
            layer.clear_symbolic_bounds();
        }
        Ok(())
    }

    /// Apply one externally reported bound.
    ///
    /// Returns whether the bound was tighter than the stored one. A bound
    /// crossing the opposite side is `BoundInconsistency`.
    pub fn receive_tighter_bound(&mut self, tightening: Tightening) -> Result<bool> {
        let neuron = self.neuron_of(tightening.variable)?;
        match self
            .graph
            .tighten(neuron, tightening.kind, tightening.value)?
        {
            Some(update) => {
                self.absorb(&[update]);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Log the updates that touch bound neurons; returns how many were logged.
    fn absorb(&mut self, updates: &[BoundUpdate]) -> usize {
        let mut logged = 0;
        for update in updates {
            let Ok(layer) = self.graph.layer(update.neuron.layer) else {
                continue;
            };
            let Some(variable) = layer.neuron_to_variable(update.neuron.neuron) else {
                continue;
            };
            self.tightenings
                .push(Tightening::new(variable, update.value, update.kind));
            if let Some(explainer) = self.explainer.as_mut() {
                match update.kind {
                    BoundKind::Lower => explainer.update_lb_explanation(variable, update.value),
                    BoundKind::Upper => explainer.update_ub_explanation(variable, update.value),
                }
            }
            logged += 1;
        }
        logged
    }

    pub fn constraint_tightenings(&self) -> &[Tightening] {
        &self.tightenings
    }

    pub fn clear_constraint_tightenings(&mut self) {
        self.tightenings.clear();
    }

    pub fn drain_constraint_tightenings(&mut self) -> Vec<Tightening> {
        std::mem::take(&mut self.tightenings)
    }

    // ---------------------------------------------------------------------
    // Propagation
    // ---------------------------------------------------------------------

    /// Run one pass and log what it improved. The improvements a pass made
    /// before failing are logged too, so the layers and the log agree.
    fn run_pass<'o>(
        &mut self,
        pass: PropagationPass,
        oracle: Option<&mut (dyn LpOracle + 'o)>,
    ) -> Result<Vec<BoundUpdate>> {
        let mut updates = Vec::new();
        let outcome = match (pass, oracle) {
            (PropagationPass::Interval, _) => interval_pass(&mut self.graph, &mut updates),
            (PropagationPass::Symbolic, _) => {
                symbolic_pass(&mut self.graph, &self.config, &mut updates)
            }
            (PropagationPass::DeepPoly, _) => {
                deep_poly_pass(&mut self.graph, &self.config, &mut updates)
            }
            (PropagationPass::Lp, Some(oracle)) => lp_pass(
                &mut self.graph,
                oracle,
                Encoding::Relaxation,
                &self.config,
                &mut updates,
            ),
            (PropagationPass::Milp, Some(oracle)) => lp_pass(
                &mut self.graph,
                oracle,
                Encoding::Exact,
                &self.config,
                &mut updates,
            ),
            (pass, None) => {
                return Err(NlrError::OracleUnavailable(format!(
                    "{pass:?} propagation needs an LP oracle"
                )))
            }
        };
        self.absorb(&updates);
        outcome.map(|()| updates)
    }

    /// One interval pass. Returns the number of neuron bounds improved.
    pub fn interval_arithmetic_bound_propagation(&mut self) -> Result<usize> {
        Ok(self.run_pass(PropagationPass::Interval, None)?.len())
    }

    /// One symbolic pass. Returns the number of neuron bounds improved.
    pub fn symbolic_bound_propagation(&mut self) -> Result<usize> {
        Ok(self.run_pass(PropagationPass::Symbolic, None)?.len())
    }

    /// One backward pass. Returns the number of neuron bounds improved.
    pub fn deep_poly_propagation(&mut self) -> Result<usize> {
        Ok(self.run_pass(PropagationPass::DeepPoly, None)?.len())
    }

    pub fn lp_relaxation_propagation(&mut self, oracle: &mut dyn LpOracle) -> Result<usize> {
        Ok(self.run_pass(PropagationPass::Lp, Some(oracle))?.len())
    }

    pub fn milp_propagation(&mut self, oracle: &mut dyn LpOracle) -> Result<usize> {
        Ok(self.run_pass(PropagationPass::Milp, Some(oracle))?.len())
    }

    pub fn lp_tightening_for_one_layer(
        &mut self,
        layer: LayerId,
        oracle: &mut dyn LpOracle,
    ) -> Result<usize> {
        self.tighten_one_layer(layer, oracle, Encoding::Relaxation)
    }

    pub fn milp_tightening_for_one_layer(
        &mut self,
        layer: LayerId,
        oracle: &mut dyn LpOracle,
    ) -> Result<usize> {
        self.tighten_one_layer(layer, oracle, Encoding::Exact)
    }

    fn tighten_one_layer(
        &mut self,
        layer: LayerId,
        oracle: &mut dyn LpOracle,
        encoding: Encoding,
    ) -> Result<usize> {
        let mut budget = self.config.oracle_call_budget;
        let mut updates = Vec::new();
        let outcome = tighten_layer(
            &mut self.graph,
            layer,
            oracle,
            encoding,
            &mut budget,
            &mut updates,
        );
        self.absorb(&updates);
        outcome.map(|()| updates.len())
    }

    /// Repeat the configured passes, cheapest first, until a round improves
    /// no bound by more than `tolerance` or `max_iterations` rounds ran.
    ///
    /// Oracle passes are skipped when no oracle is given.
    #[instrument(skip_all)]
    pub fn iterative_propagation(
        &mut self,
        mut oracle: Option<&mut dyn LpOracle>,
    ) -> Result<PropagationSummary> {
        let mut passes = self.config.passes.clone();
        passes.sort();
        passes.dedup();
        if oracle.is_none() && passes.iter().any(|p| p.needs_oracle()) {
            warn!("no LP oracle given, skipping LP/MILP passes");
            passes.retain(|p| !p.needs_oracle());
        }

        let mut summary = PropagationSummary::default();
        let logged_before = self.tightenings.len();
        while summary.iterations < self.config.max_iterations {
            summary.iterations += 1;
            let mut best = 0.0_f64;
            for &pass in &passes {
                let updates = self.run_pass(pass, oracle.as_deref_mut())?;
                summary.updates += updates.len();
                best = updates.iter().map(BoundUpdate::improvement).fold(best, f64::max);
            }
            debug!(round = summary.iterations, best_improvement = best, "propagation round");
            if best <= self.config.tolerance {
                summary.converged = true;
                break;
            }
        }
        summary.tightenings = self.tightenings.len() - logged_before;
        info!(
            iterations = summary.iterations,
            updates = summary.updates,
            converged = summary.converged,
            "iterative propagation finished"
        );
        Ok(summary)
    }

    // ---------------------------------------------------------------------
    // Structural operations
    // ---------------------------------------------------------------------

    /// Fix the neuron bound to `variable` to `value`.
    pub fn eliminate_variable(&mut self, variable: Variable, value: f64) -> Result<()> {
        let neuron = self.neuron_of(variable)?;
        self.eliminate_neuron(neuron, value)
    }

    /// Eliminate one neuron. The sides of its interval the fixed value
    /// improves are logged and explained like any other tightening.
    pub(crate) fn eliminate_neuron(&mut self, neuron: NeuronIndex, value: f64) -> Result<()> {
        let before = self.graph.bound(neuron)?;
        self.graph
            .layer_mut(neuron.layer)?
            .eliminate_neuron(neuron.neuron, value)?;
        let mut updates = Vec::new();
        if value > before.lower + BOUND_EPSILON {
            updates.push(BoundUpdate {
                neuron,
                kind: BoundKind::Lower,
                value,
                previous: before.lower,
            });
        }
        if value < before.upper - BOUND_EPSILON {
            updates.push(BoundUpdate {
                neuron,
                kind: BoundKind::Upper,
                value,
                previous: before.upper,
            });
        }
        let logged = self.absorb(&updates);
        debug!(%neuron, value, logged, "eliminated neuron");
        Ok(())
    }

    /// Eliminate `variable` and rewrite `query` to match: the variable is
    /// substituted in every equation, fixed in the bounds, and its
    /// piecewise-linear constraint (if it is an output) dropped.
    pub fn eliminate_variable_in_query(
        &mut self,
        query: &mut Query,
        variable: Variable,
        value: f64,
    ) -> Result<()> {
        self.eliminate_variable(variable, value)?;
        query.fix_variable(variable, value);
        query.remove_constraint_for_output(variable);
        Ok(())
    }

    /// Fix a piecewise-linear neuron's phase without eliminating it.
    pub fn fix_neuron_phase(&mut self, neuron: NeuronIndex, phase: Phase) -> Result<()> {
        let layer = self.graph.layer_mut(neuron.layer)?;
        layer.check_neuron(neuron.neuron)?;
        let kind = layer.layer_type();
        if activation::phase_line(kind, phase).is_none() {
            return Err(NlrError::UnsupportedActivation {
                layer_type: kind,
                operation: "phase fixing",
            });
        }
        layer.fix_phase(neuron.neuron, phase);
        Ok(())
    }

    /// Merge consecutive weighted-sum layers; see [`merge`].
    pub fn merge_consecutive_ws_layers(
        &mut self,
        lower_bounds: &BTreeMap<Variable, f64>,
        upper_bounds: &BTreeMap<Variable, f64>,
        vars_in_unhandled: &BTreeSet<Variable>,
        eliminated: &mut BTreeMap<Variable, LinearExpression>,
    ) -> Result<usize> {
        let guards = MergeGuards {
            lower_bounds,
            upper_bounds,
            vars_in_unhandled,
        };
        merge::merge_consecutive_ws_layers(&mut self.graph, &guards, eliminated)
    }

    /// Whether every configured pass can bound layers of `layer_type`.
    pub fn function_type_supported(&self, layer_type: LayerType) -> bool {
        self.config.passes.iter().all(|pass| pass.supports(layer_type))
    }

    pub fn constraints_in_topological_order(&self) -> Result<Vec<PiecewiseLinearConstraint>> {
        encode::constraints_in_topological_order(&self.graph)
    }

    pub fn generate_query(&self) -> Result<Query> {
        encode::generate_query(&self.graph)
    }

    pub fn encode_affine_layers(&self, query: &mut Query) -> Result<()> {
        encode::encode_affine_layers(&self.graph, query)
    }

    /// Rename bound variables after the caller renumbered its variables.
    pub fn update_variable_indices(
        &mut self,
        old_to_new: &BTreeMap<Variable, Variable>,
        merged: &BTreeMap<Variable, Variable>,
    ) -> Result<()> {
        for layer in self.graph.layers_mut() {
            layer.update_variable_indices(old_to_new, merged)?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Evaluation
    // ---------------------------------------------------------------------

    /// Evaluate the network on `input` and return the values of the last
    /// layer in topological order.
    pub fn evaluate(&self, input: &[f64]) -> Result<Vec<f64>> {
        let order = self.graph.topological_order()?;
        let mut values = self.graph.evaluate_all(input)?;
        Ok(order
            .last()
            .and_then(|id| values.remove(id))
            .unwrap_or_default())
    }

    /// Evaluate a batch of inputs. Returns, per layer, one row of neuron
    /// values per input, in input order.
    pub fn simulate(&self, inputs: &[Vec<f64>]) -> Result<BTreeMap<LayerId, Vec<Vec<f64>>>> {
        let mut simulations: BTreeMap<LayerId, Vec<Vec<f64>>> = BTreeMap::new();
        for input in inputs {
            for (id, values) in self.graph.evaluate_all(input)? {
                simulations.entry(id).or_default().push(values);
            }
        }
        debug!(samples = inputs.len(), "simulated network");
        Ok(simulations)
    }

    /// Complete an assignment of the input variables with the value of
    /// every other bound variable.
    pub fn concretize_input_assignment(
        &self,
        assignment: &mut BTreeMap<Variable, f64>,
    ) -> Result<()> {
        let mut input = Vec::new();
        for index in self.graph.input_neurons() {
            let layer = self.graph.layer(index.layer)?;
            let value = match (
                layer.eliminated_value(index.neuron),
                layer.neuron_to_variable(index.neuron),
            ) {
                (Some(value), _) => value,
                (None, Some(variable)) => *assignment
                    .get(&variable)
                    .ok_or(NlrError::UnknownVariable(variable))?,
                (None, None) => {
                    return Err(NlrError::Topology(format!(
                        "input neuron {index} is not bound to a variable"
                    )))
                }
            };
            input.push(value);
        }
        let values = self.graph.evaluate_all(&input)?;
        for layer in self.graph.layers() {
            for (neuron, variable) in layer.variables() {
                if let Some(value) = values.get(&layer.id()).and_then(|v| v.get(neuron)) {
                    assignment.insert(variable, *value);
                }
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Copies and debugging
    // ---------------------------------------------------------------------

    /// Deep-copy topology, bounds, configuration and log into `other`.
    /// `other` keeps its own explainer.
    pub fn store_into_other(&self, other: &mut NetworkLevelReasoner) {
        other.graph = self.graph.clone();
        other.config = self.config.clone();
        other.tightenings = self.tightenings.clone();
    }

    pub fn topology_summary(&self) -> String {
        self.graph.topology_summary()
    }

    pub fn bounds_summary(&self) -> String {
        self.graph.bounds_summary()
    }

    pub fn dump_topology(&self) {
        info!("network topology:\n{}", self.graph.topology_summary());
    }

    pub fn dump_bounds(&self) {
        info!("neuron bounds:\n{}", self.graph.bounds_summary());
    }
}
