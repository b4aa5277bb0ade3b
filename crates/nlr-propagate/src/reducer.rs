//! Network reduction by fixing the least stable-margin neurons.
//!
//! Every non-eliminated, non-phase-fixed ReLU, absolute-value and sign
//! neuron gets a stability score `min(|lb|, |ub|)` of its pre-activation
//! interval. The first `⌊rate · n⌋` neurons in `(score, NeuronIndex)`
//! order are selected. A selected neuron is fixed only if its
//! pre-activation interval certifies the branch; otherwise it is skipped.

use crate::encode::two_term_equation;
use crate::layer::Phase;
use crate::network::NetworkGraph;
use crate::reasoner::NetworkLevelReasoner;
use nlr_core::{LayerType, NeuronIndex, NlrError, Query, Result, Variable};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

/// Neurons sharing one stability score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StabilityBucket {
    pub score: f64,
    pub neurons: Vec<NeuronIndex>,
}

/// What a reduction did to each selected neuron.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReductionReport {
    /// Selected neurons, in selection order.
    pub selected: Vec<NeuronIndex>,
    /// Fixed to the inactive branch (`ub <= 0`).
    pub fixed_inactive: Vec<NeuronIndex>,
    /// Fixed to the active branch (`lb >= 0`).
    pub fixed_active: Vec<NeuronIndex>,
    /// Selected but still straddling zero.
    pub skipped: Vec<NeuronIndex>,
}

/// Result of the non-mutating [`NetworkReducer::reduce`].
#[derive(Debug, Clone, PartialEq)]
pub struct Reduction {
    pub query: Query,
    pub report: ReductionReport,
}

/// How one selected neuron is fixed.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Fix {
    /// Output fixed to a constant.
    Eliminate(f64),
    Phase(Phase),
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    neuron: NeuronIndex,
    kind: LayerType,
    lower: f64,
    upper: f64,
    score: f64,
}

impl Candidate {
    /// The fix certified by the pre-activation interval, if any. The second
    /// element is true for the active branch.
    fn certified_fix(&self) -> Option<(Fix, bool)> {
        match self.kind {
            LayerType::Relu if self.upper <= 0.0 => Some((Fix::Eliminate(0.0), false)),
            LayerType::Relu if self.lower >= 0.0 => Some((Fix::Phase(Phase::Active), true)),
            LayerType::AbsoluteValue if self.upper <= 0.0 => {
                Some((Fix::Phase(Phase::Inactive), false))
            }
            LayerType::AbsoluteValue if self.lower >= 0.0 => {
                Some((Fix::Phase(Phase::Active), true))
            }
            LayerType::Sign if self.upper < 0.0 => Some((Fix::Eliminate(-1.0), false)),
            LayerType::Sign if self.lower >= 0.0 => Some((Fix::Eliminate(1.0), true)),
            _ => None,
        }
    }
}

fn candidates(graph: &NetworkGraph) -> Result<Vec<Candidate>> {
    let mut out = Vec::new();
    for layer in graph.layers() {
        let kind = layer.layer_type();
        if !(kind.is_piecewise_linear() && kind.is_single_source()) {
            continue;
        }
        for neuron in 0..layer.size() {
            if layer.neuron_eliminated(neuron) || layer.fixed_phase(neuron).is_some() {
                continue;
            }
            let Some(&source) = layer.activation_sources(neuron).first() else {
                continue;
            };
            let b = graph.bound(source)?;
            out.push(Candidate {
                neuron: NeuronIndex::new(layer.id(), neuron),
                kind,
                lower: b.lower,
                upper: b.upper,
                score: b.lower.abs().min(b.upper.abs()),
            });
        }
    }
    out.sort_by(|a, b| a.score.total_cmp(&b.score).then(a.neuron.cmp(&b.neuron)));
    Ok(out)
}

/// Group the scoreable neurons by equal stability score, ascending.
pub fn stability_buckets(graph: &NetworkGraph) -> Result<Vec<StabilityBucket>> {
    let mut buckets: Vec<StabilityBucket> = Vec::new();
    for candidate in candidates(graph)? {
        match buckets.last_mut() {
            Some(bucket) if bucket.score.total_cmp(&candidate.score).is_eq() => {
                bucket.neurons.push(candidate.neuron)
            }
            _ => buckets.push(StabilityBucket {
                score: candidate.score,
                neurons: vec![candidate.neuron],
            }),
        }
    }
    Ok(buckets)
}

fn check_rate(rate: f64) -> Result<()> {
    if (0.0..=1.0).contains(&rate) {
        Ok(())
    } else {
        Err(NlrError::InvalidConfig(format!(
            "reduction rate must be in [0, 1], got {rate}"
        )))
    }
}

/// `⌊rate · total⌋` with a little slack for products like `0.6 · 5`.
fn selection_size(rate: f64, total: usize) -> usize {
    ((rate * total as f64 + 1e-9).floor() as usize).min(total)
}

fn select(graph: &NetworkGraph, rate: f64) -> Result<Vec<Candidate>> {
    let mut all = candidates(graph)?;
    let count = selection_size(rate, all.len());
    all.truncate(count);
    Ok(all)
}

/// Apply the certified fixes to `reasoner`, and to `query` when given.
fn apply(
    reasoner: &mut NetworkLevelReasoner,
    mut query: Option<&mut Query>,
    selected: &[Candidate],
) -> Result<ReductionReport> {
    let mut report = ReductionReport {
        selected: selected.iter().map(|c| c.neuron).collect(),
        ..Default::default()
    };
    for candidate in selected {
        let Some((fix, active)) = candidate.certified_fix() else {
            report.skipped.push(candidate.neuron);
            continue;
        };
        match fix {
            Fix::Eliminate(value) => reasoner.eliminate_neuron(candidate.neuron, value)?,
            Fix::Phase(phase) => reasoner.fix_neuron_phase(candidate.neuron, phase)?,
        }
        if let Some(query) = query.as_deref_mut() {
            rewrite_query(reasoner, query, candidate, fix)?;
        }
        debug!(neuron = %candidate.neuron, score = candidate.score, ?fix, "fixed neuron");
        if active {
            report.fixed_active.push(candidate.neuron);
        } else {
            report.fixed_inactive.push(candidate.neuron);
        }
    }
    Ok(report)
}

fn bound_variable(reasoner: &NetworkLevelReasoner, neuron: NeuronIndex) -> Result<Variable> {
    reasoner
        .layer(neuron.layer)?
        .neuron_to_variable(neuron.neuron)
        .ok_or_else(|| NlrError::Topology(format!("neuron {neuron} is not bound to a variable")))
}

fn rewrite_query(
    reasoner: &NetworkLevelReasoner,
    query: &mut Query,
    candidate: &Candidate,
    fix: Fix,
) -> Result<()> {
    let f = bound_variable(reasoner, candidate.neuron)?;
    query.remove_constraint_for_output(f);
    match fix {
        Fix::Eliminate(value) => query.fix_variable(f, value),
        Fix::Phase(phase) => {
            let layer = reasoner.layer(candidate.neuron.layer)?;
            let source = layer
                .activation_sources(candidate.neuron.neuron)
                .first()
                .copied()
                .ok_or_else(|| {
                    NlrError::Topology(format!("neuron {} has no source", candidate.neuron))
                })?;
            let b = bound_variable(reasoner, source)?;
            let coefficient = match (candidate.kind, phase) {
                (LayerType::AbsoluteValue, Phase::Inactive) => 1.0,
                _ => -1.0,
            };
            query.add_equation(two_term_equation(b, f, coefficient));
        }
    }
    Ok(())
}

/// Reduces a network by fixing the neurons closest to their switching point
/// whose bounds nonetheless certify one branch.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkReducer;

impl NetworkReducer {
    /// Reduce a scratch copy of `reasoner` and return the regenerated query.
    ///
    /// Bounds are taken from `query`; neither argument is modified.
    #[instrument(skip_all, fields(rate = rate))]
    pub fn reduce(
        reasoner: &NetworkLevelReasoner,
        query: &Query,
        rate: f64,
    ) -> Result<Reduction> {
        check_rate(rate)?;
        let mut scratch = reasoner.clone();
        refresh_bounds(&mut scratch, query)?;
        scratch.clear_constraint_tightenings();

        let selected = select(scratch.graph(), rate)?;
        let report = apply(&mut scratch, None, &selected)?;
        let query = scratch.generate_query()?;
        log_report(&report);
        Ok(Reduction { query, report })
    }

    /// Reduce `reasoner` itself and rewrite `query` in place.
    ///
    /// The reasoner logs the tightenings found while refreshing bounds.
    #[instrument(skip_all, fields(rate = rate))]
    pub fn reduce_in_place(
        reasoner: &mut NetworkLevelReasoner,
        query: &mut Query,
        rate: f64,
    ) -> Result<ReductionReport> {
        check_rate(rate)?;
        refresh_bounds(reasoner, query)?;
        let selected = select(reasoner.graph(), rate)?;
        let report = apply(reasoner, Some(query), &selected)?;
        log_report(&report);
        Ok(report)
    }
}

fn refresh_bounds(reasoner: &mut NetworkLevelReasoner, query: &Query) -> Result<()> {
    reasoner.obtain_current_bounds(query)?;
    reasoner.interval_arithmetic_bound_propagation()?;
    reasoner.symbolic_bound_propagation()?;
    reasoner.deep_poly_propagation()?;
    Ok(())
}

fn log_report(report: &ReductionReport) {
    info!(
        selected = report.selected.len(),
        fixed_inactive = report.fixed_inactive.len(),
        fixed_active = report.fixed_active.len(),
        skipped = report.skipped.len(),
        "network reduction finished"
    );
}
