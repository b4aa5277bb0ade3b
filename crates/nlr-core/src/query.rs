//! Flat constraint system handed to the downstream solver.
//!
//! A [`Query`] is the flattened form of a network: a number of variables,
//! per-variable bounds, linear equations `Σ cᵢ·xᵢ = scalar` and one
//! piecewise-linear constraint per nonlinear neuron.

use crate::{LayerType, Variable, BOUND_EPSILON};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One `coefficient * variable` term.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Addend {
    pub coefficient: f64,
    pub variable: Variable,
}

/// Linear equation `Σ coefficient·variable = scalar`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Equation {
    pub addends: Vec<Addend>,
    pub scalar: f64,
    /// Bookkeeping variable fixed to zero, if the equation carries one.
    pub aux: Option<Variable>,
}

impl Equation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_addend(&mut self, coefficient: f64, variable: Variable) {
        self.addends.push(Addend {
            coefficient,
            variable,
        });
    }

    pub fn set_scalar(&mut self, scalar: f64) {
        self.scalar = scalar;
    }

    pub fn mark_auxiliary_variable(&mut self, variable: Variable) {
        self.aux = Some(variable);
    }

    pub fn contains(&self, variable: Variable) -> bool {
        self.addends.iter().any(|a| a.variable == variable)
    }

    /// Sum of the coefficients on `variable`.
    pub fn coefficient_of(&self, variable: Variable) -> f64 {
        self.addends
            .iter()
            .filter(|a| a.variable == variable)
            .map(|a| a.coefficient)
            .sum()
    }

    /// Replace `variable` by the constant `value`, moving its contribution to
    /// the scalar. Returns true if the equation referenced the variable.
    pub fn substitute(&mut self, variable: Variable, value: f64) -> bool {
        let coefficient = self.coefficient_of(variable);
        let before = self.addends.len();
        self.addends.retain(|a| a.variable != variable);
        if self.addends.len() == before {
            return false;
        }
        self.scalar -= coefficient * value;
        if self.aux == Some(variable) {
            self.aux = None;
        }
        true
    }

    /// Rename variables according to `map`; unmapped variables are kept.
    pub fn rename(&mut self, map: &BTreeMap<Variable, Variable>) {
        for addend in &mut self.addends {
            if let Some(&new) = map.get(&addend.variable) {
                addend.variable = new;
            }
        }
        if let Some(aux) = self.aux {
            self.aux = map.get(&aux).copied().or(Some(aux));
        }
    }

    /// `0 = scalar` with a nonzero scalar: no assignment satisfies it.
    pub fn is_contradiction(&self) -> bool {
        self.addends.is_empty() && self.scalar.abs() > BOUND_EPSILON
    }

    /// Left-hand side minus scalar under `assignment`; zero when satisfied.
    /// Returns `None` if a variable is unassigned.
    pub fn residual(&self, assignment: &BTreeMap<Variable, f64>) -> Option<f64> {
        let mut lhs = 0.0;
        for addend in &self.addends {
            lhs += addend.coefficient * assignment.get(&addend.variable)?;
        }
        Some(lhs - self.scalar)
    }
}

/// Affine expression `constant + Σ coefficient·variable`.
///
/// Used to report neurons that were merged away, in terms of the variables
/// that remain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinearExpression {
    pub terms: BTreeMap<Variable, f64>,
    pub constant: f64,
}

impl LinearExpression {
    pub fn constant(value: f64) -> Self {
        Self {
            terms: BTreeMap::new(),
            constant: value,
        }
    }

    pub fn add_term(&mut self, variable: Variable, coefficient: f64) {
        *self.terms.entry(variable).or_insert(0.0) += coefficient;
    }

    pub fn evaluate(&self, assignment: &BTreeMap<Variable, f64>) -> Option<f64> {
        let mut value = self.constant;
        for (variable, coefficient) in &self.terms {
            value += coefficient * assignment.get(variable)?;
        }
        Some(value)
    }
}

/// A non-affine relation between solver variables.
///
/// Each variant references exactly the variables it couples: `b` is the
/// pre-activation (source) variable and `f` the post-activation one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PiecewiseLinearConstraint {
    Relu { b: Variable, f: Variable },
    Sign { b: Variable, f: Variable },
    AbsoluteValue { b: Variable, f: Variable },
    Max { elements: Vec<Variable>, f: Variable },
    /// Not piecewise-linear, but handed downstream the same way.
    Sigmoid { b: Variable, f: Variable },
}

impl PiecewiseLinearConstraint {
    pub fn participating_variables(&self) -> Vec<Variable> {
        match self {
            PiecewiseLinearConstraint::Relu { b, f }
            | PiecewiseLinearConstraint::Sign { b, f }
            | PiecewiseLinearConstraint::AbsoluteValue { b, f }
            | PiecewiseLinearConstraint::Sigmoid { b, f } => vec![*b, *f],
            PiecewiseLinearConstraint::Max { elements, f } => {
                let mut vars = elements.clone();
                vars.push(*f);
                vars
            }
        }
    }

    pub fn output_variable(&self) -> Variable {
        match self {
            PiecewiseLinearConstraint::Relu { f, .. }
            | PiecewiseLinearConstraint::Sign { f, .. }
            | PiecewiseLinearConstraint::AbsoluteValue { f, .. }
            | PiecewiseLinearConstraint::Sigmoid { f, .. }
            | PiecewiseLinearConstraint::Max { f, .. } => *f,
        }
    }

    pub fn layer_type(&self) -> LayerType {
        match self {
            PiecewiseLinearConstraint::Relu { .. } => LayerType::Relu,
            PiecewiseLinearConstraint::Sign { .. } => LayerType::Sign,
            PiecewiseLinearConstraint::AbsoluteValue { .. } => LayerType::AbsoluteValue,
            PiecewiseLinearConstraint::Max { .. } => LayerType::Max,
            PiecewiseLinearConstraint::Sigmoid { .. } => LayerType::Sigmoid,
        }
    }

    fn rename(&mut self, map: &BTreeMap<Variable, Variable>) {
        let remap = |v: &mut Variable| {
            if let Some(&new) = map.get(v) {
                *v = new;
            }
        };
        match self {
            PiecewiseLinearConstraint::Relu { b, f }
            | PiecewiseLinearConstraint::Sign { b, f }
            | PiecewiseLinearConstraint::AbsoluteValue { b, f }
            | PiecewiseLinearConstraint::Sigmoid { b, f } => {
                remap(b);
                remap(f);
            }
            PiecewiseLinearConstraint::Max { elements, f } => {
                elements.iter_mut().for_each(remap);
                remap(f);
            }
        }
    }
}

/// The flat constraint system: variables, bounds, equations and
/// piecewise-linear constraints.
///
/// Variables without an explicit bound are unbounded on that side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    num_variables: usize,
    lower_bounds: BTreeMap<Variable, f64>,
    upper_bounds: BTreeMap<Variable, f64>,
    equations: Vec<Equation>,
    constraints: Vec<PiecewiseLinearConstraint>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_number_of_variables(&mut self, num_variables: usize) {
        self.num_variables = num_variables;
    }

    pub fn number_of_variables(&self) -> usize {
        self.num_variables
    }

    /// Allocate a fresh variable at the end of the index space.
    pub fn new_variable(&mut self) -> Variable {
        let variable = self.num_variables;
        self.num_variables += 1;
        variable
    }

    pub fn set_lower_bound(&mut self, variable: Variable, value: f64) {
        self.lower_bounds.insert(variable, value);
    }

    pub fn set_upper_bound(&mut self, variable: Variable, value: f64) {
        self.upper_bounds.insert(variable, value);
    }

    pub fn lower_bound(&self, variable: Variable) -> f64 {
        self.lower_bounds
            .get(&variable)
            .copied()
            .unwrap_or(f64::NEG_INFINITY)
    }

    pub fn upper_bound(&self, variable: Variable) -> f64 {
        self.upper_bounds
            .get(&variable)
            .copied()
            .unwrap_or(f64::INFINITY)
    }

    /// Explicit lower bounds, keyed by variable.
    pub fn lower_bounds(&self) -> &BTreeMap<Variable, f64> {
        &self.lower_bounds
    }

    pub fn upper_bounds(&self) -> &BTreeMap<Variable, f64> {
        &self.upper_bounds
    }

    pub fn add_equation(&mut self, equation: Equation) {
        self.equations.push(equation);
    }

    pub fn equations(&self) -> &[Equation] {
        &self.equations
    }

    pub fn equations_mut(&mut self) -> &mut Vec<Equation> {
        &mut self.equations
    }

    pub fn add_piecewise_linear_constraint(&mut self, constraint: PiecewiseLinearConstraint) {
        self.constraints.push(constraint);
    }

    pub fn piecewise_linear_constraints(&self) -> &[PiecewiseLinearConstraint] {
        &self.constraints
    }

    /// Remove the constraint whose output variable is `f`; returns it if found.
    pub fn remove_constraint_for_output(
        &mut self,
        f: Variable,
    ) -> Option<PiecewiseLinearConstraint> {
        let position = self
            .constraints
            .iter()
            .position(|c| c.output_variable() == f)?;
        Some(self.constraints.remove(position))
    }

    /// Substitute `value` for `variable` in every equation and fix its bounds.
    ///
    /// Equations left without variables are dropped when they reduce to
    /// `0 = 0` and kept when they reduce to a contradiction, so the solver
    /// still sees the infeasibility.
    pub fn fix_variable(&mut self, variable: Variable, value: f64) {
        for equation in &mut self.equations {
            equation.substitute(variable, value);
        }
        self.equations
            .retain(|e| !e.addends.is_empty() || e.is_contradiction());
        self.set_lower_bound(variable, value);
        self.set_upper_bound(variable, value);
    }

    pub fn has_contradiction(&self) -> bool {
        self.equations.iter().any(Equation::is_contradiction)
    }

    /// Rename variables in every equation and constraint.
    pub fn rename_variables(&mut self, map: &BTreeMap<Variable, Variable>) {
        for equation in &mut self.equations {
            equation.rename(map);
        }
        for constraint in &mut self.constraints {
            constraint.rename(map);
        }
        let rename_keys = |bounds: &BTreeMap<Variable, f64>| {
            bounds
                .iter()
                .map(|(v, b)| (map.get(v).copied().unwrap_or(*v), *b))
                .collect::<BTreeMap<_, _>>()
        };
        self.lower_bounds = rename_keys(&self.lower_bounds);
        self.upper_bounds = rename_keys(&self.upper_bounds);
    }
}
