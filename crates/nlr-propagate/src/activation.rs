//! Per-activation pure functions, keyed by [`LayerType`].
//!
//! Every nonlinear layer type supplies three things: concrete evaluation,
//! the interval image of its source intervals, and a sound linear
//! relaxation of its graph over those intervals. Propagation passes look the
//! table up once per layer and never branch on the activation kind
//! themselves.

use crate::layer::Phase;
use crate::types::ReluLowerRelaxation;
use nlr_core::{Bound, LayerType};

/// `y = slope * x + intercept`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Line {
    pub slope: f64,
    pub intercept: f64,
}

impl Line {
    pub const IDENTITY: Line = Line {
        slope: 1.0,
        intercept: 0.0,
    };

    pub fn constant(value: f64) -> Self {
        Self {
            slope: 0.0,
            intercept: value,
        }
    }

    /// Line of the given slope passing through `(x, y)`.
    pub fn through(slope: f64, x: f64, y: f64) -> Self {
        Self {
            slope,
            intercept: y - slope * x,
        }
    }

    pub fn at(&self, x: f64) -> f64 {
        if self.slope == 0.0 {
            self.intercept
        } else {
            self.slope * x + self.intercept
        }
    }
}

/// Sound linear relaxation of an activation over its source box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Relaxation {
    /// `lower(x) <= y <= upper(x)` for the single source `x`.
    Affine { lower: Line, upper: Line },
    /// `y` equals source `k` exactly.
    Select(usize),
    /// `y >= x_k` and `y <= upper`.
    Dominated { lower_source: usize, upper: f64 },
}

impl Relaxation {
    /// True when the relaxation is exact over the box.
    pub fn is_exact(&self) -> bool {
        match self {
            Relaxation::Affine { lower, upper } => lower == upper,
            Relaxation::Select(_) => true,
            Relaxation::Dominated { .. } => false,
        }
    }
}

/// The dispatch entry of one activation kind.
pub struct ActivationOps {
    pub evaluate: fn(&[f64]) -> f64,
    pub interval: fn(&[Bound]) -> Bound,
    pub relaxation: fn(&[Bound], ReluLowerRelaxation) -> Relaxation,
}

static RELU: ActivationOps = ActivationOps {
    evaluate: |x| x[0].max(0.0),
    interval: relu_interval,
    relaxation: relu_relaxation,
};

static SIGMOID: ActivationOps = ActivationOps {
    evaluate: |x| sigmoid(x[0]),
    interval: |b| Bound {
        lower: sigmoid(b[0].lower),
        upper: sigmoid(b[0].upper),
    },
    relaxation: sigmoid_relaxation,
};

static SIGN: ActivationOps = ActivationOps {
    evaluate: |x| if x[0] < 0.0 { -1.0 } else { 1.0 },
    interval: sign_interval,
    relaxation: sign_relaxation,
};

static ABSOLUTE_VALUE: ActivationOps = ActivationOps {
    evaluate: |x| x[0].abs(),
    interval: abs_interval,
    relaxation: abs_relaxation,
};

static MAX: ActivationOps = ActivationOps {
    evaluate: |x| x.iter().copied().fold(f64::NEG_INFINITY, f64::max),
    interval: max_interval,
    relaxation: max_relaxation,
};

/// Look up the activation functions for `layer_type`.
///
/// Returns `None` for input and weighted-sum layers.
pub fn ops(layer_type: LayerType) -> Option<&'static ActivationOps> {
    match layer_type {
        LayerType::Relu => Some(&RELU),
        LayerType::Sigmoid => Some(&SIGMOID),
        LayerType::Sign => Some(&SIGN),
        LayerType::AbsoluteValue => Some(&ABSOLUTE_VALUE),
        LayerType::Max => Some(&MAX),
        LayerType::Input | LayerType::WeightedSum => None,
    }
}

/// The linear form a phase-fixed neuron takes, as a function of its source.
pub fn phase_line(layer_type: LayerType, phase: Phase) -> Option<Line> {
    match (layer_type, phase) {
        (LayerType::Relu, Phase::Active) | (LayerType::AbsoluteValue, Phase::Active) => {
            Some(Line::IDENTITY)
        }
        (LayerType::Relu, Phase::Inactive) => Some(Line::constant(0.0)),
        (LayerType::AbsoluteValue, Phase::Inactive) => Some(Line {
            slope: -1.0,
            intercept: 0.0,
        }),
        (LayerType::Sign, Phase::Active) => Some(Line::constant(1.0)),
        (LayerType::Sign, Phase::Inactive) => Some(Line::constant(-1.0)),
        _ => None,
    }
}

pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn sigmoid_derivative(x: f64) -> f64 {
    let s = sigmoid(x);
    s * (1.0 - s)
}

fn relu_interval(b: &[Bound]) -> Bound {
    Bound {
        lower: b[0].lower.max(0.0),
        upper: b[0].upper.max(0.0),
    }
}

fn relu_relaxation(b: &[Bound], lower_mode: ReluLowerRelaxation) -> Relaxation {
    let Bound { lower: l, upper: u } = b[0];
    if u <= 0.0 {
        let zero = Line::constant(0.0);
        return Relaxation::Affine {
            lower: zero,
            upper: zero,
        };
    }
    if l >= 0.0 {
        return Relaxation::Affine {
            lower: Line::IDENTITY,
            upper: Line::IDENTITY,
        };
    }
    let lower = match lower_mode {
        ReluLowerRelaxation::Adaptive if u > -l => Line::IDENTITY,
        _ => Line::constant(0.0),
    };
    let upper = if l.is_finite() && u.is_finite() {
        let slope = u / (u - l);
        Line {
            slope,
            intercept: -l * slope,
        }
    } else {
        Line::constant(u)
    };
    Relaxation::Affine { lower, upper }
}

fn sigmoid_relaxation(b: &[Bound], _: ReluLowerRelaxation) -> Relaxation {
    let Bound { lower: l, upper: u } = b[0];
    let (sl, su) = (sigmoid(l), sigmoid(u));
    if !l.is_finite() || !u.is_finite() || u - l < 1e-12 {
        return Relaxation::Affine {
            lower: Line::constant(sl),
            upper: Line::constant(su),
        };
    }
    let chord = (su - sl) / (u - l);
    let tangent = sigmoid_derivative(l).min(sigmoid_derivative(u));
    // Convex below zero, concave above.
    let lower = if l > 0.0 {
        Line::through(chord, l, sl)
    } else {
        Line::through(tangent, l, sl)
    };
    let upper = if u <= 0.0 {
        Line::through(chord, u, su)
    } else {
        Line::through(tangent, u, su)
    };
    Relaxation::Affine { lower, upper }
}

fn sign_interval(b: &[Bound]) -> Bound {
    if b[0].lower >= 0.0 {
        Bound::concrete(1.0)
    } else if b[0].upper < 0.0 {
        Bound::concrete(-1.0)
    } else {
        Bound::new(-1.0, 1.0)
    }
}

fn sign_relaxation(b: &[Bound], _: ReluLowerRelaxation) -> Relaxation {
    let Bound { lower: l, upper: u } = b[0];
    if l >= 0.0 || u < 0.0 {
        let value = if l >= 0.0 { 1.0 } else { -1.0 };
        return Relaxation::Affine {
            lower: Line::constant(value),
            upper: Line::constant(value),
        };
    }
    let lower = if u.is_finite() && u > 0.0 {
        Line {
            slope: 2.0 / u,
            intercept: -1.0,
        }
    } else {
        Line::constant(-1.0)
    };
    let upper = if l.is_finite() {
        Line {
            slope: -2.0 / l,
            intercept: 1.0,
        }
    } else {
        Line::constant(1.0)
    };
    Relaxation::Affine { lower, upper }
}

fn abs_interval(b: &[Bound]) -> Bound {
    let Bound { lower: l, upper: u } = b[0];
    if l >= 0.0 {
        Bound::new(l, u)
    } else if u <= 0.0 {
        Bound::new(-u, -l)
    } else {
        Bound::new(0.0, (-l).max(u))
    }
}

fn abs_relaxation(b: &[Bound], _: ReluLowerRelaxation) -> Relaxation {
    let Bound { lower: l, upper: u } = b[0];
    if l >= 0.0 {
        return Relaxation::Affine {
            lower: Line::IDENTITY,
            upper: Line::IDENTITY,
        };
    }
    if u <= 0.0 {
        let negate = Line {
            slope: -1.0,
            intercept: 0.0,
        };
        return Relaxation::Affine {
            lower: negate,
            upper: negate,
        };
    }
    let upper = if l.is_finite() && u.is_finite() {
        let slope = (u + l) / (u - l);
        Line::through(slope, u, u)
    } else {
        Line::constant(f64::INFINITY)
    };
    Relaxation::Affine {
        lower: Line::constant(0.0),
        upper,
    }
}

fn max_interval(b: &[Bound]) -> Bound {
    b.iter().fold(
        Bound::concrete(f64::NEG_INFINITY),
        |acc, s| Bound {
            lower: acc.lower.max(s.lower),
            upper: acc.upper.max(s.upper),
        },
    )
}

fn max_relaxation(b: &[Bound], _: ReluLowerRelaxation) -> Relaxation {
    let Some((best, best_bound)) = b
        .iter()
        .enumerate()
        .max_by(|(_, x), (_, y)| x.lower.total_cmp(&y.lower))
    else {
        return Relaxation::Affine {
            lower: Line::constant(f64::NEG_INFINITY),
            upper: Line::constant(f64::NEG_INFINITY),
        };
    };
    let dominates = b
        .iter()
        .enumerate()
        .all(|(i, other)| i == best || other.upper <= best_bound.lower);
    if dominates {
        return Relaxation::Select(best);
    }
    Relaxation::Dominated {
        lower_source: best,
        upper: max_interval(b).upper,
    }
}
