//! Interval propagation tests

use super::*;

// ============================================================
// WEIGHTED SUM AND RELU
// ============================================================

/// x0, x1 in [-1, 1]; a = x0 + 2 x1 + 1, b = -x0 + x1; r = relu(a, b);
/// y = r0 - r1.
fn small_relu_net() -> NetworkLevelReasoner {
    let mut nlr = NetworkLevelReasoner::new();
    nlr.add_layer(0, LayerType::Input, 2).unwrap();
    nlr.add_layer(1, LayerType::WeightedSum, 2).unwrap();
    nlr.add_layer(2, LayerType::Relu, 2).unwrap();
    nlr.add_layer(3, LayerType::WeightedSum, 1).unwrap();
    nlr.add_layer_dependency(0, 1).unwrap();
    nlr.add_layer_dependency(2, 3).unwrap();
    nlr.set_weight(0, 0, 1, 0, 1.0).unwrap();
    nlr.set_weight(0, 1, 1, 0, 2.0).unwrap();
    nlr.set_bias(1, 0, 1.0).unwrap();
    nlr.set_weight(0, 0, 1, 1, -1.0).unwrap();
    nlr.set_weight(0, 1, 1, 1, 1.0).unwrap();
    nlr.add_activation_source(1, 0, 2, 0).unwrap();
    nlr.add_activation_source(1, 1, 2, 1).unwrap();
    nlr.set_weight(2, 0, 3, 0, 1.0).unwrap();
    nlr.set_weight(2, 1, 3, 0, -1.0).unwrap();
    let mut variable = 0;
    for (layer, size) in [(0, 2), (1, 2), (2, 2), (3, 1)] {
        for neuron in 0..size {
            nlr.set_neuron_variable(NeuronIndex::new(layer, neuron), variable)
                .unwrap();
            variable += 1;
        }
    }
    nlr
}

#[test]
fn test_interval_weighted_sum_and_relu() {
    let mut nlr = small_relu_net();
    nlr.obtain_current_bounds(&input_box(&[(-1.0, 1.0), (-1.0, 1.0)]))
        .unwrap();
    nlr.interval_arithmetic_bound_propagation().unwrap();

    assert_eq!(nlr.layer(1).unwrap().bound(0), Bound::new(-2.0, 4.0));
    assert_eq!(nlr.layer(1).unwrap().bound(1), Bound::new(-2.0, 2.0));
    assert_eq!(nlr.layer(2).unwrap().bound(0), Bound::new(0.0, 4.0));
    assert_eq!(nlr.layer(2).unwrap().bound(1), Bound::new(0.0, 2.0));
    assert_eq!(nlr.layer(3).unwrap().bound(0), Bound::new(-2.0, 4.0));

    // Five non-input neurons, both sides each.
    let tightenings = nlr.constraint_tightenings();
    assert_eq!(tightenings.len(), 10);
    assert!(tightenings.contains(&Tightening::upper(2, 4.0)));
    assert!(tightenings.contains(&Tightening::lower(4, 0.0)));
}

#[test]
fn test_interval_never_widens() {
    let mut nlr = small_relu_net();
    let mut store = input_box(&[(-1.0, 1.0), (-1.0, 1.0)]);
    store.push(Bound::new(-1.0, 3.0));
    nlr.obtain_current_bounds(&store).unwrap();
    nlr.interval_arithmetic_bound_propagation().unwrap();
    assert_eq!(nlr.layer(1).unwrap().bound(0), Bound::new(-1.0, 3.0));
    assert_eq!(nlr.layer(2).unwrap().bound(0), Bound::new(0.0, 3.0));
}

#[test]
fn test_interval_disjoint_bound_is_inconsistency() {
    let mut nlr = small_relu_net();
    let mut store = input_box(&[(-1.0, 1.0), (-1.0, 1.0)]);
    store.push(Bound::new(5.0, 6.0));
    nlr.obtain_current_bounds(&store).unwrap();
    let err = nlr.interval_arithmetic_bound_propagation().unwrap_err();
    assert!(matches!(
        err,
        NlrError::BoundInconsistency { neuron, .. } if neuron == NeuronIndex::new(1, 0)
    ));
}

#[test]
fn test_eliminated_source_contributes_fixed_value() {
    let mut nlr = small_relu_net();
    nlr.obtain_current_bounds(&input_box(&[(-1.0, 1.0), (-1.0, 1.0)]))
        .unwrap();
    nlr.eliminate_variable(1, 0.5).unwrap();
    nlr.interval_arithmetic_bound_propagation().unwrap();
    // a = x0 + 1 + 1 in [1, 3], stable.
    assert_eq!(nlr.layer(1).unwrap().bound(0), Bound::new(1.0, 3.0));
    assert_eq!(nlr.layer(0).unwrap().bound(1), Bound::concrete(0.5));
    assert!(!nlr
        .constraint_tightenings()
        .iter()
        .any(|t| t.variable == 1));
}

// ============================================================
// OTHER ACTIVATIONS
// ============================================================

fn single_activation(kind: LayerType, sources: usize, bounds: &[(f64, f64)]) -> NetworkLevelReasoner {
    let mut nlr = NetworkLevelReasoner::new();
    nlr.add_layer(0, LayerType::Input, sources).unwrap();
    nlr.add_layer(1, kind, 1).unwrap();
    for s in 0..sources {
        nlr.add_activation_source(0, s, 1, 0).unwrap();
        nlr.set_neuron_variable(NeuronIndex::new(0, s), s).unwrap();
    }
    nlr.set_neuron_variable(NeuronIndex::new(1, 0), sources)
        .unwrap();
    nlr.obtain_current_bounds(&input_box(bounds)).unwrap();
    nlr.interval_arithmetic_bound_propagation().unwrap();
    nlr
}

#[test]
fn test_interval_absolute_value() {
    let out = |l, u| {
        single_activation(LayerType::AbsoluteValue, 1, &[(l, u)])
            .layer(1)
            .unwrap()
            .bound(0)
    };
    assert_eq!(out(-3.0, 2.0), Bound::new(0.0, 3.0));
    assert_eq!(out(-3.0, -1.0), Bound::new(1.0, 3.0));
    assert_eq!(out(0.5, 2.0), Bound::new(0.5, 2.0));
}

#[test]
fn test_interval_sign() {
    let out = |l, u| {
        single_activation(LayerType::Sign, 1, &[(l, u)])
            .layer(1)
            .unwrap()
            .bound(0)
    };
    assert_eq!(out(-3.0, 2.0), Bound::new(-1.0, 1.0));
    assert_eq!(out(-3.0, -1.0), Bound::concrete(-1.0));
    assert_eq!(out(0.0, 2.0), Bound::concrete(1.0));
}

#[test]
fn test_interval_max_and_sigmoid() {
    let max = single_activation(LayerType::Max, 3, &[(-1.0, 2.0), (0.5, 1.0), (-4.0, 3.0)]);
    assert_eq!(max.layer(1).unwrap().bound(0), Bound::new(0.5, 3.0));

    let sigmoid = single_activation(LayerType::Sigmoid, 1, &[(0.0, 0.0)]);
    assert_eq!(sigmoid.layer(1).unwrap().bound(0), Bound::concrete(0.5));
}

#[test]
fn test_interval_unbounded_input_with_zero_weight() {
    let mut nlr = small_relu_net();
    nlr.set_weight(0, 1, 1, 1, 0.0).unwrap();
    nlr.obtain_current_bounds(&input_box(&[(-1.0, 1.0)])).unwrap();
    nlr.interval_arithmetic_bound_propagation().unwrap();
    // b = -x0 ignores the unbounded x1 entirely.
    assert_eq!(nlr.layer(1).unwrap().bound(1), Bound::new(-1.0, 1.0));
    let a = nlr.layer(1).unwrap().bound(0);
    assert_eq!(a.lower, f64::NEG_INFINITY);
    assert_eq!(a.upper, f64::INFINITY);
    assert_eq!(nlr.layer(2).unwrap().lb(0), 0.0);
}
