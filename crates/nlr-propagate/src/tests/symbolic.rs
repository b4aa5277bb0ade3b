//! Symbolic propagation tests

use super::*;

fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < FP_TOLERANCE,
        "expected {expected}, got {actual}"
    );
}

/// x in [-1, 1]; a = x, b = x; y = a - b.
fn cancellation_net() -> NetworkLevelReasoner {
    let mut nlr = NetworkLevelReasoner::new();
    nlr.add_layer(0, LayerType::Input, 1).unwrap();
    nlr.add_layer(1, LayerType::WeightedSum, 2).unwrap();
    nlr.add_layer(2, LayerType::WeightedSum, 1).unwrap();
    nlr.add_layer_dependency(0, 1).unwrap();
    nlr.add_layer_dependency(1, 2).unwrap();
    nlr.set_weight(0, 0, 1, 0, 1.0).unwrap();
    nlr.set_weight(0, 0, 1, 1, 1.0).unwrap();
    nlr.set_weight(1, 0, 2, 0, 1.0).unwrap();
    nlr.set_weight(1, 1, 2, 0, -1.0).unwrap();
    nlr.set_neuron_variable(NeuronIndex::new(0, 0), 0).unwrap();
    nlr.obtain_current_bounds(&input_box(&[(-1.0, 1.0)])).unwrap();
    nlr
}

#[test]
fn test_symbolic_cancels_correlated_terms() {
    let mut interval = cancellation_net();
    interval.interval_arithmetic_bound_propagation().unwrap();
    assert_eq!(interval.layer(2).unwrap().bound(0), Bound::new(-2.0, 2.0));

    let mut symbolic = cancellation_net();
    symbolic.symbolic_bound_propagation().unwrap();
    assert_eq!(symbolic.layer(2).unwrap().bound(0), Bound::concrete(0.0));

    let expressions = symbolic.layer(2).unwrap().symbolic_bounds().unwrap();
    assert_eq!(expressions.num_outputs(), 1);
    assert_eq!(expressions.num_inputs(), 1);
    assert_eq!(expressions.lower_a[[0, 0]], 0.0);
    assert_eq!(expressions.upper_a[[0, 0]], 0.0);
}

#[test]
fn test_symbolic_ignores_unbound_neurons_in_log() {
    let mut nlr = cancellation_net();
    let updated = nlr.symbolic_bound_propagation().unwrap();
    // Three hidden/output neurons, both sides; none bound to a variable.
    assert_eq!(updated, 6);
    assert!(nlr.constraint_tightenings().is_empty());
}

/// x in `input`; a = x; r = relu(a); y = r - 0.5 a.
fn relu_net(input: (f64, f64), config: PropagationConfig) -> NetworkLevelReasoner {
    let mut nlr = NetworkLevelReasoner::with_config(config);
    nlr.add_layer(0, LayerType::Input, 1).unwrap();
    nlr.add_layer(1, LayerType::WeightedSum, 1).unwrap();
    nlr.add_layer(2, LayerType::Relu, 1).unwrap();
    nlr.add_layer(3, LayerType::WeightedSum, 1).unwrap();
    nlr.add_layer_dependency(0, 1).unwrap();
    nlr.add_layer_dependency(1, 3).unwrap();
    nlr.add_layer_dependency(2, 3).unwrap();
    nlr.set_weight(0, 0, 1, 0, 1.0).unwrap();
    nlr.add_activation_source(1, 0, 2, 0).unwrap();
    nlr.set_weight(2, 0, 3, 0, 1.0).unwrap();
    nlr.set_weight(1, 0, 3, 0, -0.5).unwrap();
    for (layer, variable) in [(0, 0), (1, 1), (2, 2), (3, 3)] {
        nlr.set_neuron_variable(NeuronIndex::new(layer, 0), variable)
            .unwrap();
    }
    nlr.obtain_current_bounds(&input_box(&[input])).unwrap();
    nlr
}

#[test]
fn test_relu_triangle_relaxation() {
    let mut nlr = relu_net((-1.0, 1.0), PropagationConfig::default());
    nlr.symbolic_bound_propagation().unwrap();

    let relu = nlr.layer(2).unwrap();
    assert_eq!(relu.bound(0), Bound::new(0.0, 1.0));
    let expressions = relu.symbolic_bounds().unwrap();
    assert_close(expressions.upper_a[[0, 0]], 0.5);
    assert_close(expressions.upper_b[0], 0.5);
    assert_eq!(expressions.lower_a[[0, 0]], 0.0);

    // Upper: 0.5x + 0.5 - 0.5x; lower: -0.5x.
    let y = nlr.layer(3).unwrap().bound(0);
    assert_close(y.lower, -0.5);
    assert_close(y.upper, 0.5);

    let mut interval = relu_net((-1.0, 1.0), PropagationConfig::default());
    interval.interval_arithmetic_bound_propagation().unwrap();
    assert_eq!(interval.layer(3).unwrap().bound(0), Bound::new(-0.5, 1.5));
}

#[test]
fn test_adaptive_lower_relaxation() {
    let mut zero = relu_net((-1.0, 2.0), PropagationConfig::default());
    zero.symbolic_bound_propagation().unwrap();
    assert_close(zero.layer(3).unwrap().lb(0), -1.0);

    let adaptive_config = PropagationConfig {
        relu_lower_relaxation: ReluLowerRelaxation::Adaptive,
        ..Default::default()
    };
    let mut adaptive = relu_net((-1.0, 2.0), adaptive_config.clone());
    adaptive.symbolic_bound_propagation().unwrap();
    let y = adaptive.layer(3).unwrap().bound(0);
    assert_close(y.lower, -0.5);
    assert_close(y.upper, 1.0);

    // u <= -l keeps the zero line.
    let mut narrow = relu_net((-2.0, 1.0), adaptive_config);
    narrow.symbolic_bound_propagation().unwrap();
    let expressions = narrow.layer(2).unwrap().symbolic_bounds().unwrap();
    assert_eq!(expressions.lower_a[[0, 0]], 0.0);
}

#[test]
fn test_phase_fixed_neuron_uses_its_line() {
    let mut nlr = relu_net((-1.0, 2.0), PropagationConfig::default());
    nlr.fix_neuron_phase(NeuronIndex::new(2, 0), Phase::Active)
        .unwrap();
    nlr.symbolic_bound_propagation().unwrap();
    // r = a exactly, so y = 0.5x.
    let y = nlr.layer(3).unwrap().bound(0);
    assert_close(y.lower, -0.5);
    assert_close(y.upper, 1.0);
}

#[test]
fn test_eliminated_neuron_is_constant() {
    let mut nlr = relu_net((-1.0, 1.0), PropagationConfig::default());
    nlr.eliminate_variable(2, 0.25).unwrap();
    nlr.symbolic_bound_propagation().unwrap();
    let expressions = nlr.layer(2).unwrap().symbolic_bounds().unwrap();
    assert_eq!(expressions.lower_a[[0, 0]], 0.0);
    assert_eq!(expressions.lower_b[0], 0.25);
    let y = nlr.layer(3).unwrap().bound(0);
    assert_close(y.lower, -0.25);
    assert_close(y.upper, 0.75);
}

#[test]
fn test_max_with_dominating_source_is_exact() {
    // m = max(x0, x1) with x0 in [2, 3] above x1 in [0, 1]; z = m - x0.
    let mut nlr = NetworkLevelReasoner::new();
    nlr.add_layer(0, LayerType::Input, 2).unwrap();
    nlr.add_layer(1, LayerType::Max, 1).unwrap();
    nlr.add_layer(2, LayerType::WeightedSum, 1).unwrap();
    nlr.add_activation_source(0, 0, 1, 0).unwrap();
    nlr.add_activation_source(0, 1, 1, 0).unwrap();
    nlr.add_layer_dependency(0, 2).unwrap();
    nlr.add_layer_dependency(1, 2).unwrap();
    nlr.set_weight(1, 0, 2, 0, 1.0).unwrap();
    nlr.set_weight(0, 0, 2, 0, -1.0).unwrap();
    nlr.set_neuron_variable(NeuronIndex::new(0, 0), 0).unwrap();
    nlr.set_neuron_variable(NeuronIndex::new(0, 1), 1).unwrap();
    nlr.obtain_current_bounds(&input_box(&[(2.0, 3.0), (0.0, 1.0)]))
        .unwrap();

    let mut interval = nlr.clone();
    interval.interval_arithmetic_bound_propagation().unwrap();
    assert_eq!(interval.layer(2).unwrap().bound(0), Bound::new(-1.0, 1.0));

    nlr.symbolic_bound_propagation().unwrap();
    assert_eq!(nlr.layer(1).unwrap().bound(0), Bound::new(2.0, 3.0));
    assert_eq!(nlr.layer(2).unwrap().bound(0), Bound::concrete(0.0));
}

#[test]
fn test_symbolic_never_looser_than_interval_on_random_networks() {
    for seed in 0..8 {
        let mut nlr = random_network(seed, &[3, 4, 4, 2], LayerType::Relu);
        let inputs = input_box(&[(-1.0, 1.0), (-0.5, 0.5), (0.0, 2.0)]);
        nlr.obtain_current_bounds(&inputs).unwrap();
        nlr.interval_arithmetic_bound_propagation().unwrap();
        let before = snapshot(nlr.graph());
        nlr.symbolic_bound_propagation().unwrap();
        for (neuron, after) in snapshot(nlr.graph()) {
            let b = before[&neuron];
            assert!(after.lower >= b.lower && after.upper <= b.upper, "seed {seed} {neuron}");
        }
    }
}
