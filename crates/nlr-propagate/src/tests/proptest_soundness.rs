//! Property-based soundness tests for the propagation passes and the
//! structural operations.
//!
//! Networks are random `Input -> (WS -> activation)* -> WS` chains; inputs
//! are sampled from the propagated box and evaluated concretely. A small
//! tolerance (`FP_TOLERANCE`) absorbs floating-point rounding.

use super::*;
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use rand::Rng;
use std::collections::BTreeSet;

/// Strategy to generate valid interval bounds [lower, upper] where lower <= upper.
fn valid_interval(range: f64) -> impl Strategy<Value = (f64, f64)> {
    (-range..range).prop_flat_map(move |a| (-range..range).prop_map(move |b| (a.min(b), a.max(b))))
}

fn activation() -> impl Strategy<Value = LayerType> {
    prop_oneof![
        Just(LayerType::Relu),
        Just(LayerType::AbsoluteValue),
        Just(LayerType::Sign),
        Just(LayerType::Max),
        Just(LayerType::Sigmoid),
    ]
}

/// Input box plus hidden/output widths.
fn shape() -> impl Strategy<Value = (Vec<(f64, f64)>, Vec<usize>)> {
    (1usize..4).prop_flat_map(|n| {
        (
            prop::collection::vec(valid_interval(2.0), n),
            prop::collection::vec(1usize..5, 1..4),
        )
    })
}

fn build(seed: u64, input: &[(f64, f64)], hidden: &[usize], kind: LayerType) -> NetworkLevelReasoner {
    let mut widths = vec![input.len()];
    widths.extend_from_slice(hidden);
    widths.push(1);
    random_network(seed, &widths, kind)
}

fn check_samples(nlr: &NetworkLevelReasoner, inputs: &[Bound], seed: u64) -> std::result::Result<(), TestCaseError> {
    let mut rng = StdRng::seed_from_u64(seed);
    for _ in 0..20 {
        let x = sample_input(&mut rng, inputs);
        let values = nlr.graph().evaluate_all(&x).unwrap();
        check_contains(nlr.graph(), &values).map_err(TestCaseError::fail)?;
    }
    Ok(())
}

fn assert_not_looser(
    before: &BTreeMap<NeuronIndex, Bound>,
    after: &BTreeMap<NeuronIndex, Bound>,
) -> std::result::Result<(), TestCaseError> {
    for (neuron, b) in before {
        let a = after[neuron];
        prop_assert!(
            a.lower >= b.lower && a.upper <= b.upper,
            "bound of {} widened from [{}, {}] to [{}, {}]",
            neuron, b.lower, b.upper, a.lower, a.upper
        );
    }
    Ok(())
}

// =============================================================================
// PROPAGATION SOUNDNESS
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Every concrete execution stays inside the interval bounds.
    #[test]
    fn soundness_interval(seed in any::<u64>(), (input, hidden) in shape(), kind in activation()) {
        let mut nlr = build(seed, &input, &hidden, kind);
        let inputs = input_box(&input);
        nlr.obtain_current_bounds(&inputs).unwrap();
        nlr.interval_arithmetic_bound_propagation().unwrap();
        check_samples(&nlr, &inputs, seed)?;
    }

    /// Symbolic bounds are sound for both lower ReLU relaxations.
    #[test]
    fn soundness_symbolic(
        seed in any::<u64>(),
        (input, hidden) in shape(),
        kind in activation(),
        adaptive in any::<bool>(),
    ) {
        let mut nlr = build(seed, &input, &hidden, kind);
        if adaptive {
            nlr.set_config(PropagationConfig {
                relu_lower_relaxation: ReluLowerRelaxation::Adaptive,
                ..Default::default()
            });
        }
        let inputs = input_box(&input);
        nlr.obtain_current_bounds(&inputs).unwrap();
        nlr.symbolic_bound_propagation().unwrap();
        check_samples(&nlr, &inputs, seed)?;
    }

    /// Back-substituted bounds are sound, and running them after the
    /// forward passes never widens a bound.
    #[test]
    fn soundness_deep_poly(seed in any::<u64>(), (input, hidden) in shape(), kind in activation()) {
        let mut nlr = build(seed, &input, &hidden, kind);
        let inputs = input_box(&input);
        nlr.obtain_current_bounds(&inputs).unwrap();
        nlr.deep_poly_propagation().unwrap();
        check_samples(&nlr, &inputs, seed)?;

        nlr.interval_arithmetic_bound_propagation().unwrap();
        nlr.symbolic_bound_propagation().unwrap();
        let before = snapshot(nlr.graph());
        nlr.deep_poly_propagation().unwrap();
        assert_not_looser(&before, &snapshot(nlr.graph()))?;
        check_samples(&nlr, &inputs, seed)?;
    }

    /// Iterated passes never widen a bound.
    #[test]
    fn monotonic_tightening(seed in any::<u64>(), (input, hidden) in shape(), kind in activation()) {
        let mut nlr = build(seed, &input, &hidden, kind);
        nlr.obtain_current_bounds(&input_box(&input)).unwrap();
        let mut before = snapshot(nlr.graph());
        for step in 0..4 {
            if step % 2 == 0 {
                nlr.interval_arithmetic_bound_propagation().unwrap();
            } else {
                nlr.symbolic_bound_propagation().unwrap();
            }
            let after = snapshot(nlr.graph());
            assert_not_looser(&before, &after)?;
            before = after;
        }
        nlr.iterative_propagation(None).unwrap();
        assert_not_looser(&before, &snapshot(nlr.graph()))?;
    }
}

// =============================================================================
// ELIMINATION AND MERGING
// =============================================================================

/// `Input(n) -> WS(h) -> WS(k) -> RELU(k)` with random weights.
fn affine_chain(seed: u64, n: usize, h: usize, k: usize) -> NetworkLevelReasoner {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut nlr = NetworkLevelReasoner::new();
    nlr.add_layer(0, LayerType::Input, n).unwrap();
    nlr.add_layer(1, LayerType::WeightedSum, h).unwrap();
    nlr.add_layer(2, LayerType::WeightedSum, k).unwrap();
    nlr.add_layer(3, LayerType::Relu, k).unwrap();
    nlr.add_layer_dependency(0, 1).unwrap();
    nlr.add_layer_dependency(1, 2).unwrap();
    for (source, target, rows, cols) in [(0, 1, n, h), (1, 2, h, k)] {
        for j in 0..cols {
            for i in 0..rows {
                nlr.set_weight(source, i, target, j, rng.random_range(-2.0..2.0))
                    .unwrap();
            }
            nlr.set_bias(target, j, rng.random_range(-1.0..1.0)).unwrap();
        }
    }
    for j in 0..k {
        nlr.add_activation_source(2, j, 3, j).unwrap();
    }
    let mut variable = 0;
    for (layer, size) in [(0, n), (1, h), (2, k), (3, k)] {
        for neuron in 0..size {
            nlr.set_neuron_variable(NeuronIndex::new(layer, neuron), variable)
                .unwrap();
            variable += 1;
        }
    }
    nlr
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Eliminating an input variable to `v` gives the same bounds as
    /// restricting its domain to `{v}`.
    #[test]
    fn elimination_of_input_equals_point_domain(
        seed in any::<u64>(),
        (input, hidden) in shape(),
        kind in activation(),
        pick in any::<prop::sample::Index>(),
        t in 0.0f64..=1.0,
    ) {
        let k = pick.index(input.len());
        let (l, u) = input[k];
        let v = l + (u - l) * t;

        let mut eliminated = build(seed, &input, &hidden, kind);
        eliminated.obtain_current_bounds(&input_box(&input)).unwrap();
        eliminated.eliminate_variable(k, v).unwrap();
        eliminated.interval_arithmetic_bound_propagation().unwrap();

        let mut restricted = build(seed, &input, &hidden, kind);
        let mut point = input.clone();
        point[k] = (v, v);
        restricted.obtain_current_bounds(&input_box(&point)).unwrap();
        restricted.interval_arithmetic_bound_propagation().unwrap();

        prop_assert_eq!(snapshot(eliminated.graph()), snapshot(restricted.graph()));
    }

    /// A value outside the current interval is rejected and changes nothing.
    #[test]
    fn elimination_outside_domain_is_rejected(
        seed in any::<u64>(),
        (input, hidden) in shape(),
        pick in any::<prop::sample::Index>(),
        offset in 1e-6f64..10.0,
        above in any::<bool>(),
    ) {
        let k = pick.index(input.len());
        let (l, u) = input[k];
        let v = if above { u + offset } else { l - offset };

        let mut nlr = build(seed, &input, &hidden, LayerType::Relu);
        nlr.obtain_current_bounds(&input_box(&input)).unwrap();
        nlr.interval_arithmetic_bound_propagation().unwrap();
        let before = snapshot(nlr.graph());
        let logged = nlr.constraint_tightenings().len();

        let err = nlr.eliminate_variable(k, v).unwrap_err();
        prop_assert!(err.is_infeasibility());
        prop_assert!(!nlr.layer(0).unwrap().neuron_eliminated(k));
        prop_assert_eq!(snapshot(nlr.graph()), before);
        prop_assert_eq!(nlr.constraint_tightenings().len(), logged);
    }

    /// Same for a hidden weighted-sum neuron fixed to a reachable value.
    #[test]
    fn elimination_of_hidden_neuron_equals_point_domain(
        seed in any::<u64>(),
        (input, hidden) in shape(),
        kind in activation(),
        pick in any::<prop::sample::Index>(),
    ) {
        let template = build(seed, &input, &hidden, kind);
        let neuron = NeuronIndex::new(1, pick.index(hidden[0]));
        let variable = template.layer(1).unwrap().neuron_to_variable(neuron.neuron).unwrap();
        let midpoint: Vec<f64> = input.iter().map(|&(l, u)| 0.5 * (l + u)).collect();
        let v = template.graph().evaluate_all(&midpoint).unwrap()[&1][neuron.neuron];

        let mut eliminated = template.clone();
        eliminated.obtain_current_bounds(&input_box(&input)).unwrap();
        eliminated.eliminate_variable(variable, v).unwrap();
        eliminated.interval_arithmetic_bound_propagation().unwrap();

        let mut restricted = template;
        let mut store = input_box(&input);
        store.resize(variable + 1, Bound::unbounded());
        store[variable] = Bound::concrete(v);
        restricted.obtain_current_bounds(&store).unwrap();
        restricted.interval_arithmetic_bound_propagation().unwrap();

        prop_assert_eq!(snapshot(eliminated.graph()), snapshot(restricted.graph()));
    }

    /// Merging consecutive affine layers preserves the network function and
    /// reports each removed neuron as a correct affine expression.
    #[test]
    fn merge_preserves_outputs(seed in any::<u64>(), n in 1usize..4, h in 1usize..5, k in 1usize..4) {
        let original = affine_chain(seed, n, h, k);
        let mut merged = original.clone();
        let mut eliminated = BTreeMap::new();
        let none = BTreeMap::new();
        let merges = merged
            .merge_consecutive_ws_layers(&none, &none, &BTreeSet::new(), &mut eliminated)
            .unwrap();
        prop_assert_eq!(merges, 1);
        prop_assert_eq!(merged.number_of_layers(), 3);
        prop_assert_eq!(eliminated.len(), h);

        let mut rng = StdRng::seed_from_u64(seed ^ 0x5eed);
        for _ in 0..10 {
            let x: Vec<f64> = (0..n).map(|_| rng.random_range(-3.0..3.0)).collect();
            let expected = original.graph().evaluate_all(&x).unwrap();
            let actual = merged.evaluate(&x).unwrap();
            for (a, e) in actual.iter().zip(&expected[&3]) {
                prop_assert!((a - e).abs() < 1e-6, "merged {} vs {}", a, e);
            }
            let assignment: BTreeMap<Variable, f64> = x.iter().copied().enumerate().collect();
            for (variable, expression) in &eliminated {
                let value = expression.evaluate(&assignment).unwrap();
                let reference = expected[&1][variable - n];
                prop_assert!((value - reference).abs() < 1e-6);
            }
        }
    }
}

// =============================================================================
// REDUCTION SOUNDNESS
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Fixed neurons were certified by their bounds, and the reduced network
    /// agrees with the original on every input in the box.
    #[test]
    fn reduction_is_sound(
        seed in any::<u64>(),
        (input, hidden) in shape(),
        kind in prop_oneof![Just(LayerType::Relu), Just(LayerType::AbsoluteValue), Just(LayerType::Sign)],
        rate in 0.0f64..=1.0,
    ) {
        let original = build(seed, &input, &hidden, kind);
        let mut reduced = original.clone();
        let mut query = original.generate_query().unwrap();
        for (v, &(l, u)) in input.iter().enumerate() {
            query.set_lower_bound(v, l);
            query.set_upper_bound(v, u);
        }
        let report = NetworkReducer::reduce_in_place(&mut reduced, &mut query, rate).unwrap();
        prop_assert_eq!(
            report.selected.len(),
            report.fixed_active.len() + report.fixed_inactive.len() + report.skipped.len()
        );

        let source_of = |neuron: NeuronIndex| {
            reduced.layer(neuron.layer).unwrap().activation_sources(neuron.neuron)[0]
        };
        for &neuron in &report.fixed_inactive {
            let b = reduced.graph().bound(source_of(neuron)).unwrap();
            prop_assert!(b.upper <= 0.0);
        }
        for &neuron in &report.fixed_active {
            let b = reduced.graph().bound(source_of(neuron)).unwrap();
            prop_assert!(b.lower >= 0.0);
        }
        for &neuron in &report.skipped {
            let b = reduced.graph().bound(source_of(neuron)).unwrap();
            prop_assert!(b.lower < 0.0 && b.upper > 0.0 || kind == LayerType::Sign);
        }

        let inputs = input_box(&input);
        let mut rng = StdRng::seed_from_u64(seed.wrapping_add(1));
        for _ in 0..20 {
            let x = sample_input(&mut rng, &inputs);
            let expected = original.graph().evaluate_all(&x).unwrap();
            let actual = reduced.graph().evaluate_all(&x).unwrap();
            for &neuron in report.fixed_active.iter().chain(&report.fixed_inactive) {
                let e = expected[&neuron.layer][neuron.neuron];
                let a = actual[&neuron.layer][neuron.neuron];
                prop_assert!((a - e).abs() < FP_TOLERANCE, "{} fixed to {} but evaluates to {}", neuron, a, e);
            }
        }
    }
}
