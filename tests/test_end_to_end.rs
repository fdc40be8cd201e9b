//! End-to-end training behavior on a small convolutional graph.

use std::fs::File;

use blocknet::graph::{Graph, GraphBuilder};
use blocknet::layers::{ActivationKind, CostKind};
use blocknet::optimizers::Adam;
use blocknet::utils::SimpleRng;

fn conv_graph(seed: u64) -> Graph {
    let mut b = GraphBuilder::new().with_seed(seed);
    b.add_input("data", 3, 1, 8, 8).unwrap();
    b.add_convolution("conv", "data", 8, 3, 1, 1).unwrap();
    b.add_batchnorm_activation("bn", "conv", Some(ActivationKind::Relu), 0.0).unwrap();
    b.add_cost("cost", "bn", CostKind::MeanSquaredError).unwrap();
    b.build().unwrap()
}

fn batch_data(batch: usize, seed: u64) -> (Vec<f32>, Vec<f32>) {
    let mut rng = SimpleRng::new(seed);
    let input: Vec<f32> = (0..batch * 3 * 8 * 8)
        .map(|_| rng.gen_range_f32(-1.0, 1.0))
        .collect();
    let targets = vec![0.25f32; batch * 8 * 8 * 8];
    (input, targets)
}

/// Fixed seed, batch 4: one step produces a finite loss and finite gradients
/// everywhere.
#[test]
fn test_single_step_is_finite() {
    let mut g = conv_graph(77);
    g.set_batch_size(4).unwrap();
    let (input, targets) = batch_data(4, 1);
    g.set_input(&input);
    g.set_targets(&targets);

    g.forward_prop(true);
    g.backward_prop();

    assert!(g.loss().is_finite());
    for i in 0..g.len() {
        let base = g.base(i);
        assert!(
            base.neurons.as_slice().iter().all(|v| v.is_finite()),
            "non-finite activation in `{}`",
            base.name
        );
        assert!(
            base.neurons_d1.as_slice().iter().all(|v| v.is_finite()),
            "non-finite gradient in `{}`",
            base.name
        );
    }
}

/// Training on a fixed batch drives the loss down.
#[test]
fn test_loss_decreases_under_training() {
    let mut g = conv_graph(5);
    g.set_batch_size(4).unwrap();
    let (input, targets) = batch_data(4, 2);
    g.set_input(&input);
    g.set_targets(&targets);

    let mut opt = Adam::with_defaults(1e-2);
    g.forward_prop(true);
    let initial = g.loss();
    g.backward_prop();
    g.update_weights(&mut opt);

    for _ in 0..30 {
        g.forward_prop(true);
        g.backward_prop();
        g.update_weights(&mut opt);
    }
    g.forward_prop(false);
    let trained = g.loss();
    assert!(
        trained < initial,
        "loss did not improve: {} -> {}",
        initial,
        trained
    );
}

/// Two identical runs from the same seed produce bit-identical losses.
#[test]
fn test_training_is_deterministic() {
    let run = || {
        let mut g = conv_graph(123);
        g.set_batch_size(2).unwrap();
        let (input, targets) = batch_data(2, 3);
        g.set_input(&input);
        g.set_targets(&targets);
        let mut opt = Adam::with_defaults(1e-3);
        for _ in 0..5 {
            g.forward_prop(true);
            g.backward_prop();
            g.update_weights(&mut opt);
        }
        g.forward_prop(false);
        g.loss()
    };
    assert_eq!(run(), run());
}

/// Saved parameters restore a different instance to identical behavior.
#[test]
fn test_save_load_round_trip() {
    let mut trained = conv_graph(40);
    trained.set_batch_size(2).unwrap();
    let (input, targets) = batch_data(2, 4);
    trained.set_input(&input);
    trained.set_targets(&targets);
    let mut opt = Adam::with_defaults(1e-3);
    for _ in 0..3 {
        trained.forward_prop(true);
        trained.backward_prop();
        trained.update_weights(&mut opt);
    }
    trained.forward_prop(false);
    let reference = trained.loss();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("weights.bin");
    trained.save(&mut File::create(&path).unwrap()).unwrap();

    // Different seed: fresh weights differ until loaded.
    let mut restored = conv_graph(41);
    restored.set_batch_size(2).unwrap();
    restored.set_input(&input);
    restored.set_targets(&targets);
    restored.load(&mut File::open(&path).unwrap()).unwrap();
    restored.forward_prop(false);
    assert_eq!(restored.loss(), reference);
}

/// A resolution change reshapes a dense layer's fan-in; gradients must still
/// propagate below the dense layer afterwards (redrawn weights, not zeros).
#[test]
fn test_resolution_change_through_dense_keeps_training() {
    let mut b = GraphBuilder::new().with_seed(21);
    b.add_input("data", 3, 1, 6, 6).unwrap();
    b.add_convolution("conv", "data", 8, 3, 1, 1).unwrap();
    b.add_dense("fc", "conv", 5).unwrap();
    b.add_cost("cost", "fc", CostKind::MeanSquaredError).unwrap();
    let mut g = b.build().unwrap();

    g.set_batch_size(2).unwrap();
    let mut rng = SimpleRng::new(10);
    let input: Vec<f32> = (0..2 * 3 * 6 * 6)
        .map(|_| rng.gen_range_f32(-1.0, 1.0))
        .collect();
    g.set_input(&input);
    g.set_targets(&vec![0.5f32; 2 * 5]);

    let mut opt = Adam::with_defaults(1e-2);
    for _ in 0..3 {
        g.forward_prop(true);
        g.backward_prop();
        g.update_weights(&mut opt);
    }

    g.set_resolution(10, 10).unwrap();
    let input: Vec<f32> = (0..2 * 3 * 10 * 10)
        .map(|_| rng.gen_range_f32(-1.0, 1.0))
        .collect();
    g.set_input(&input);
    g.set_targets(&vec![0.5f32; 2 * 5]);
    g.forward_prop(true);
    g.backward_prop();

    let conv = g.find("conv").unwrap();
    let below = g.base(conv).neurons_d1.as_slice();
    assert!(below.iter().all(|v| v.is_finite()));
    assert!(
        below.iter().any(|&v| v != 0.0),
        "no gradient reaches the layer below the reshaped dense layer"
    );

    // The same optimizer keeps working across the reshape.
    g.update_weights(&mut opt);
    g.forward_prop(false);
    assert!(g.loss().is_finite());
}

/// Resolution changes re-derive every downstream shape and keep the graph
/// runnable.
#[test]
fn test_resolution_change() {
    let mut g = conv_graph(50);
    g.set_batch_size(2).unwrap();
    g.set_resolution(12, 12).unwrap();

    let bn = g.find("bn").unwrap();
    assert_eq!((g.base(bn).h, g.base(bn).w), (12, 12));

    let mut rng = SimpleRng::new(6);
    let input: Vec<f32> = (0..2 * 3 * 12 * 12)
        .map(|_| rng.gen_range_f32(-1.0, 1.0))
        .collect();
    g.set_input(&input);
    g.set_targets(&vec![0.0f32; 2 * 8 * 12 * 12]);
    g.forward_prop(true);
    g.backward_prop();
    assert!(g.loss().is_finite());
}
