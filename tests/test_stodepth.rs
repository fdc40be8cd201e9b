//! Stochastic-depth scheduling across training steps.

use blocknet::graph::{Graph, GraphBuilder};
use blocknet::layers::{ActivationKind, CostKind, FusionOp, LayerImpl};
use blocknet::StochasticDepth;

fn residual(seed: u64) -> Graph {
    let mut b = GraphBuilder::new().with_seed(seed);
    b.add_input("data", 8, 1, 4, 4).unwrap();
    b.add_convolution("trunk", "data", 8, 3, 1, 1).unwrap();
    b.add_activation("branch", "trunk", ActivationKind::Relu, 0.0).unwrap();
    b.add_fusion("join", FusionOp::Add, "trunk", "branch").unwrap();
    b.add_cost("cost", "join", CostKind::MeanSquaredError).unwrap();
    b.build().unwrap()
}

/// The mean realized scale (1/p on survival, 0 on drop) converges to 1, so
/// the expected branch contribution is unbiased.
#[test]
fn test_realized_scale_expectation_is_one() {
    let mut g = residual(1);
    let join = g.find("join").unwrap();
    let mut sd = StochasticDepth::new(0.3, true, 42);

    let steps = 4000;
    let mut total = 0.0f64;
    for _ in 0..steps {
        sd.schedule(&mut g);
        let scale = match g.op(join) {
            LayerImpl::Fusion(f) => {
                if f.alive(1) {
                    1.0 / f.survival(1) as f64
                } else {
                    0.0
                }
            }
            _ => unreachable!(),
        };
        total += scale;
    }
    let mean = total / steps as f64;
    assert!((mean - 1.0).abs() < 0.05, "mean realized scale {}", mean);
}

/// Dropping flags exactly the branch feeding the second input, never the
/// shared trunk.
#[test]
fn test_drop_flags_only_the_branch() {
    let mut g = residual(2);
    let (trunk, branch, join) = (
        g.find("trunk").unwrap(),
        g.find("branch").unwrap(),
        g.find("join").unwrap(),
    );
    let mut sd = StochasticDepth::new(0.5, true, 7);

    let mut saw_drop = false;
    for _ in 0..64 {
        sd.schedule(&mut g);
        let dropped = match g.op(join) {
            LayerImpl::Fusion(f) => !f.alive(1),
            _ => unreachable!(),
        };
        assert!(!g.base(trunk).skip, "shared trunk must never be skipped");
        assert_eq!(g.base(branch).skip, dropped);
        saw_drop |= dropped;
    }
    assert!(saw_drop, "with drop rate 0.5, 64 steps must drop at least once");
}

/// `clear` restores full depth for inference: no skips, unit scales, and a
/// forward pass that matches an untouched graph.
#[test]
fn test_clear_restores_full_depth() {
    let mut g = residual(3);
    g.set_batch_size(2).unwrap();
    let input: Vec<f32> = (0..2 * 8 * 4 * 4).map(|i| (i % 7) as f32 * 0.1).collect();
    g.set_input(&input);
    g.set_targets(&vec![0.0f32; 2 * 8 * 4 * 4]);

    g.forward_prop(false);
    let reference = g.loss();

    let mut sd = StochasticDepth::new(0.9, true, 5);
    // Schedule until at least one drop happened, then clear.
    for _ in 0..32 {
        sd.schedule(&mut g);
    }
    sd.clear(&mut g);

    for i in 0..g.len() {
        assert!(!g.base(i).skip);
    }
    g.forward_prop(false);
    assert!((g.loss() - reference).abs() <= 1e-6);
}

/// Linear decay drops deeper connections more aggressively.
#[test]
fn test_linear_decay_orders_probabilities() {
    let sd = StochasticDepth::new(0.4, false, 1);
    let n = 5;
    let mut prev = 1.0f32;
    for k in 0..n {
        let p = sd.survival_probability(k, n);
        assert!(p < prev, "survival must strictly decrease with depth");
        assert!(p > 0.0);
        prev = p;
    }
    assert!((sd.survival_probability(n - 1, n) - 0.6).abs() < 1e-6);
}
