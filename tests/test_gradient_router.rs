//! Gradient accumulation under fan-out.
//!
//! A producer with two consumers must end the backward pass holding the sum
//! of both consumers' contributions, for batch sizes 1 and larger.

use blocknet::graph::{Graph, GraphBuilder};
use blocknet::layers::{ActivationKind, CostKind, FusionOp};

/// data -> conv ("c") feeding both an activation and a fusion layer:
/// join = Add(c, relu(c)) -> cost. "c" has fan-out 2.
fn fan_out_graph(seed: u64) -> Graph {
    let mut b = GraphBuilder::new().with_seed(seed);
    b.add_input("data", 4, 1, 6, 6).unwrap();
    b.add_convolution("c", "data", 8, 3, 1, 1).unwrap();
    b.add_activation("a", "c", ActivationKind::Relu, 0.0).unwrap();
    b.add_fusion("join", FusionOp::Add, "c", "a").unwrap();
    b.add_cost("cost", "join", CostKind::MeanSquaredError).unwrap();
    b.build().unwrap()
}

fn run_one(batch: usize) {
    let mut g = fan_out_graph(21);
    g.set_batch_size(batch).unwrap();

    let input: Vec<f32> = (0..batch * 4 * 6 * 6)
        .map(|i| ((i % 17) as f32 - 8.0) * 0.1)
        .collect();
    let targets = vec![0.25f32; batch * 8 * 6 * 6];
    g.set_input(&input);
    g.set_targets(&targets);
    g.forward_prop(true);
    g.backward_prop();

    let c = g.find("c").unwrap();
    let join = g.find("join").unwrap();
    assert!(g.base(join).input_shared[0], "conv edge must be shared");

    // Expected: the fusion layer passes the seed gradient straight through
    // (unit scale), and the relu path adds it again wherever c > 0.
    let c_base = g.base(c);
    let j_base = g.base(join);
    let c_desc = *c_base.desc();
    let j_desc = *j_base.diff_desc();
    for n in 0..batch {
        for ch in 0..c_base.c {
            for h in 0..c_base.h {
                for w in 0..c_base.w {
                    let seed = j_base.neurons_d1.as_slice()[j_desc.offset(n, ch, 0, h, w)];
                    let x = c_base.neurons.as_slice()[c_desc.offset(n, ch, 0, h, w)];
                    let expected = if x > 0.0 { 2.0 * seed } else { seed };
                    let got = c_base.neurons_d1.as_slice()[c_desc.offset(n, ch, 0, h, w)];
                    assert!(
                        (got - expected).abs() <= 1e-5 * (1.0 + expected.abs()),
                        "n={} c={} h={} w={}: got {}, expected {}",
                        n,
                        ch,
                        h,
                        w,
                        got,
                        expected
                    );
                }
            }
        }
    }
}

#[test]
fn test_shared_gradient_sums_batch_one() {
    run_one(1);
}

#[test]
fn test_shared_gradient_sums_batch_four() {
    run_one(4);
}

#[test]
fn test_unshared_consumer_overwrites() {
    let mut g = fan_out_graph(3);
    g.set_batch_size(2).unwrap();
    // "a" has a single consumer, so its edge into the fusion layer must not
    // be flagged for accumulation.
    let join = g.find("join").unwrap();
    assert!(!g.base(join).input_shared[1]);
}
