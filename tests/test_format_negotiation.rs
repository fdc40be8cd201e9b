//! Graph-level format negotiation: blocked layouts under the default policy,
//! and numerical agreement with the plain-only reference across every
//! reorder boundary.

use blocknet::graph::{Graph, GraphBuilder};
use blocknet::layers::{ActivationKind, CostKind, FusionOp};
use blocknet::utils::SimpleRng;
use blocknet::{FormatPolicy, MemoryFormat};

fn residual(policy: FormatPolicy, seed: u64) -> Graph {
    let mut b = GraphBuilder::new().with_policy(policy).with_seed(seed);
    b.add_input("data", 5, 1, 6, 6).unwrap();
    b.add_convolution("conv", "data", 10, 3, 1, 1).unwrap();
    b.add_activation("act", "conv", ActivationKind::Relu, 0.0).unwrap();
    b.add_fusion("join", FusionOp::Add, "conv", "act").unwrap();
    b.add_cost("cost", "join", CostKind::MeanSquaredError).unwrap();
    b.build().unwrap()
}

fn batch_data(batch: usize, seed: u64) -> (Vec<f32>, Vec<f32>) {
    let mut rng = SimpleRng::new(seed);
    let input: Vec<f32> = (0..batch * 5 * 6 * 6)
        .map(|_| rng.gen_range_f32(-1.0, 1.0))
        .collect();
    let targets = vec![0.1f32; batch * 10 * 6 * 6];
    (input, targets)
}

/// Under the default policy the convolution originates a blocked layout and
/// its elementwise consumers inherit it; the cost boundary stays plain.
#[test]
fn test_blocked_descriptors_appear_under_default_policy() {
    let g = residual(FormatPolicy::BlockedWherePossible, 3);
    let conv = g.find("conv").unwrap();
    let act = g.find("act").unwrap();
    let join = g.find("join").unwrap();

    assert_eq!(g.base(conv).desc().format, MemoryFormat::Blocked);
    assert_eq!(g.base(act).desc().format, MemoryFormat::Blocked);
    // The fusion feeds the cost layer, so its output is forced plain even
    // though both of its inputs are blocked.
    assert_eq!(g.base(join).desc().format, MemoryFormat::Plain);

    let plain = residual(FormatPolicy::PlainOnly, 3);
    for i in 0..plain.len() {
        assert_eq!(plain.base(i).desc().format, MemoryFormat::Plain);
    }
}

/// Blocked and plain runs of the same seeded graph must agree on activations
/// and gradients at every layer: the reorder boundaries (forward into the
/// fusion, backward out of it, including the accumulate path onto the shared
/// convolution edge) are pure permutations.
#[test]
fn test_blocked_run_matches_plain_reference() {
    let batch = 3;
    let (input, targets) = batch_data(batch, 9);

    let run = |policy: FormatPolicy| {
        let mut g = residual(policy, 17);
        g.set_batch_size(batch).unwrap();
        g.set_input(&input);
        g.set_targets(&targets);
        g.forward_prop(true);
        g.backward_prop();
        g
    };
    let blocked = run(FormatPolicy::BlockedWherePossible);
    let plain = run(FormatPolicy::PlainOnly);

    assert!((blocked.loss() - plain.loss()).abs() <= 1e-6);

    for name in ["conv", "act", "join"] {
        let bi = blocked.find(name).unwrap();
        let pi = plain.find(name).unwrap();
        let b_desc = *blocked.base(bi).desc();
        let p_desc = *plain.base(pi).desc();
        let (b_fwd, p_fwd) = (
            blocked.base(bi).neurons.as_slice(),
            plain.base(pi).neurons.as_slice(),
        );
        let (b_bwd, p_bwd) = (
            blocked.base(bi).neurons_d1.as_slice(),
            plain.base(pi).neurons_d1.as_slice(),
        );
        for n in 0..batch {
            for c in 0..b_desc.c {
                for h in 0..b_desc.h {
                    for w in 0..b_desc.w {
                        let bo = b_desc.offset(n, c, 0, h, w);
                        let po = p_desc.offset(n, c, 0, h, w);
                        assert!(
                            (b_fwd[bo] - p_fwd[po]).abs() <= 1e-6,
                            "`{}` forward differs at ({},{},{},{}): {} vs {}",
                            name, n, c, h, w, b_fwd[bo], p_fwd[po]
                        );
                        assert!(
                            (b_bwd[bo] - p_bwd[po]).abs() <= 1e-6,
                            "`{}` gradient differs at ({},{},{},{}): {} vs {}",
                            name, n, c, h, w, b_bwd[bo], p_bwd[po]
                        );
                    }
                }
            }
        }
    }
}

/// Reordered gradient emission keeps the padding channels of a blocked
/// producer at zero.
#[test]
fn test_reorder_boundary_preserves_gradient_padding() {
    let batch = 2;
    let (input, targets) = batch_data(batch, 5);
    let mut g = residual(FormatPolicy::BlockedWherePossible, 23);
    g.set_batch_size(batch).unwrap();
    g.set_input(&input);
    g.set_targets(&targets);
    g.forward_prop(true);
    g.backward_prop();

    for name in ["conv", "act"] {
        let i = g.find(name).unwrap();
        let desc = *g.base(i).diff_desc();
        assert_eq!(desc.format, MemoryFormat::Blocked);
        let buf = g.base(i).neurons_d1.as_slice();
        for n in 0..batch {
            for c in desc.c..desc.padded_c {
                for h in 0..desc.h {
                    for w in 0..desc.w {
                        assert_eq!(buf[desc.offset(n, c, 0, h, w)], 0.0, "padding leak in `{}`", name);
                    }
                }
            }
        }
    }
}
