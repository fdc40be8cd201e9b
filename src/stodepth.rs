//! Stochastic-depth scheduling.
//!
//! Once per training step, every fusion layer's residual input (its second
//! producer) draws a Bernoulli survival trial. A surviving branch is scaled
//! by `1/p` so the expected contribution matches full depth; a dropped branch
//! is flagged `skip` all the way back to the nearest shared, fusion or input
//! layer and contributes exactly zero. Survival probability decays linearly
//! with connection depth unless `fixed` is set.

use tracing::debug;

use crate::graph::Graph;
use crate::utils::SimpleRng;

#[derive(Debug)]
pub struct StochasticDepth {
    drop_rate: f32,
    fixed: bool,
    rng: SimpleRng,
}

impl StochasticDepth {
    /// `drop_rate` is the deepest connection's drop probability; with `fixed`
    /// every connection uses it directly.
    pub fn new(drop_rate: f32, fixed: bool, seed: u64) -> Self {
        assert!(
            (0.0..1.0).contains(&drop_rate),
            "drop rate must be in range [0.0, 1.0)"
        );
        Self {
            drop_rate,
            fixed,
            rng: SimpleRng::new(seed),
        }
    }

    /// Survival probability for connection `k` of `n`.
    pub fn survival_probability(&self, k: usize, n: usize) -> f32 {
        if self.fixed {
            1.0 - self.drop_rate
        } else {
            1.0 - self.drop_rate * (k + 1) as f32 / n as f32
        }
    }

    /// Draw this step's survival decisions and flag dropped branches.
    ///
    /// Must run before `forward_prop`, training only.
    pub fn schedule(&mut self, graph: &mut Graph) {
        graph.clear_survival();
        let fusions = graph.fusion_indices();
        let n = fusions.len();
        if n == 0 {
            return;
        }
        for (k, &index) in fusions.iter().enumerate() {
            let p = self.survival_probability(k, n);
            let alive = self.rng.gen_bernoulli(p);
            graph.set_fusion_survival(index, 1, p, alive);
            if !alive {
                graph.set_branch_skip(index, true);
                debug!(fusion = index, probability = p, "branch dropped");
            }
        }
    }

    /// Restore full depth; required before any inference pass.
    pub fn clear(&self, graph: &mut Graph) {
        graph.clear_survival();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_decay() {
        let sd = StochasticDepth::new(0.5, false, 1);
        // Deeper connections are dropped more aggressively.
        assert!((sd.survival_probability(0, 4) - 0.875).abs() < 1e-6);
        assert!((sd.survival_probability(3, 4) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_fixed_rate() {
        let sd = StochasticDepth::new(0.2, true, 1);
        assert!((sd.survival_probability(0, 10) - 0.8).abs() < 1e-6);
        assert!((sd.survival_probability(9, 10) - 0.8).abs() < 1e-6);
    }

    #[test]
    #[should_panic(expected = "drop rate")]
    fn test_full_drop_rejected() {
        let _ = StochasticDepth::new(1.0, false, 1);
    }
}
