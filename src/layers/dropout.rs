//! Dropout regularization layer.
//!
//! During training each unit is zeroed with probability `drop_rate` and the
//! survivors are scaled by `1/(1-drop_rate)` so the expected activation is
//! unchanged. Inference passes values through untouched. Mask generation is
//! deterministic: every sample draws from its own forked stream keyed by
//! `(seed, step, sample_index)`, so results do not depend on the thread count.

use crate::error::GraphError;
use crate::format::{negotiate, FormatPolicy, Reorder};
use crate::tensor::TensorBuffer;
use crate::threading::{for_each_sample, partition};
use crate::utils::SimpleRng;

use super::{emit_gradient, LayerBase};

#[derive(Debug)]
pub struct DropoutLayer {
    drop_rate: f32,
    seed: u64,
    step: u64,
    mask: TensorBuffer,
    src_reorder: Option<Reorder>,
    src_scratch: TensorBuffer,
    bwd_scratch: TensorBuffer,
}

impl DropoutLayer {
    pub fn new(drop_rate: f32, seed: u64) -> Self {
        assert!(
            (0.0..1.0).contains(&drop_rate),
            "drop_rate must be in range [0.0, 1.0)"
        );
        Self {
            drop_rate,
            seed,
            step: 0,
            mask: TensorBuffer::new(),
            src_reorder: None,
            src_scratch: TensorBuffer::new(),
            bwd_scratch: TensorBuffer::new(),
        }
    }

    pub fn drop_rate(&self) -> f32 {
        self.drop_rate
    }

    pub fn init_descriptors(
        &mut self,
        base: &mut LayerBase,
        prevs: &[&LayerBase],
        batch: usize,
        policy: FormatPolicy,
        force_plain: bool,
    ) -> Result<(), GraphError> {
        let prev = prevs[0];
        let prev_desc = *prev.desc();
        base.set_shape(prev.c, prev.d, prev.h, prev.w);

        let desc = negotiate(
            base.c,
            base.d,
            base.h,
            base.w,
            Some(prev_desc.format),
            force_plain,
            policy,
        );
        base.dst_desc = Some(desc);
        base.diff_dst_desc = Some(desc);

        if desc.format != prev_desc.format {
            self.src_reorder = Some(Reorder::new(prev_desc, desc));
            self.src_scratch.resize(batch * desc.elements(), Some(desc), 0.0);
        } else {
            self.src_reorder = None;
            self.src_scratch.resize(0, None, 0.0);
        }
        self.mask.resize(batch * desc.elements(), Some(desc), 1.0);
        if !base.inplace_bwd {
            self.bwd_scratch.resize(batch * desc.elements(), Some(desc), 0.0);
        }
        Ok(())
    }

    pub fn forward(&mut self, base: &mut LayerBase, inputs: &[&LayerBase], batch: usize, training: bool) {
        let sample_len = base.padded_cdhw();
        let threads = partition(batch * sample_len, base.kind.cost_weight());

        let active = training && base.enabled && self.drop_rate > 0.0;
        if active {
            // Regenerate the keep mask for this step.
            let root = SimpleRng::new(self.seed ^ self.step.wrapping_mul(0x2545_f491_4f6c_dd1d));
            let rate = self.drop_rate;
            let scale = 1.0 / (1.0 - rate);
            for_each_sample(self.mask.as_mut_slice(), sample_len, threads, |n, m| {
                let mut rng = root.fork(n as u64);
                for v in m.iter_mut() {
                    *v = if rng.gen_bernoulli(rate) { 0.0 } else { scale };
                }
            });
            self.step = self.step.wrapping_add(1);
        }

        let Self {
            src_reorder,
            src_scratch,
            mask,
            ..
        } = self;
        let src: &[f32] = if let Some(reorder) = src_reorder {
            reorder.execute(inputs[0].neurons.as_slice(), src_scratch.as_mut_slice(), batch, false);
            src_scratch.as_slice()
        } else {
            inputs[0].neurons.as_slice()
        };

        if active {
            let mask = mask.as_slice();
            for_each_sample(base.neurons.as_mut_slice(), sample_len, threads, |n, out| {
                let range = n * sample_len..(n + 1) * sample_len;
                let s = &src[range.clone()];
                let m = &mask[range];
                for ((o, &x), &k) in out.iter_mut().zip(s.iter()).zip(m.iter()) {
                    *o = x * k;
                }
            });
        } else {
            base.neurons.as_mut_slice().copy_from_slice(src);
        }
    }

    pub fn backward(&mut self, base: &mut LayerBase, inputs: &mut [&mut LayerBase], batch: usize) {
        let sample_len = base.padded_cdhw();
        let threads = partition(batch * sample_len, base.kind.cost_weight());
        // Mask holds all-ones scale only when dropout was inactive this step;
        // the forward pass regenerates it otherwise.
        let active = base.enabled && self.drop_rate > 0.0;

        if base.inplace_bwd {
            if active {
                let mask = self.mask.as_slice();
                for_each_sample(base.neurons_d1.as_mut_slice(), sample_len, threads, |n, d1| {
                    let m = &mask[n * sample_len..(n + 1) * sample_len];
                    for (g, &k) in d1.iter_mut().zip(m.iter()) {
                        *g *= k;
                    }
                });
            }
            return;
        }

        {
            let Self {
                mask, bwd_scratch, ..
            } = self;
            let mask = mask.as_slice();
            let d1 = base.neurons_d1.as_slice();
            for_each_sample(bwd_scratch.as_mut_slice(), sample_len, threads, |n, out| {
                let range = n * sample_len..(n + 1) * sample_len;
                let g = &d1[range.clone()];
                if active {
                    let m = &mask[range];
                    for ((o, &gy), &k) in out.iter_mut().zip(g.iter()).zip(m.iter()) {
                        *o = gy * k;
                    }
                } else {
                    out.copy_from_slice(g);
                }
            });
        }

        let desc = *base.diff_desc();
        let shared = base.input_shared[0];
        emit_gradient(self.bwd_scratch.as_slice(), &desc, inputs[0], batch, shared);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "drop_rate must be in range")]
    fn test_invalid_drop_rate() {
        let _ = DropoutLayer::new(1.0, 42);
    }

    #[test]
    fn test_drop_rate_accessor() {
        let layer = DropoutLayer::new(0.25, 42);
        assert_eq!(layer.drop_rate(), 0.25);
    }
}
