//! Batch normalization with optionally fused activation and dropout.
//!
//! Statistics are computed per real channel over the whole mini-batch with
//! compensated summation, then folded into a single elementwise pass that
//! normalizes, scales, activates and masks in one sweep over each sample.
//! Parameters and running statistics are sized for the padded channel count
//! and hold identity values (`gamma = 1`, `beta = 0`, `var = 1`) on the
//! padding channels, so a padded lane can never produce a nonzero output.

use crate::error::GraphError;
use crate::format::{negotiate, FormatPolicy, Reorder};
use crate::optimizers::Optimizer;
use crate::tensor::TensorBuffer;
use crate::threading::{for_each_sample, partition};
use crate::utils::math::KahanSum;
use crate::utils::SimpleRng;
use std::io::{self, Read, Write};

use super::{emit_gradient, read_f32s, write_f32s, ActivationKind, LayerBase};

#[derive(Debug)]
pub struct BatchNormLayer {
    act: Option<ActivationKind>,
    alpha: f32,
    dropout_rate: f32,
    momentum: f32,
    epsilon: f32,
    seed: u64,
    step: u64,
    channels: usize,

    gamma: Vec<f32>,
    beta: Vec<f32>,
    grad_gamma: Vec<f32>,
    grad_beta: Vec<f32>,
    running_mean: Vec<f32>,
    running_var: Vec<f32>,

    // Per-channel statistics of the step the last forward pass ran; backward
    // recomputes the normalized values from the source instead of caching a
    // full activation-sized buffer.
    mean: Vec<f32>,
    inv_std: Vec<f32>,

    mask: TensorBuffer,
    mask_active: bool,

    src_reorder: Option<Reorder>,
    src_scratch: TensorBuffer,
    bwd_scratch: TensorBuffer,
}

impl BatchNormLayer {
    pub fn new(
        act: Option<ActivationKind>,
        alpha: f32,
        dropout_rate: f32,
        momentum: f32,
        epsilon: f32,
        seed: u64,
    ) -> Self {
        assert!(
            (0.0..1.0).contains(&dropout_rate),
            "dropout_rate must be in range [0.0, 1.0)"
        );
        assert!(epsilon > 0.0, "epsilon must be positive");
        Self {
            act,
            alpha,
            dropout_rate,
            momentum,
            epsilon,
            seed,
            step: 0,
            channels: 0,
            gamma: Vec::new(),
            beta: Vec::new(),
            grad_gamma: Vec::new(),
            grad_beta: Vec::new(),
            running_mean: Vec::new(),
            running_var: Vec::new(),
            mean: Vec::new(),
            inv_std: Vec::new(),
            mask: TensorBuffer::new(),
            mask_active: false,
            src_reorder: None,
            src_scratch: TensorBuffer::new(),
            bwd_scratch: TensorBuffer::new(),
        }
    }

    pub fn activation(&self) -> Option<ActivationKind> {
        self.act
    }

    pub fn parameter_count(&self) -> usize {
        2 * self.channels
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
        self.channels = base.c;

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
        self.bwd_scratch.resize(batch * desc.elements(), Some(desc), 0.0);

        // Re-runs after batch or resolution changes must not wipe learned
        // parameters; allocate only when the channel extent actually changed.
        if self.gamma.len() != base.padded_c {
            let pc = base.padded_c;
            self.gamma = vec![1.0; pc];
            self.beta = vec![0.0; pc];
            self.grad_gamma = vec![0.0; pc];
            self.grad_beta = vec![0.0; pc];
            self.running_mean = vec![0.0; pc];
            self.running_var = vec![1.0; pc];
            self.mean = vec![0.0; pc];
            self.inv_std = vec![1.0; pc];
        }
        Ok(())
    }

    pub fn forward(&mut self, base: &mut LayerBase, inputs: &[&LayerBase], batch: usize, training: bool) {
        let desc = *base.desc();
        let sample_len = base.padded_cdhw();
        let threads = partition(batch * sample_len, base.kind.cost_weight());
        let (channels, dim_d, dim_h, dim_w) = (base.c, base.d, base.h, base.w);
        let n_stat = (batch * dim_d * dim_h * dim_w) as f32;

        self.mask_active = training && base.enabled && self.dropout_rate > 0.0;
        if self.mask_active {
            let root = SimpleRng::new(self.seed ^ self.step.wrapping_mul(0x9e37_79b9_7f4a_7c15));
            let rate = self.dropout_rate;
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
            mean,
            inv_std,
            running_mean,
            running_var,
            ..
        } = self;
        let src: &[f32] = if let Some(reorder) = src_reorder {
            reorder.execute(inputs[0].neurons.as_slice(), src_scratch.as_mut_slice(), batch, false);
            src_scratch.as_slice()
        } else {
            inputs[0].neurons.as_slice()
        };

        if training {
            for c in 0..channels {
                let mut sum = KahanSum::new();
                let mut sum_sq = KahanSum::new();
                for n in 0..batch {
                    for dd in 0..dim_d {
                        for hh in 0..dim_h {
                            for ww in 0..dim_w {
                                let x = src[desc.offset(n, c, dd, hh, ww)];
                                sum.add(x);
                                sum_sq.add(x * x);
                            }
                        }
                    }
                }
                let m = sum.value() / n_stat;
                let v = (sum_sq.value() / n_stat - m * m).max(0.0);
                mean[c] = m;
                inv_std[c] = 1.0 / (v + self.epsilon).sqrt();
                running_mean[c] = self.momentum * running_mean[c] + (1.0 - self.momentum) * m;
                running_var[c] = self.momentum * running_var[c] + (1.0 - self.momentum) * v;
            }
        } else {
            for c in 0..channels {
                mean[c] = running_mean[c];
                inv_std[c] = 1.0 / (running_var[c] + self.epsilon).sqrt();
            }
        }

        let act = self.act;
        let alpha = self.alpha;
        let mask_active = self.mask_active;
        let mean: &[f32] = &self.mean;
        let inv_std: &[f32] = &self.inv_std;
        let gamma: &[f32] = &self.gamma;
        let beta: &[f32] = &self.beta;
        let mask: &[f32] = self.mask.as_slice();

        for_each_sample(base.neurons.as_mut_slice(), sample_len, threads, |n, out| {
            for c in 0..channels {
                let (mu, is, g, b) = (mean[c], inv_std[c], gamma[c], beta[c]);
                for dd in 0..dim_d {
                    for hh in 0..dim_h {
                        for ww in 0..dim_w {
                            let li = desc.offset(0, c, dd, hh, ww);
                            let gi = n * sample_len + li;
                            let mut y = g * ((src[gi] - mu) * is) + b;
                            if let Some(kind) = act {
                                y = kind.apply(y, alpha);
                            }
                            if mask_active {
                                y *= mask[gi];
                            }
                            out[li] = y;
                        }
                    }
                }
            }
        });
    }

    pub fn backward(&mut self, base: &mut LayerBase, inputs: &mut [&mut LayerBase], batch: usize) {
        let desc = *base.diff_desc();
        let sample_len = base.padded_cdhw();
        let threads = partition(batch * sample_len, base.kind.cost_weight());
        let (channels, dim_d, dim_h, dim_w) = (base.c, base.d, base.h, base.w);
        let n_stat = (batch * dim_d * dim_h * dim_w) as f32;

        let act = self.act;
        let alpha = self.alpha;
        let mask_active = self.mask_active;

        let Self {
            src_reorder,
            src_scratch,
            bwd_scratch,
            mask,
            mean,
            inv_std,
            gamma,
            grad_gamma,
            grad_beta,
            beta,
            ..
        } = self;
        // The scratch still holds the forward pass's reordered source.
        let src: &[f32] = if src_reorder.is_some() {
            src_scratch.as_slice()
        } else {
            inputs[0].neurons.as_slice()
        };
        let mean: &[f32] = mean;
        let inv_std: &[f32] = inv_std;
        let gamma_v: &[f32] = gamma;
        let beta_v: &[f32] = beta;
        let mask_v: &[f32] = mask.as_slice();

        // Fold dropout and the fused activation derivative into the upstream
        // gradient before the normalization backward proper.
        {
            let d1 = base.neurons_d1.as_slice();
            for_each_sample(bwd_scratch.as_mut_slice(), sample_len, threads, |n, out| {
                for c in 0..channels {
                    let (mu, is, g_c, b_c) = (mean[c], inv_std[c], gamma_v[c], beta_v[c]);
                    for dd in 0..dim_d {
                        for hh in 0..dim_h {
                            for ww in 0..dim_w {
                                let li = desc.offset(0, c, dd, hh, ww);
                                let gi = n * sample_len + li;
                                let mut g = d1[gi];
                                if mask_active {
                                    g *= mask_v[gi];
                                }
                                if let Some(kind) = act {
                                    let z = g_c * ((src[gi] - mu) * is) + b_c;
                                    g *= kind.derivative(z, alpha);
                                }
                                out[li] = g;
                            }
                        }
                    }
                }
            });
        }

        // Per-channel reductions over the effective gradient; these feed both
        // the parameter gradients and the input-gradient correction terms.
        let mut sum_g = vec![0.0f32; channels];
        let mut sum_gx = vec![0.0f32; channels];
        {
            let eff = bwd_scratch.as_slice();
            for c in 0..channels {
                let (mu, is) = (mean[c], inv_std[c]);
                let mut s = KahanSum::new();
                let mut sx = KahanSum::new();
                for n in 0..batch {
                    for dd in 0..dim_d {
                        for hh in 0..dim_h {
                            for ww in 0..dim_w {
                                let i = desc.offset(n, c, dd, hh, ww);
                                let g = eff[i];
                                s.add(g);
                                sx.add(g * (src[i] - mu) * is);
                            }
                        }
                    }
                }
                sum_g[c] = s.value();
                sum_gx[c] = sx.value();
                grad_beta[c] += sum_g[c];
                grad_gamma[c] += sum_gx[c];
            }
        }

        let sum_g: &[f32] = &sum_g;
        let sum_gx: &[f32] = &sum_gx;
        for_each_sample(bwd_scratch.as_mut_slice(), sample_len, threads, |n, chunk| {
            for c in 0..channels {
                let (mu, is) = (mean[c], inv_std[c]);
                let k = gamma_v[c] * is / n_stat;
                for dd in 0..dim_d {
                    for hh in 0..dim_h {
                        for ww in 0..dim_w {
                            let li = desc.offset(0, c, dd, hh, ww);
                            let gi = n * sample_len + li;
                            let x_hat = (src[gi] - mu) * is;
                            chunk[li] = k * (n_stat * chunk[li] - sum_g[c] - x_hat * sum_gx[c]);
                        }
                    }
                }
            }
        });

        let shared = base.input_shared[0];
        emit_gradient(self.bwd_scratch.as_slice(), &desc, inputs[0], batch, shared);
    }

    /// Restore identity parameters and fresh running statistics.
    pub fn reset_weights(&mut self) {
        self.gamma.fill(1.0);
        self.beta.fill(0.0);
        self.grad_gamma.fill(0.0);
        self.grad_beta.fill(0.0);
        self.running_mean.fill(0.0);
        self.running_var.fill(1.0);
    }

    pub fn apply_update(&mut self, slot: usize, opt: &mut dyn Optimizer) {
        opt.update(slot, &mut self.gamma, &self.grad_gamma);
        opt.update(slot + 1, &mut self.beta, &self.grad_beta);
        self.grad_gamma.fill(0.0);
        self.grad_beta.fill(0.0);
    }

    pub fn save(&self, writer: &mut dyn Write) -> io::Result<()> {
        write_f32s(writer, &self.gamma)?;
        write_f32s(writer, &self.beta)?;
        write_f32s(writer, &self.running_mean)?;
        write_f32s(writer, &self.running_var)
    }

    pub fn load(&mut self, reader: &mut dyn Read) -> io::Result<()> {
        read_f32s(reader, &mut self.gamma)?;
        read_f32s(reader, &mut self.beta)?;
        read_f32s(reader, &mut self.running_mean)?;
        read_f32s(reader, &mut self.running_var)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "dropout_rate must be in range")]
    fn test_invalid_dropout() {
        let _ = BatchNormLayer::new(None, 0.0, 1.0, 0.9, 1e-5, 1);
    }

    #[test]
    fn test_accessors() {
        let bn = BatchNormLayer::new(Some(ActivationKind::Relu), 0.0, 0.0, 0.9, 1e-5, 1);
        assert_eq!(bn.activation(), Some(ActivationKind::Relu));
        assert_eq!(bn.parameter_count(), 0);
    }
}
