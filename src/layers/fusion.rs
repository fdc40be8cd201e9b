//! Two-input fusion layers: Add, Average and Substract.
//!
//! Each input carries a survival probability and a realized scale set by the
//! stochastic-depth scheduler before every training step. A surviving input
//! is scaled by the reciprocal of its survival probability so the expected
//! contribution is unbiased; a skipped input contributes exactly zero and its
//! buffer is never read. Average divides by the number of surviving inputs
//! (2 at full depth).
//!
//! The second input may be a single value per channel (a squeeze-excite style
//! side branch); it is broadcast over the spatial extent in forward and
//! reduce-summed in backward.

use crate::error::GraphError;
use crate::format::{negotiate, FormatPolicy, MemDesc, Reorder, VEC_WIDTH};
use crate::tensor::TensorBuffer;
use crate::threading::{for_each_sample, partition};

use super::{emit_gradient, LayerBase};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionOp {
    Add,
    Average,
    Substract,
}

/// Combine two equal-length stripes in vector-width chunks.
///
/// `out = k0 * a + k1 * b`; Substract and Average are expressed through the
/// signs and magnitudes of the coefficients.
#[inline]
pub(crate) fn combine_chunked(a: &[f32], b: &[f32], out: &mut [f32], k0: f32, k1: f32) {
    let mut ac = a.chunks_exact(VEC_WIDTH);
    let mut bc = b.chunks_exact(VEC_WIDTH);
    let mut oc = out.chunks_exact_mut(VEC_WIDTH);
    for ((va, vb), vo) in (&mut ac).zip(&mut bc).zip(&mut oc) {
        for lane in 0..VEC_WIDTH {
            vo[lane] = k0 * va[lane] + k1 * vb[lane];
        }
    }
    for ((x, y), o) in ac
        .remainder()
        .iter()
        .zip(bc.remainder().iter())
        .zip(oc.into_remainder().iter_mut())
    {
        *o = k0 * x + k1 * y;
    }
}

/// Reference scalar loop for [`combine_chunked`]; the two must agree within
/// floating-point reduction order.
#[inline]
pub(crate) fn combine_scalar(a: &[f32], b: &[f32], out: &mut [f32], k0: f32, k1: f32) {
    for ((x, y), o) in a.iter().zip(b.iter()).zip(out.iter_mut()) {
        *o = k0 * x + k1 * y;
    }
}

#[inline]
fn scale_into(src: &[f32], out: &mut [f32], k: f32) {
    for (o, &x) in out.iter_mut().zip(src.iter()) {
        *o = k * x;
    }
}

#[derive(Debug)]
pub struct FusionLayer {
    op: FusionOp,
    survival: [f32; 2],
    alive: [bool; 2],
    broadcast: bool,
    in1_desc: MemDesc,

    in0_reorder: Option<Reorder>,
    in0_scratch: TensorBuffer,
    in1_reorder: Option<Reorder>,
    in1_scratch: TensorBuffer,
    bwd_scratch0: TensorBuffer,
    bwd_scratch1: TensorBuffer,
}

impl FusionLayer {
    pub fn new(op: FusionOp) -> Self {
        Self {
            op,
            survival: [1.0; 2],
            alive: [true; 2],
            broadcast: false,
            in1_desc: MemDesc::new(crate::format::MemoryFormat::Plain, 0, 1, 1, 1),
            in0_reorder: None,
            in0_scratch: TensorBuffer::new(),
            in1_reorder: None,
            in1_scratch: TensorBuffer::new(),
            bwd_scratch0: TensorBuffer::new(),
            bwd_scratch1: TensorBuffer::new(),
        }
    }

    pub fn op(&self) -> FusionOp {
        self.op
    }

    pub fn survival(&self, input: usize) -> f32 {
        self.survival[input]
    }

    pub fn alive(&self, input: usize) -> bool {
        self.alive[input]
    }

    /// Set one input's survival state for the coming step.
    pub fn set_survival(&mut self, input: usize, probability: f32, alive: bool) {
        assert!(
            probability > 0.0 && probability <= 1.0,
            "survival probability must be in (0.0, 1.0]"
        );
        self.survival[input] = probability;
        self.alive[input] = alive;
    }

    /// Restore full depth (both inputs surviving, unit scales).
    pub fn clear_survival(&mut self) {
        self.survival = [1.0; 2];
        self.alive = [true; 2];
    }

    /// Realized per-input scale: `1/p` when surviving, 0 when skipped.
    fn realized_scale(&self, input: usize) -> f32 {
        if self.alive[input] {
            1.0 / self.survival[input]
        } else {
            0.0
        }
    }

    /// Forward coefficients for both inputs, op and divisor folded in.
    fn coefficients(&self) -> (f32, f32) {
        let mut k0 = self.realized_scale(0);
        let mut k1 = self.realized_scale(1);
        if self.op == FusionOp::Substract {
            k1 = -k1;
        }
        if self.op == FusionOp::Average {
            let surviving = self.alive.iter().filter(|&&a| a).count();
            // Fixed divisor when everything was dropped; the output is zero
            // either way.
            let divisor = if surviving == 0 { 2.0 } else { surviving as f32 };
            k0 /= divisor;
            k1 /= divisor;
        }
        (k0, k1)
    }

    pub fn init_descriptors(
        &mut self,
        base: &mut LayerBase,
        prevs: &[&LayerBase],
        batch: usize,
        policy: FormatPolicy,
        force_plain: bool,
    ) -> Result<(), GraphError> {
        let (p0, p1) = (prevs[0], prevs[1]);
        if p0.c != p1.c || p0.d != p1.d {
            return Err(GraphError::ShapeMismatch {
                layer: base.name.clone(),
                details: format!(
                    "fusion inputs disagree on channels/depth: {}x{} vs {}x{}",
                    p0.c, p0.d, p1.c, p1.d
                ),
            });
        }
        self.broadcast = p1.h * p1.w == 1 && p0.h * p0.w != 1;
        if !self.broadcast && (p0.h != p1.h || p0.w != p1.w) {
            return Err(GraphError::ShapeMismatch {
                layer: base.name.clone(),
                details: format!(
                    "fusion inputs disagree on spatial extent: {}x{} vs {}x{}",
                    p0.h, p0.w, p1.h, p1.w
                ),
            });
        }
        base.set_shape(p0.c, p0.d, p0.h, p0.w);

        let desc = negotiate(
            base.c,
            base.d,
            base.h,
            base.w,
            Some(p0.desc().format),
            force_plain,
            policy,
        );
        base.dst_desc = Some(desc);
        base.diff_dst_desc = Some(desc);

        if desc.format != p0.desc().format {
            self.in0_reorder = Some(Reorder::new(*p0.desc(), desc));
            self.in0_scratch.resize(batch * desc.elements(), Some(desc), 0.0);
        } else {
            self.in0_reorder = None;
            self.in0_scratch.resize(0, None, 0.0);
        }
        self.in1_desc = *p1.desc();
        if !self.broadcast && desc.format != p1.desc().format {
            self.in1_reorder = Some(Reorder::new(*p1.desc(), desc));
            self.in1_scratch.resize(batch * desc.elements(), Some(desc), 0.0);
        } else {
            self.in1_reorder = None;
            self.in1_scratch.resize(0, None, 0.0);
        }
        self.bwd_scratch0.resize(batch * desc.elements(), Some(desc), 0.0);
        // The broadcast backward reduces into input 1's own layout; the
        // elementwise backward scales `d1` in place, so the scratch stays in
        // this layer's layout and `emit_gradient` reorders at the boundary.
        if self.broadcast {
            self.bwd_scratch1
                .resize(batch * self.in1_desc.elements(), Some(self.in1_desc), 0.0);
        } else {
            self.bwd_scratch1.resize(batch * desc.elements(), Some(desc), 0.0);
        }
        Ok(())
    }

    pub fn forward(&mut self, base: &mut LayerBase, inputs: &[&LayerBase], batch: usize) {
        let desc = *base.desc();
        let sample_len = desc.elements();
        let threads = partition(batch * sample_len, base.kind.cost_weight());
        let (k0, k1) = self.coefficients();
        let (alive0, alive1) = (self.alive[0], self.alive[1]);
        let broadcast = self.broadcast;
        let in1_desc = self.in1_desc;
        let (channels, dim_d, dim_h, dim_w) = (base.c, base.d, base.h, base.w);

        let Self {
            in0_reorder,
            in0_scratch,
            in1_reorder,
            in1_scratch,
            ..
        } = self;
        // A skipped input is never read, not even through a reorder.
        let a: Option<&[f32]> = if alive0 {
            Some(if let Some(reorder) = in0_reorder {
                reorder.execute(inputs[0].neurons.as_slice(), in0_scratch.as_mut_slice(), batch, false);
                in0_scratch.as_slice()
            } else {
                inputs[0].neurons.as_slice()
            })
        } else {
            None
        };
        let b: Option<&[f32]> = if alive1 {
            Some(if let Some(reorder) = in1_reorder {
                reorder.execute(inputs[1].neurons.as_slice(), in1_scratch.as_mut_slice(), batch, false);
                in1_scratch.as_slice()
            } else {
                inputs[1].neurons.as_slice()
            })
        } else {
            None
        };

        let in1_len = in1_desc.elements();
        for_each_sample(base.neurons.as_mut_slice(), sample_len, threads, |n, out| {
            match (a, b) {
                (Some(a), Some(b)) if broadcast => {
                    for c in 0..channels {
                        for od in 0..dim_d {
                            let side = k1 * b[n * in1_len + in1_desc.offset(0, c, od, 0, 0)];
                            for hh in 0..dim_h {
                                for ww in 0..dim_w {
                                    let li = desc.offset(0, c, od, hh, ww);
                                    out[li] = k0 * a[n * sample_len + li] + side;
                                }
                            }
                        }
                    }
                }
                (Some(a), Some(b)) => {
                    let range = n * sample_len..(n + 1) * sample_len;
                    combine_chunked(&a[range.clone()], &b[range], out, k0, k1);
                }
                (Some(a), None) => {
                    scale_into(&a[n * sample_len..(n + 1) * sample_len], out, k0);
                }
                (None, Some(b)) if broadcast => {
                    for c in 0..channels {
                        for od in 0..dim_d {
                            let side = k1 * b[n * in1_len + in1_desc.offset(0, c, od, 0, 0)];
                            for hh in 0..dim_h {
                                for ww in 0..dim_w {
                                    out[desc.offset(0, c, od, hh, ww)] = side;
                                }
                            }
                        }
                    }
                }
                (None, Some(b)) => {
                    scale_into(&b[n * sample_len..(n + 1) * sample_len], out, k1);
                }
                (None, None) => out.fill(0.0),
            }
        });
    }

    pub fn backward(&mut self, base: &mut LayerBase, inputs: &mut [&mut LayerBase], batch: usize) {
        let desc = *base.diff_desc();
        let sample_len = desc.elements();
        let threads = partition(batch * sample_len, base.kind.cost_weight());
        let (k0, k1) = self.coefficients();
        let broadcast = self.broadcast;
        let in1_desc = self.in1_desc;
        let in1_len = in1_desc.elements();
        let (channels, dim_d, dim_h, dim_w) = (base.c, base.d, base.h, base.w);

        if self.alive[0] {
            {
                let d1 = base.neurons_d1.as_slice();
                for_each_sample(self.bwd_scratch0.as_mut_slice(), sample_len, threads, |n, out| {
                    scale_into(&d1[n * sample_len..(n + 1) * sample_len], out, k0);
                });
            }
            let shared = base.input_shared[0];
            emit_gradient(self.bwd_scratch0.as_slice(), &desc, inputs[0], batch, shared);
        }

        if self.alive[1] {
            {
                let d1 = base.neurons_d1.as_slice();
                if broadcast {
                    for_each_sample(self.bwd_scratch1.as_mut_slice(), in1_len, threads, |n, out| {
                        out.fill(0.0);
                        for c in 0..channels {
                            for od in 0..dim_d {
                                let mut acc = 0.0f32;
                                for hh in 0..dim_h {
                                    for ww in 0..dim_w {
                                        acc += d1[n * sample_len + desc.offset(0, c, od, hh, ww)];
                                    }
                                }
                                out[in1_desc.offset(0, c, od, 0, 0)] = k1 * acc;
                            }
                        }
                    });
                } else {
                    for_each_sample(self.bwd_scratch1.as_mut_slice(), sample_len, threads, |n, out| {
                        scale_into(&d1[n * sample_len..(n + 1) * sample_len], out, k1);
                    });
                }
            }
            let shared = base.input_shared[1];
            let scratch_desc = if broadcast { in1_desc } else { desc };
            emit_gradient(self.bwd_scratch1.as_slice(), &scratch_desc, inputs[1], batch, shared);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::SimpleRng;

    #[test]
    fn test_chunked_matches_scalar() {
        let mut rng = SimpleRng::new(7);
        let n = 3 * VEC_WIDTH + 5;
        let a: Vec<f32> = (0..n).map(|_| rng.gen_range_f32(-2.0, 2.0)).collect();
        let b: Vec<f32> = (0..n).map(|_| rng.gen_range_f32(-2.0, 2.0)).collect();
        let mut fast = vec![0.0f32; n];
        let mut slow = vec![0.0f32; n];
        for &(k0, k1) in &[(1.0f32, 1.0f32), (0.5, 0.5), (1.25, -1.25), (2.0, 0.0)] {
            combine_chunked(&a, &b, &mut fast, k0, k1);
            combine_scalar(&a, &b, &mut slow, k0, k1);
            for (x, y) in fast.iter().zip(slow.iter()) {
                assert!((x - y).abs() <= 1e-5, "{} vs {}", x, y);
            }
        }
    }

    #[test]
    fn test_coefficients_full_depth() {
        let add = FusionLayer::new(FusionOp::Add);
        assert_eq!(add.coefficients(), (1.0, 1.0));
        let avg = FusionLayer::new(FusionOp::Average);
        assert_eq!(avg.coefficients(), (0.5, 0.5));
        let sub = FusionLayer::new(FusionOp::Substract);
        assert_eq!(sub.coefficients(), (1.0, -1.0));
    }

    #[test]
    fn test_coefficients_skipped_branch() {
        let mut add = FusionLayer::new(FusionOp::Add);
        add.set_survival(1, 0.8, false);
        assert_eq!(add.coefficients(), (1.0, 0.0));
        add.set_survival(1, 0.8, true);
        let (k0, k1) = add.coefficients();
        assert_eq!(k0, 1.0);
        assert!((k1 - 1.25).abs() < 1e-6);

        let mut avg = FusionLayer::new(FusionOp::Average);
        avg.set_survival(1, 0.5, false);
        // Sole survivor: divisor is 1.
        assert_eq!(avg.coefficients(), (1.0, 0.0));
    }

    #[test]
    #[should_panic(expected = "survival probability")]
    fn test_zero_survival_rejected() {
        let mut add = FusionLayer::new(FusionOp::Add);
        add.set_survival(0, 0.0, true);
    }
}
