//! 2D convolution over direct loops.
//!
//! The kernel itself always runs in plain layout: a blocked producer is
//! reordered into a plain scratch, and when the negotiated output descriptor
//! is blocked the result is computed into a plain scratch first and reordered
//! out. Depth is carried through unchanged; the filter slides over H and W
//! only, reading the full channel extent.

use crate::error::GraphError;
use crate::format::{negotiate, FormatPolicy, MemDesc, MemoryFormat, Reorder};
use crate::optimizers::Optimizer;
use crate::tensor::TensorBuffer;
use crate::threading::{for_each_sample, partition};
use crate::utils::SimpleRng;
use std::io::{self, Read, Write};

use super::{emit_gradient, read_f32s, write_f32s, Filler, LayerBase};

#[derive(Debug)]
pub struct ConvLayer {
    out_c: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    in_c: usize,

    /// `[out_c, in_c, kernel, kernel]`, row major.
    weights: Vec<f32>,
    bias: Vec<f32>,
    grad_weights: Vec<f32>,
    grad_bias: Vec<f32>,

    src_reorder: Option<Reorder>,
    src_desc: MemDesc,
    src_scratch: TensorBuffer,

    dst_plain: MemDesc,
    dst_reorder: Option<Reorder>,
    dst_scratch: TensorBuffer,
    d_dst_reorder: Option<Reorder>,
    d_dst_scratch: TensorBuffer,
    d_src_scratch: TensorBuffer,
}

impl ConvLayer {
    pub fn new(out_c: usize, kernel: usize, stride: usize, padding: usize) -> Self {
        assert!(out_c > 0, "convolution needs at least one output channel");
        assert!(kernel > 0 && stride > 0, "kernel and stride must be positive");
        Self {
            out_c,
            kernel,
            stride,
            padding,
            in_c: 0,
            weights: Vec::new(),
            bias: Vec::new(),
            grad_weights: Vec::new(),
            grad_bias: Vec::new(),
            src_reorder: None,
            src_desc: MemDesc::new(MemoryFormat::Plain, 0, 1, 1, 1),
            src_scratch: TensorBuffer::new(),
            dst_plain: MemDesc::new(MemoryFormat::Plain, 0, 1, 1, 1),
            dst_reorder: None,
            dst_scratch: TensorBuffer::new(),
            d_dst_reorder: None,
            d_dst_scratch: TensorBuffer::new(),
            d_src_scratch: TensorBuffer::new(),
        }
    }

    pub fn parameter_count(&self) -> usize {
        self.out_c * self.in_c * self.kernel * self.kernel + self.out_c
    }

    fn out_extent(&self, input: usize) -> usize {
        (input + 2 * self.padding - self.kernel) / self.stride + 1
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
        if prev.h + 2 * self.padding < self.kernel || prev.w + 2 * self.padding < self.kernel {
            return Err(GraphError::ShapeMismatch {
                layer: base.name.clone(),
                details: format!(
                    "kernel {} does not fit input {}x{} with padding {}",
                    self.kernel, prev.h, prev.w, self.padding
                ),
            });
        }
        let out_h = self.out_extent(prev.h);
        let out_w = self.out_extent(prev.w);
        base.set_shape(self.out_c, prev.d, out_h, out_w);

        let plain_src = MemDesc::new(MemoryFormat::Plain, prev.c, prev.d, prev.h, prev.w);
        if prev_desc.format != MemoryFormat::Plain {
            self.src_reorder = Some(Reorder::new(prev_desc, plain_src));
            self.src_scratch
                .resize(batch * plain_src.elements(), Some(plain_src), 0.0);
        } else {
            self.src_reorder = None;
            self.src_scratch.resize(0, None, 0.0);
        }
        self.src_desc = plain_src;

        // Free-choice output side: blocked under the default policy, presented
        // through `dst_reorder` from the plain compute scratch.
        let desc = negotiate(base.c, base.d, base.h, base.w, None, force_plain, policy);
        base.dst_desc = Some(desc);
        base.diff_dst_desc = Some(desc);

        self.dst_plain = MemDesc::new(MemoryFormat::Plain, base.c, base.d, base.h, base.w);
        if desc.format != MemoryFormat::Plain {
            self.dst_reorder = Some(Reorder::new(self.dst_plain, desc));
            self.dst_scratch
                .resize(batch * self.dst_plain.elements(), Some(self.dst_plain), 0.0);
            self.d_dst_reorder = Some(Reorder::new(desc, self.dst_plain));
            self.d_dst_scratch
                .resize(batch * self.dst_plain.elements(), Some(self.dst_plain), 0.0);
        } else {
            self.dst_reorder = None;
            self.dst_scratch.resize(0, None, 0.0);
            self.d_dst_reorder = None;
            self.d_dst_scratch.resize(0, None, 0.0);
        }
        self.d_src_scratch
            .resize(batch * plain_src.elements(), Some(plain_src), 0.0);

        if self.in_c != prev.c || self.weights.is_empty() {
            self.in_c = prev.c;
            let wlen = self.out_c * self.in_c * self.kernel * self.kernel;
            self.weights = vec![0.0; wlen];
            self.grad_weights = vec![0.0; wlen];
            self.bias = vec![0.0; self.out_c];
            self.grad_bias = vec![0.0; self.out_c];
        }
        Ok(())
    }

    pub fn update_resolution(&mut self, base: &mut LayerBase, prevs: &[&LayerBase]) {
        let prev = prevs[0];
        base.set_shape(self.out_c, prev.d, self.out_extent(prev.h), self.out_extent(prev.w));
    }

    pub fn forward(&mut self, base: &mut LayerBase, inputs: &[&LayerBase], batch: usize) {
        let desc = *base.desc();
        let dst_plain = self.dst_plain;
        let src_desc = self.src_desc;
        let (kernel, stride, padding) = (self.kernel, self.stride, self.padding);
        let (in_c, out_c) = (self.in_c, self.out_c);
        let (dim_d, out_h, out_w) = (base.d, base.h, base.w);
        let (in_h, in_w) = (src_desc.h, src_desc.w);
        let sample_len = dst_plain.elements();
        let threads = partition(batch * base.cdhw(), base.kind.cost_weight());

        let Self {
            src_reorder,
            src_scratch,
            dst_reorder,
            dst_scratch,
            weights,
            bias,
            ..
        } = self;
        let src: &[f32] = if let Some(reorder) = src_reorder {
            reorder.execute(inputs[0].neurons.as_slice(), src_scratch.as_mut_slice(), batch, false);
            src_scratch.as_slice()
        } else {
            inputs[0].neurons.as_slice()
        };
        let weights: &[f32] = weights;
        let bias: &[f32] = bias;

        let compute = |n: usize, out: &mut [f32]| {
            for oc in 0..out_c {
                for od in 0..dim_d {
                    for oh in 0..out_h {
                        for ow in 0..out_w {
                            let mut acc = bias[oc];
                            for ic in 0..in_c {
                                for kh in 0..kernel {
                                    let ih = (oh * stride + kh) as isize - padding as isize;
                                    if ih < 0 || ih as usize >= in_h {
                                        continue;
                                    }
                                    for kw in 0..kernel {
                                        let iw = (ow * stride + kw) as isize - padding as isize;
                                        if iw < 0 || iw as usize >= in_w {
                                            continue;
                                        }
                                        let wi = ((oc * in_c + ic) * kernel + kh) * kernel + kw;
                                        acc += weights[wi]
                                            * src[src_desc.offset(n, ic, od, ih as usize, iw as usize)];
                                    }
                                }
                            }
                            out[dst_plain.offset(0, oc, od, oh, ow)] = acc;
                        }
                    }
                }
            }
        };

        if let Some(reorder) = dst_reorder {
            for_each_sample(dst_scratch.as_mut_slice(), sample_len, threads, compute);
            reorder.execute(dst_scratch.as_slice(), base.neurons.as_mut_slice(), batch, false);
        } else {
            debug_assert_eq!(desc, dst_plain);
            for_each_sample(base.neurons.as_mut_slice(), sample_len, threads, compute);
        }
    }

    pub fn backward(&mut self, base: &mut LayerBase, inputs: &mut [&mut LayerBase], batch: usize) {
        let dst_plain = self.dst_plain;
        let src_desc = self.src_desc;
        let (kernel, stride, padding) = (self.kernel, self.stride, self.padding);
        let (in_c, out_c) = (self.in_c, self.out_c);
        let (dim_d, out_h, out_w) = (base.d, base.h, base.w);
        let (in_h, in_w) = (src_desc.h, src_desc.w);
        let threads = partition(batch * base.cdhw(), base.kind.cost_weight());

        let Self {
            src_reorder,
            src_scratch,
            d_dst_reorder,
            d_dst_scratch,
            d_src_scratch,
            weights,
            grad_weights,
            grad_bias,
            ..
        } = self;

        let d_dst: &[f32] = if let Some(reorder) = d_dst_reorder {
            reorder.execute(base.neurons_d1.as_slice(), d_dst_scratch.as_mut_slice(), batch, false);
            d_dst_scratch.as_slice()
        } else {
            base.neurons_d1.as_slice()
        };
        let src: &[f32] = if src_reorder.is_some() {
            src_scratch.as_slice()
        } else {
            inputs[0].neurons.as_slice()
        };

        // Parameter gradients stay serial; every sample touches every filter
        // tap, so a batch fan-out would race on the accumulators.
        for n in 0..batch {
            for oc in 0..out_c {
                for od in 0..dim_d {
                    for oh in 0..out_h {
                        for ow in 0..out_w {
                            let g = d_dst[dst_plain.offset(n, oc, od, oh, ow)];
                            grad_bias[oc] += g;
                            for ic in 0..in_c {
                                for kh in 0..kernel {
                                    let ih = (oh * stride + kh) as isize - padding as isize;
                                    if ih < 0 || ih as usize >= in_h {
                                        continue;
                                    }
                                    for kw in 0..kernel {
                                        let iw = (ow * stride + kw) as isize - padding as isize;
                                        if iw < 0 || iw as usize >= in_w {
                                            continue;
                                        }
                                        let wi = ((oc * in_c + ic) * kernel + kh) * kernel + kw;
                                        grad_weights[wi] += g
                                            * src[src_desc.offset(n, ic, od, ih as usize, iw as usize)];
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }

        // Input gradient, one sample per chunk.
        let weights: &[f32] = weights;
        let src_len = src_desc.elements();
        for_each_sample(d_src_scratch.as_mut_slice(), src_len, threads, |n, out| {
            out.fill(0.0);
            for oc in 0..out_c {
                for od in 0..dim_d {
                    for oh in 0..out_h {
                        for ow in 0..out_w {
                            let g = d_dst[dst_plain.offset(n, oc, od, oh, ow)];
                            for ic in 0..in_c {
                                for kh in 0..kernel {
                                    let ih = (oh * stride + kh) as isize - padding as isize;
                                    if ih < 0 || ih as usize >= in_h {
                                        continue;
                                    }
                                    for kw in 0..kernel {
                                        let iw = (ow * stride + kw) as isize - padding as isize;
                                        if iw < 0 || iw as usize >= in_w {
                                            continue;
                                        }
                                        let wi = ((oc * in_c + ic) * kernel + kh) * kernel + kw;
                                        out[src_desc.offset(0, ic, od, ih as usize, iw as usize)] +=
                                            weights[wi] * g;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        });

        let shared = base.input_shared[0];
        emit_gradient(self.d_src_scratch.as_slice(), &src_desc, inputs[0], batch, shared);
    }

    pub fn reset_weights(&mut self, filler: Filler, rng: &mut SimpleRng) {
        let fan_in = self.in_c * self.kernel * self.kernel;
        let fan_out = self.out_c * self.kernel * self.kernel;
        filler.fill(&mut self.weights, fan_in, fan_out, rng);
        self.bias.fill(0.0);
        self.grad_weights.fill(0.0);
        self.grad_bias.fill(0.0);
    }

    pub fn apply_update(&mut self, slot: usize, opt: &mut dyn Optimizer) {
        opt.update(slot, &mut self.weights, &self.grad_weights);
        opt.update(slot + 1, &mut self.bias, &self.grad_bias);
        self.grad_weights.fill(0.0);
        self.grad_bias.fill(0.0);
    }

    pub fn save(&self, writer: &mut dyn Write) -> io::Result<()> {
        write_f32s(writer, &self.weights)?;
        write_f32s(writer, &self.bias)
    }

    pub fn load(&mut self, reader: &mut dyn Read) -> io::Result<()> {
        read_f32s(reader, &mut self.weights)?;
        read_f32s(reader, &mut self.bias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_extent() {
        let conv = ConvLayer::new(8, 3, 1, 1);
        assert_eq!(conv.out_extent(32), 32);
        let strided = ConvLayer::new(8, 3, 2, 1);
        assert_eq!(strided.out_extent(32), 16);
        let valid = ConvLayer::new(8, 5, 1, 0);
        assert_eq!(valid.out_extent(32), 28);
    }

    #[test]
    #[should_panic(expected = "kernel and stride")]
    fn test_zero_kernel_rejected() {
        let _ = ConvLayer::new(8, 0, 1, 0);
    }
}
