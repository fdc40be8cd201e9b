//! Spatial pooling layers.
//!
//! All three kernels run in plain layout over H and W, carrying depth through
//! unchanged; a blocked producer is reordered at the boundary and the output
//! descriptor stays plain. Max pooling caches the winning input offset per
//! output element so backward is a plain scatter.

use crate::error::GraphError;
use crate::format::{negotiate, FormatPolicy, MemDesc, MemoryFormat, Reorder};
use crate::tensor::TensorBuffer;
use crate::threading::{for_each_sample, partition};

use super::{emit_gradient, LayerBase};

/// Source-boundary state shared by the pooling kinds.
#[derive(Debug)]
struct PoolBoundary {
    src_reorder: Option<Reorder>,
    src_desc: MemDesc,
    src_scratch: TensorBuffer,
    d_src_scratch: TensorBuffer,
}

impl PoolBoundary {
    fn new() -> Self {
        Self {
            src_reorder: None,
            src_desc: MemDesc::new(MemoryFormat::Plain, 0, 1, 1, 1),
            src_scratch: TensorBuffer::new(),
            d_src_scratch: TensorBuffer::new(),
        }
    }

    fn init(&mut self, prev: &LayerBase, batch: usize) {
        let prev_desc = *prev.desc();
        let plain = MemDesc::new(MemoryFormat::Plain, prev.c, prev.d, prev.h, prev.w);
        if prev_desc.format != MemoryFormat::Plain {
            self.src_reorder = Some(Reorder::new(prev_desc, plain));
            self.src_scratch.resize(batch * plain.elements(), Some(plain), 0.0);
        } else {
            self.src_reorder = None;
            self.src_scratch.resize(0, None, 0.0);
        }
        self.src_desc = plain;
        self.d_src_scratch.resize(batch * plain.elements(), Some(plain), 0.0);
    }

    fn forward_view<'a>(&'a mut self, prev: &'a LayerBase, batch: usize) -> &'a [f32] {
        if let Some(reorder) = &self.src_reorder {
            reorder.execute(prev.neurons.as_slice(), self.src_scratch.as_mut_slice(), batch, false);
            self.src_scratch.as_slice()
        } else {
            prev.neurons.as_slice()
        }
    }
}

#[derive(Debug)]
pub struct MaxPoolLayer {
    kernel: usize,
    stride: usize,
    /// Per output element, the winning sample-local input offset.
    argmax: Vec<usize>,
    boundary: PoolBoundary,
}

impl MaxPoolLayer {
    pub fn new(kernel: usize, stride: usize) -> Self {
        assert!(kernel > 0 && stride > 0, "kernel and stride must be positive");
        Self {
            kernel,
            stride,
            argmax: Vec::new(),
            boundary: PoolBoundary::new(),
        }
    }

    fn out_extent(&self, input: usize) -> usize {
        (input - self.kernel) / self.stride + 1
    }

    pub fn init_descriptors(
        &mut self,
        base: &mut LayerBase,
        prevs: &[&LayerBase],
        batch: usize,
        _policy: FormatPolicy,
    ) -> Result<(), GraphError> {
        let prev = prevs[0];
        if prev.h < self.kernel || prev.w < self.kernel {
            return Err(GraphError::ShapeMismatch {
                layer: base.name.clone(),
                details: format!(
                    "pooling window {} does not fit input {}x{}",
                    self.kernel, prev.h, prev.w
                ),
            });
        }
        base.set_shape(prev.c, prev.d, self.out_extent(prev.h), self.out_extent(prev.w));
        let desc = negotiate(base.c, base.d, base.h, base.w, None, true, FormatPolicy::PlainOnly);
        base.dst_desc = Some(desc);
        base.diff_dst_desc = Some(desc);
        self.boundary.init(prev, batch);
        self.argmax = vec![0; batch * desc.elements()];
        Ok(())
    }

    pub fn update_resolution(&mut self, base: &mut LayerBase, prevs: &[&LayerBase]) {
        let prev = prevs[0];
        base.set_shape(prev.c, prev.d, self.out_extent(prev.h), self.out_extent(prev.w));
    }

    pub fn forward(&mut self, base: &mut LayerBase, inputs: &[&LayerBase], batch: usize) {
        let desc = *base.desc();
        let src_desc = self.boundary.src_desc;
        let (kernel, stride) = (self.kernel, self.stride);
        let (channels, dim_d, out_h, out_w) = (base.c, base.d, base.h, base.w);
        let sample_len = desc.elements();
        let src_len = src_desc.elements();
        let threads = partition(batch * base.cdhw(), base.kind.cost_weight());

        let src = self.boundary.forward_view(inputs[0], batch);
        let argmax = &mut self.argmax;

        // Sample-parallel over the output paired with its argmax stripe.
        let out = base.neurons.as_mut_slice();
        let run = |n: usize, out: &mut [f32], arg: &mut [usize]| {
            for c in 0..channels {
                for od in 0..dim_d {
                    for oh in 0..out_h {
                        for ow in 0..out_w {
                            let mut best = f32::NEG_INFINITY;
                            let mut best_at = 0usize;
                            for kh in 0..kernel {
                                for kw in 0..kernel {
                                    let at = src_desc.offset(0, c, od, oh * stride + kh, ow * stride + kw);
                                    let v = src[n * src_len + at];
                                    if v > best {
                                        best = v;
                                        best_at = at;
                                    }
                                }
                            }
                            let li = desc.offset(0, c, od, oh, ow);
                            out[li] = best;
                            arg[li] = best_at;
                        }
                    }
                }
            }
        };
        if threads <= 1 || batch <= 1 {
            for (n, (o, a)) in out
                .chunks_mut(sample_len)
                .zip(argmax.chunks_mut(sample_len))
                .enumerate()
            {
                run(n, o, a);
            }
        } else {
            use rayon::prelude::*;
            let min = batch.div_ceil(threads);
            out.par_chunks_mut(sample_len)
                .zip(argmax.par_chunks_mut(sample_len))
                .with_min_len(min)
                .enumerate()
                .for_each(|(n, (o, a))| run(n, o, a));
        }
    }

    pub fn backward(&mut self, base: &mut LayerBase, inputs: &mut [&mut LayerBase], batch: usize) {
        let desc = *base.diff_desc();
        let src_desc = self.boundary.src_desc;
        let (channels, dim_d, out_h, out_w) = (base.c, base.d, base.h, base.w);
        let sample_len = desc.elements();
        let src_len = src_desc.elements();
        let threads = partition(batch * base.cdhw(), base.kind.cost_weight());

        {
            let d1 = base.neurons_d1.as_slice();
            let argmax: &[usize] = &self.argmax;
            for_each_sample(self.boundary.d_src_scratch.as_mut_slice(), src_len, threads, |n, out| {
                out.fill(0.0);
                for c in 0..channels {
                    for od in 0..dim_d {
                        for oh in 0..out_h {
                            for ow in 0..out_w {
                                let li = desc.offset(0, c, od, oh, ow);
                                // Overlapping windows may pick the same input.
                                out[argmax[n * sample_len + li]] += d1[n * sample_len + li];
                            }
                        }
                    }
                }
            });
        }

        let shared = base.input_shared[0];
        emit_gradient(self.boundary.d_src_scratch.as_slice(), &src_desc, inputs[0], batch, shared);
    }
}

#[derive(Debug)]
pub struct AvgPoolLayer {
    kernel: usize,
    stride: usize,
    boundary: PoolBoundary,
}

impl AvgPoolLayer {
    pub fn new(kernel: usize, stride: usize) -> Self {
        assert!(kernel > 0 && stride > 0, "kernel and stride must be positive");
        Self {
            kernel,
            stride,
            boundary: PoolBoundary::new(),
        }
    }

    fn out_extent(&self, input: usize) -> usize {
        (input - self.kernel) / self.stride + 1
    }

    pub fn init_descriptors(
        &mut self,
        base: &mut LayerBase,
        prevs: &[&LayerBase],
        batch: usize,
        _policy: FormatPolicy,
    ) -> Result<(), GraphError> {
        let prev = prevs[0];
        if prev.h < self.kernel || prev.w < self.kernel {
            return Err(GraphError::ShapeMismatch {
                layer: base.name.clone(),
                details: format!(
                    "pooling window {} does not fit input {}x{}",
                    self.kernel, prev.h, prev.w
                ),
            });
        }
        base.set_shape(prev.c, prev.d, self.out_extent(prev.h), self.out_extent(prev.w));
        let desc = negotiate(base.c, base.d, base.h, base.w, None, true, FormatPolicy::PlainOnly);
        base.dst_desc = Some(desc);
        base.diff_dst_desc = Some(desc);
        self.boundary.init(prev, batch);
        Ok(())
    }

    pub fn update_resolution(&mut self, base: &mut LayerBase, prevs: &[&LayerBase]) {
        let prev = prevs[0];
        base.set_shape(prev.c, prev.d, self.out_extent(prev.h), self.out_extent(prev.w));
    }

    pub fn forward(&mut self, base: &mut LayerBase, inputs: &[&LayerBase], batch: usize) {
        let desc = *base.desc();
        let src_desc = self.boundary.src_desc;
        let (kernel, stride) = (self.kernel, self.stride);
        let (channels, dim_d, out_h, out_w) = (base.c, base.d, base.h, base.w);
        let sample_len = desc.elements();
        let src_len = src_desc.elements();
        let threads = partition(batch * base.cdhw(), base.kind.cost_weight());
        let norm = 1.0 / (kernel * kernel) as f32;

        let src = self.boundary.forward_view(inputs[0], batch);
        for_each_sample(base.neurons.as_mut_slice(), sample_len, threads, |n, out| {
            for c in 0..channels {
                for od in 0..dim_d {
                    for oh in 0..out_h {
                        for ow in 0..out_w {
                            let mut acc = 0.0f32;
                            for kh in 0..kernel {
                                for kw in 0..kernel {
                                    let at = src_desc.offset(0, c, od, oh * stride + kh, ow * stride + kw);
                                    acc += src[n * src_len + at];
                                }
                            }
                            out[desc.offset(0, c, od, oh, ow)] = acc * norm;
                        }
                    }
                }
            }
        });
    }

    pub fn backward(&mut self, base: &mut LayerBase, inputs: &mut [&mut LayerBase], batch: usize) {
        let desc = *base.diff_desc();
        let src_desc = self.boundary.src_desc;
        let (kernel, stride) = (self.kernel, self.stride);
        let (channels, dim_d, out_h, out_w) = (base.c, base.d, base.h, base.w);
        let sample_len = desc.elements();
        let src_len = src_desc.elements();
        let threads = partition(batch * base.cdhw(), base.kind.cost_weight());
        let norm = 1.0 / (kernel * kernel) as f32;

        {
            let d1 = base.neurons_d1.as_slice();
            for_each_sample(self.boundary.d_src_scratch.as_mut_slice(), src_len, threads, |n, out| {
                out.fill(0.0);
                for c in 0..channels {
                    for od in 0..dim_d {
                        for oh in 0..out_h {
                            for ow in 0..out_w {
                                let g = d1[n * sample_len + desc.offset(0, c, od, oh, ow)] * norm;
                                for kh in 0..kernel {
                                    for kw in 0..kernel {
                                        let at = src_desc
                                            .offset(0, c, od, oh * stride + kh, ow * stride + kw);
                                        out[at] += g;
                                    }
                                }
                            }
                        }
                    }
                }
            });
        }

        let shared = base.input_shared[0];
        emit_gradient(self.boundary.d_src_scratch.as_slice(), &src_desc, inputs[0], batch, shared);
    }
}

/// Collapses H and W to a single value per channel; depth is preserved.
#[derive(Debug)]
pub struct GlobalAvgPoolLayer {
    boundary: PoolBoundary,
}

impl GlobalAvgPoolLayer {
    pub fn new() -> Self {
        Self {
            boundary: PoolBoundary::new(),
        }
    }

    pub fn init_descriptors(
        &mut self,
        base: &mut LayerBase,
        prevs: &[&LayerBase],
        batch: usize,
        _policy: FormatPolicy,
    ) -> Result<(), GraphError> {
        let prev = prevs[0];
        base.set_shape(prev.c, prev.d, 1, 1);
        let desc = negotiate(base.c, base.d, 1, 1, None, true, FormatPolicy::PlainOnly);
        base.dst_desc = Some(desc);
        base.diff_dst_desc = Some(desc);
        self.boundary.init(prev, batch);
        Ok(())
    }

    pub fn update_resolution(&mut self, base: &mut LayerBase, prevs: &[&LayerBase]) {
        let prev = prevs[0];
        base.set_shape(prev.c, prev.d, 1, 1);
    }

    pub fn forward(&mut self, base: &mut LayerBase, inputs: &[&LayerBase], batch: usize) {
        let desc = *base.desc();
        let src_desc = self.boundary.src_desc;
        let (channels, dim_d) = (base.c, base.d);
        let (in_h, in_w) = (src_desc.h, src_desc.w);
        let sample_len = desc.elements();
        let src_len = src_desc.elements();
        let threads = partition(batch * base.cdhw(), base.kind.cost_weight());
        let norm = 1.0 / (in_h * in_w) as f32;

        let src = self.boundary.forward_view(inputs[0], batch);
        for_each_sample(base.neurons.as_mut_slice(), sample_len, threads, |n, out| {
            for c in 0..channels {
                for od in 0..dim_d {
                    let mut acc = 0.0f32;
                    for hh in 0..in_h {
                        for ww in 0..in_w {
                            acc += src[n * src_len + src_desc.offset(0, c, od, hh, ww)];
                        }
                    }
                    out[desc.offset(0, c, od, 0, 0)] = acc * norm;
                }
            }
        });
    }

    pub fn backward(&mut self, base: &mut LayerBase, inputs: &mut [&mut LayerBase], batch: usize) {
        let desc = *base.diff_desc();
        let src_desc = self.boundary.src_desc;
        let (channels, dim_d) = (base.c, base.d);
        let (in_h, in_w) = (src_desc.h, src_desc.w);
        let sample_len = desc.elements();
        let src_len = src_desc.elements();
        let threads = partition(batch * base.cdhw(), base.kind.cost_weight());
        let norm = 1.0 / (in_h * in_w) as f32;

        {
            let d1 = base.neurons_d1.as_slice();
            for_each_sample(self.boundary.d_src_scratch.as_mut_slice(), src_len, threads, |n, out| {
                out.fill(0.0);
                for c in 0..channels {
                    for od in 0..dim_d {
                        let g = d1[n * sample_len + desc.offset(0, c, od, 0, 0)] * norm;
                        for hh in 0..in_h {
                            for ww in 0..in_w {
                                out[src_desc.offset(0, c, od, hh, ww)] = g;
                            }
                        }
                    }
                }
            });
        }

        let shared = base.input_shared[0];
        emit_gradient(self.boundary.d_src_scratch.as_slice(), &src_desc, inputs[0], batch, shared);
    }
}

impl Default for GlobalAvgPoolLayer {
    fn default() -> Self {
        Self::new()
    }
}
