//! Fully connected layer backed by BLAS sgemm.
//!
//! The producer's activations are gathered into a dense `[batch, in_features]
//! matrix with the padding channels stripped, multiplied against the weight
//! matrix in one sgemm call, and scattered back into the padded output layout
//! with the bias added. Backward runs two more sgemm calls (weight gradient
//! and input gradient) over the same packed matrices.

use crate::error::GraphError;
use crate::format::{negotiate, FormatPolicy, MemDesc, MemoryFormat, Reorder};
use crate::optimizers::Optimizer;
use crate::tensor::TensorBuffer;
use crate::utils::SimpleRng;
use cblas::{Layout, Transpose};
use std::io::{self, Read, Write};

use super::{emit_gradient, read_f32s, write_f32s, Filler, LayerBase};

#[derive(Debug)]
pub struct DenseLayer {
    units: usize,
    in_features: usize,
    seed: u64,

    /// `[units, in_features]`, row major.
    weights: Vec<f32>,
    bias: Vec<f32>,
    grad_weights: Vec<f32>,
    grad_bias: Vec<f32>,

    src_reorder: Option<Reorder>,
    src_desc: MemDesc,
    src_scratch: TensorBuffer,

    /// Packed matrices with padding channels stripped.
    packed_src: Vec<f32>,
    packed_dst: Vec<f32>,
    packed_d_dst: Vec<f32>,
    packed_d_src: Vec<f32>,
    bwd_scratch: TensorBuffer,
}

impl DenseLayer {
    pub fn new(units: usize, seed: u64) -> Self {
        assert!(units > 0, "dense layer needs at least one unit");
        Self {
            units,
            in_features: 0,
            seed,
            weights: Vec::new(),
            bias: Vec::new(),
            grad_weights: Vec::new(),
            grad_bias: Vec::new(),
            src_reorder: None,
            src_desc: MemDesc::new(MemoryFormat::Plain, 0, 1, 1, 1),
            src_scratch: TensorBuffer::new(),
            packed_src: Vec::new(),
            packed_dst: Vec::new(),
            packed_d_dst: Vec::new(),
            packed_d_src: Vec::new(),
            bwd_scratch: TensorBuffer::new(),
        }
    }

    pub fn parameter_count(&self) -> usize {
        self.units * self.in_features + self.units
    }

    pub fn init_descriptors(
        &mut self,
        base: &mut LayerBase,
        prevs: &[&LayerBase],
        batch: usize,
        _policy: FormatPolicy,
    ) -> Result<(), GraphError> {
        let prev = prevs[0];
        let prev_desc = *prev.desc();
        let in_features = prev.cdhw();
        base.set_shape(self.units, 1, 1, 1);

        // The sgemm path reads a plain source; blocked producers get a
        // boundary reorder into a plain-layout scratch.
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

        let desc = negotiate(base.c, 1, 1, 1, None, true, FormatPolicy::PlainOnly);
        base.dst_desc = Some(desc);
        base.diff_dst_desc = Some(desc);

        if self.weights.is_empty() {
            self.in_features = in_features;
            self.weights = vec![0.0; self.units * in_features];
            self.grad_weights = vec![0.0; self.units * in_features];
            self.bias = vec![0.0; self.units];
            self.grad_bias = vec![0.0; self.units];
        } else if self.in_features != in_features {
            // A resolution change reshaped the fan-in under a live layer. The
            // old rows are meaningless at the new width, and all-zero weights
            // would back-propagate exactly zero, so redraw instead.
            self.in_features = in_features;
            self.weights = vec![0.0; self.units * in_features];
            self.grad_weights = vec![0.0; self.units * in_features];
            let mut rng = SimpleRng::new(self.seed ^ in_features as u64);
            Filler::HeNormal.fill(&mut self.weights, in_features, self.units, &mut rng);
            self.grad_bias.fill(0.0);
        }
        self.packed_src = vec![0.0; batch * in_features];
        self.packed_dst = vec![0.0; batch * self.units];
        self.packed_d_dst = vec![0.0; batch * self.units];
        self.packed_d_src = vec![0.0; batch * in_features];
        self.bwd_scratch
            .resize(batch * plain_src.elements(), Some(plain_src), 0.0);
        Ok(())
    }

    /// Copy real channels out of a plain padded buffer into a packed matrix.
    fn pack(src: &[f32], desc: &MemDesc, batch: usize, out: &mut [f32]) {
        let spatial = desc.d * desc.h * desc.w;
        let row = desc.c * spatial;
        for n in 0..batch {
            for c in 0..desc.c {
                let from = desc.offset(n, c, 0, 0, 0);
                let to = n * row + c * spatial;
                out[to..to + spatial].copy_from_slice(&src[from..from + spatial]);
            }
        }
    }

    /// Inverse of [`pack`](Self::pack); padding channels are left untouched.
    fn unpack(src: &[f32], desc: &MemDesc, batch: usize, out: &mut [f32]) {
        let spatial = desc.d * desc.h * desc.w;
        let row = desc.c * spatial;
        for n in 0..batch {
            for c in 0..desc.c {
                let from = n * row + c * spatial;
                let to = desc.offset(n, c, 0, 0, 0);
                out[to..to + spatial].copy_from_slice(&src[from..from + spatial]);
            }
        }
    }

    pub fn forward(&mut self, base: &mut LayerBase, inputs: &[&LayerBase], batch: usize) {
        let Self {
            src_reorder,
            src_scratch,
            packed_src,
            packed_dst,
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
        Self::pack(src, &self.src_desc, batch, packed_src);

        let (m, n, k) = (batch, self.units, self.in_features);
        unsafe {
            cblas::sgemm(
                Layout::RowMajor,
                Transpose::None,
                Transpose::Ordinary,
                m as i32,
                n as i32,
                k as i32,
                1.0,
                packed_src,
                k as i32,
                weights,
                k as i32,
                0.0,
                packed_dst,
                n as i32,
            );
        }

        let desc = *base.desc();
        let out = base.neurons.as_mut_slice();
        for s in 0..batch {
            for u in 0..self.units {
                out[desc.offset(s, u, 0, 0, 0)] = packed_dst[s * self.units + u] + bias[u];
            }
        }
    }

    pub fn backward(&mut self, base: &mut LayerBase, inputs: &mut [&mut LayerBase], batch: usize) {
        let desc = *base.diff_desc();
        let (units, in_features) = (self.units, self.in_features);

        {
            let d1 = base.neurons_d1.as_slice();
            for s in 0..batch {
                for u in 0..units {
                    self.packed_d_dst[s * units + u] = d1[desc.offset(s, u, 0, 0, 0)];
                }
            }
        }

        for u in 0..units {
            let mut acc = 0.0f32;
            for s in 0..batch {
                acc += self.packed_d_dst[s * units + u];
            }
            self.grad_bias[u] += acc;
        }

        // grad_w += d_dst^T * src; accumulates across the step via beta = 1.
        unsafe {
            cblas::sgemm(
                Layout::RowMajor,
                Transpose::Ordinary,
                Transpose::None,
                units as i32,
                in_features as i32,
                batch as i32,
                1.0,
                &self.packed_d_dst,
                units as i32,
                &self.packed_src,
                in_features as i32,
                1.0,
                &mut self.grad_weights,
                in_features as i32,
            );
        }

        // d_src = d_dst * W.
        unsafe {
            cblas::sgemm(
                Layout::RowMajor,
                Transpose::None,
                Transpose::None,
                batch as i32,
                in_features as i32,
                units as i32,
                1.0,
                &self.packed_d_dst,
                units as i32,
                &self.weights,
                in_features as i32,
                0.0,
                &mut self.packed_d_src,
                in_features as i32,
            );
        }

        Self::unpack(&self.packed_d_src, &self.src_desc, batch, self.bwd_scratch.as_mut_slice());
        let src_desc = self.src_desc;
        let shared = base.input_shared[0];
        emit_gradient(self.bwd_scratch.as_slice(), &src_desc, inputs[0], batch, shared);
    }

    pub fn reset_weights(&mut self, filler: Filler, rng: &mut SimpleRng) {
        filler.fill(&mut self.weights, self.in_features, self.units, rng);
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
    use crate::format::{MemDesc, MemoryFormat};

    #[test]
    fn test_pack_strips_padding() {
        // 3 real channels padded to 8, spatial 2x2.
        let desc = MemDesc::new(MemoryFormat::Plain, 3, 1, 2, 2);
        let mut src = vec![0.0f32; desc.elements()];
        for c in 0..3 {
            for i in 0..4 {
                src[desc.offset(0, c, 0, i / 2, i % 2)] = (c * 4 + i) as f32;
            }
        }
        let mut packed = vec![0.0f32; 12];
        DenseLayer::pack(&src, &desc, 1, &mut packed);
        let expect: Vec<f32> = (0..12).map(|i| i as f32).collect();
        assert_eq!(packed, expect);

        let mut back = vec![0.0f32; desc.elements()];
        DenseLayer::unpack(&packed, &desc, 1, &mut back);
        assert_eq!(back, src);
    }

    #[test]
    #[should_panic(expected = "at least one unit")]
    fn test_zero_units_rejected() {
        let _ = DenseLayer::new(0, 0);
    }
}
