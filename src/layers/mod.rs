//! Layer kinds and the polymorphic execution contract.
//!
//! Every concrete layer implements the same lifecycle, driven by the graph:
//!
//! `Uninitialized -> DescriptorsReady -> {ForwardDone <-> BackwardDone}`
//!
//! - `init_descriptors` chooses the output memory descriptor through the
//!   format negotiator, builds any boundary reorders and sizes scratch
//!   buffers; it is idempotent and re-run after batch or resolution changes.
//! - `forward` reads producer activations and fully defines its own,
//!   padding channels included (padding is always zero).
//! - `backward` reads its own gradient and writes the producers' gradients,
//!   accumulating or overwriting per the gradient router's per-edge decision.
//! - `update_resolution` recomputes spatial dims from the producer after the
//!   input layer's resolution changes.
//!
//! Dispatch is a closed enum over the kind set rather than trait objects: the
//! set of layer kinds is fixed, and a `match` keeps the per-kind kernels
//! monomorphic.

pub mod activation;
pub mod base;
pub mod batchnorm;
pub mod conv;
pub mod cost;
pub mod dense;
pub mod dropout;
pub mod fusion;
pub mod input;
pub mod pooling;

pub use activation::{ActivationKind, ActivationLayer};
pub use base::LayerBase;
pub use batchnorm::BatchNormLayer;
pub use conv::ConvLayer;
pub use cost::{CostKind, CostLayer};
pub use dense::DenseLayer;
pub use dropout::DropoutLayer;
pub use fusion::{FusionLayer, FusionOp};
pub use input::InputLayer;
pub use pooling::{AvgPoolLayer, GlobalAvgPoolLayer, MaxPoolLayer};

use crate::error::GraphError;
use crate::format::{FormatPolicy, MemDesc, Reorder};
use crate::optimizers::Optimizer;
use crate::utils::SimpleRng;
use std::io::{self, Read, Write};

/// Tag identifying a layer's kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Input,
    Dense,
    Convolution,
    BatchNormActivation,
    Activation,
    Dropout,
    MaxPooling,
    AvgPooling,
    GlobalAvgPooling,
    Add,
    Average,
    Substract,
    Cost,
}

impl LayerKind {
    /// Whether the layer can adopt a producer's blocked layout; plain-only
    /// kernels force a plain source and get reorders at the boundary.
    pub fn format_flexible(self) -> bool {
        matches!(
            self,
            LayerKind::BatchNormActivation
                | LayerKind::Activation
                | LayerKind::Dropout
                | LayerKind::Add
                | LayerKind::Average
                | LayerKind::Substract
        )
    }

    /// Relative per-element cost fed to the work partitioner.
    pub fn cost_weight(self) -> f32 {
        match self {
            LayerKind::Convolution => 16.0,
            LayerKind::Dense => 8.0,
            LayerKind::BatchNormActivation => 4.0,
            LayerKind::MaxPooling | LayerKind::AvgPooling | LayerKind::GlobalAvgPooling => 2.0,
            _ => 1.0,
        }
    }

    pub fn is_fusion(self) -> bool {
        matches!(self, LayerKind::Add | LayerKind::Average | LayerKind::Substract)
    }

    pub fn has_weights(self) -> bool {
        matches!(
            self,
            LayerKind::Dense | LayerKind::Convolution | LayerKind::BatchNormActivation
        )
    }

    /// Number of producers the kind is wired with.
    pub fn input_arity(self) -> usize {
        match self {
            LayerKind::Input => 0,
            k if k.is_fusion() => 2,
            _ => 1,
        }
    }
}

/// Weight initialization policy for `reset_weights`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Filler {
    /// Uniform in `[-limit, limit]`, `limit = sqrt(6 / (fan_in + fan_out))`.
    XavierUniform,
    /// Normal with stddev `sqrt(2 / fan_in)`.
    HeNormal,
    Constant(f32),
}

impl Filler {
    pub fn fill(&self, values: &mut [f32], fan_in: usize, fan_out: usize, rng: &mut SimpleRng) {
        match *self {
            Filler::XavierUniform => {
                let limit = (6.0f32 / (fan_in + fan_out) as f32).sqrt();
                for v in values.iter_mut() {
                    *v = rng.gen_range_f32(-limit, limit);
                }
            }
            Filler::HeNormal => {
                let std = (2.0f32 / fan_in.max(1) as f32).sqrt();
                for v in values.iter_mut() {
                    *v = rng.gen_normal() * std;
                }
            }
            Filler::Constant(c) => {
                for v in values.iter_mut() {
                    *v = c;
                }
            }
        }
    }
}

/// Closed set of layer implementations, dispatched by `match`.
#[derive(Debug)]
pub enum LayerImpl {
    Input(InputLayer),
    Dense(DenseLayer),
    Convolution(ConvLayer),
    BatchNormActivation(BatchNormLayer),
    Activation(ActivationLayer),
    Dropout(DropoutLayer),
    MaxPooling(MaxPoolLayer),
    AvgPooling(AvgPoolLayer),
    GlobalAvgPooling(GlobalAvgPoolLayer),
    Fusion(FusionLayer),
    Cost(CostLayer),
}

impl LayerImpl {
    /// Negotiate descriptors, build reorders and size scratch storage.
    ///
    /// `force_plain` is set by the graph for layers whose consumers require a
    /// plain source (the layer feeding a cost layer in particular).
    pub fn init_descriptors(
        &mut self,
        base: &mut LayerBase,
        prevs: &[&LayerBase],
        batch: usize,
        policy: FormatPolicy,
        force_plain: bool,
    ) -> Result<(), GraphError> {
        match self {
            LayerImpl::Input(l) => l.init_descriptors(base, policy),
            LayerImpl::Dense(l) => l.init_descriptors(base, prevs, batch, policy),
            LayerImpl::Convolution(l) => l.init_descriptors(base, prevs, batch, policy, force_plain),
            LayerImpl::BatchNormActivation(l) => {
                l.init_descriptors(base, prevs, batch, policy, force_plain)
            }
            LayerImpl::Activation(l) => l.init_descriptors(base, prevs, batch, policy, force_plain),
            LayerImpl::Dropout(l) => l.init_descriptors(base, prevs, batch, policy, force_plain),
            LayerImpl::MaxPooling(l) => l.init_descriptors(base, prevs, batch, policy),
            LayerImpl::AvgPooling(l) => l.init_descriptors(base, prevs, batch, policy),
            LayerImpl::GlobalAvgPooling(l) => l.init_descriptors(base, prevs, batch, policy),
            LayerImpl::Fusion(l) => l.init_descriptors(base, prevs, batch, policy, force_plain),
            LayerImpl::Cost(l) => l.init_descriptors(base, prevs, batch),
        }
    }

    /// Forward propagation; leaves `base.neurons` fully defined.
    pub fn forward(&mut self, base: &mut LayerBase, inputs: &[&LayerBase], batch: usize, training: bool) {
        match self {
            LayerImpl::Input(_) => {}
            LayerImpl::Dense(l) => l.forward(base, inputs, batch),
            LayerImpl::Convolution(l) => l.forward(base, inputs, batch),
            LayerImpl::BatchNormActivation(l) => l.forward(base, inputs, batch, training),
            LayerImpl::Activation(l) => l.forward(base, inputs, batch),
            LayerImpl::Dropout(l) => l.forward(base, inputs, batch, training),
            LayerImpl::MaxPooling(l) => l.forward(base, inputs, batch),
            LayerImpl::AvgPooling(l) => l.forward(base, inputs, batch),
            LayerImpl::GlobalAvgPooling(l) => l.forward(base, inputs, batch),
            LayerImpl::Fusion(l) => l.forward(base, inputs, batch),
            LayerImpl::Cost(l) => l.forward(base, inputs, batch),
        }
    }

    /// Backward propagation; writes the producers' `neurons_d1`.
    ///
    /// Layers flagged `inplace_bwd` instead transform their own gradient
    /// buffer in place; the graph driver then moves the storage to the
    /// producer.
    pub fn backward(&mut self, base: &mut LayerBase, inputs: &mut [&mut LayerBase], batch: usize) {
        match self {
            LayerImpl::Input(_) => {}
            LayerImpl::Dense(l) => l.backward(base, inputs, batch),
            LayerImpl::Convolution(l) => l.backward(base, inputs, batch),
            LayerImpl::BatchNormActivation(l) => l.backward(base, inputs, batch),
            LayerImpl::Activation(l) => l.backward(base, inputs, batch),
            LayerImpl::Dropout(l) => l.backward(base, inputs, batch),
            LayerImpl::MaxPooling(l) => l.backward(base, inputs, batch),
            LayerImpl::AvgPooling(l) => l.backward(base, inputs, batch),
            LayerImpl::GlobalAvgPooling(l) => l.backward(base, inputs, batch),
            LayerImpl::Fusion(l) => l.backward(base, inputs, batch),
            LayerImpl::Cost(l) => l.backward(base, inputs, batch),
        }
    }

    /// Recompute D/H/W from the producer after a resolution change.
    pub fn update_resolution(&mut self, base: &mut LayerBase, prevs: &[&LayerBase]) {
        match self {
            LayerImpl::Input(_) => {}
            LayerImpl::Convolution(l) => l.update_resolution(base, prevs),
            LayerImpl::MaxPooling(l) => l.update_resolution(base, prevs),
            LayerImpl::AvgPooling(l) => l.update_resolution(base, prevs),
            LayerImpl::GlobalAvgPooling(l) => l.update_resolution(base, prevs),
            LayerImpl::Dense(_) => {
                // Dense flattens its producer; its own shape is fixed.
            }
            _ => {
                // Shape-preserving kinds track their first producer.
                if let Some(p) = prevs.first() {
                    base.set_shape(p.c, p.d, p.h, p.w);
                }
            }
        }
    }

    /// Reinitialize weights from a filler policy (weighted layers only).
    pub fn reset_weights(&mut self, filler: Filler, rng: &mut SimpleRng) {
        match self {
            LayerImpl::Dense(l) => l.reset_weights(filler, rng),
            LayerImpl::Convolution(l) => l.reset_weights(filler, rng),
            LayerImpl::BatchNormActivation(l) => l.reset_weights(),
            _ => {}
        }
    }

    /// Value the gradient buffer is reset to before backward accumulation.
    ///
    /// 0 for every current kind: all backward kernels add into or overwrite
    /// the buffer. A kind whose backward multiplies through its own gradient
    /// would override this with 1.
    pub fn zero_gradient(&self) -> f32 {
        0.0
    }

    pub fn parameter_count(&self) -> usize {
        match self {
            LayerImpl::Dense(l) => l.parameter_count(),
            LayerImpl::Convolution(l) => l.parameter_count(),
            LayerImpl::BatchNormActivation(l) => l.parameter_count(),
            _ => 0,
        }
    }

    /// Apply the optimizer to this layer's parameters and clear the
    /// accumulated gradients. `slot` is the graph-assigned stable id that
    /// keys per-tensor optimizer state.
    pub fn apply_update(&mut self, slot: usize, opt: &mut dyn Optimizer) {
        match self {
            LayerImpl::Dense(l) => l.apply_update(slot, opt),
            LayerImpl::Convolution(l) => l.apply_update(slot, opt),
            LayerImpl::BatchNormActivation(l) => l.apply_update(slot, opt),
            _ => {}
        }
    }

    /// Serialize parameters as contiguous little-endian f32 blocks.
    pub fn save(&self, writer: &mut dyn Write) -> io::Result<()> {
        match self {
            LayerImpl::Dense(l) => l.save(writer),
            LayerImpl::Convolution(l) => l.save(writer),
            LayerImpl::BatchNormActivation(l) => l.save(writer),
            _ => Ok(()),
        }
    }

    /// Deserialize parameters previously written by [`save`](Self::save).
    pub fn load(&mut self, reader: &mut dyn Read) -> io::Result<()> {
        match self {
            LayerImpl::Dense(l) => l.load(reader),
            LayerImpl::Convolution(l) => l.load(reader),
            LayerImpl::BatchNormActivation(l) => l.load(reader),
            _ => Ok(()),
        }
    }
}

/// Write a gradient computed in `src_desc` layout into the producer's
/// gradient buffer, accumulating when the edge is shared.
///
/// When the layouts agree this is a flat add or copy; otherwise the reorder
/// converts (and optionally accumulates) only the real channels, which keeps
/// the producer's padding channels at zero.
pub(crate) fn emit_gradient(
    src: &[f32],
    src_desc: &MemDesc,
    prev: &mut LayerBase,
    batch: usize,
    shared: bool,
) {
    let dst_desc = *prev.diff_desc();
    let dst = prev.neurons_d1.as_mut_slice();
    assert_eq!(src.len(), dst.len(), "gradient emission size mismatch");

    if *src_desc == dst_desc {
        if shared {
            for (d, s) in dst.iter_mut().zip(src.iter()) {
                *d += *s;
            }
        } else {
            dst.copy_from_slice(src);
        }
    } else {
        Reorder::new(*src_desc, dst_desc).execute(src, dst, batch, shared);
    }
}

pub(crate) fn write_f32s(writer: &mut dyn Write, values: &[f32]) -> io::Result<()> {
    for &v in values {
        writer.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

pub(crate) fn read_f32s(reader: &mut dyn Read, values: &mut [f32]) -> io::Result<()> {
    let mut bytes = [0u8; 4];
    for v in values.iter_mut() {
        reader.read_exact(&mut bytes)?;
        *v = f32::from_le_bytes(bytes);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_arity() {
        assert_eq!(LayerKind::Input.input_arity(), 0);
        assert_eq!(LayerKind::Convolution.input_arity(), 1);
        assert_eq!(LayerKind::Add.input_arity(), 2);
        assert_eq!(LayerKind::Substract.input_arity(), 2);
    }

    #[test]
    fn test_kind_format_flexibility() {
        assert!(LayerKind::Activation.format_flexible());
        assert!(LayerKind::Average.format_flexible());
        assert!(!LayerKind::Convolution.format_flexible());
        assert!(!LayerKind::Cost.format_flexible());
    }

    #[test]
    fn test_filler_constant() {
        let mut rng = SimpleRng::new(1);
        let mut v = vec![0.0f32; 4];
        Filler::Constant(0.5).fill(&mut v, 1, 1, &mut rng);
        assert!(v.iter().all(|&x| x == 0.5));
    }

    #[test]
    fn test_filler_xavier_bounds() {
        let mut rng = SimpleRng::new(42);
        let mut v = vec![0.0f32; 1000];
        Filler::XavierUniform.fill(&mut v, 100, 50, &mut rng);
        let limit = (6.0f32 / 150.0).sqrt();
        for &x in &v {
            assert!(x >= -limit && x <= limit, "{} outside [{}, {}]", x, -limit, limit);
        }
    }

    #[test]
    fn test_f32_round_trip() {
        let values = vec![1.5f32, -2.25, 0.0, f32::MIN_POSITIVE];
        let mut bytes = Vec::new();
        write_f32s(&mut bytes, &values).unwrap();
        let mut back = vec![0.0f32; values.len()];
        read_f32s(&mut bytes.as_slice(), &mut back).unwrap();
        assert_eq!(values, back);
    }
}
