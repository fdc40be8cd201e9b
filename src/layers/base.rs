//! Shared per-layer state: identity, shape, topology, flags and buffers.

use crate::format::MemDesc;
use crate::tensor::TensorBuffer;

use super::LayerKind;

/// State common to every layer in the graph.
///
/// A layer never owns its producers or consumers; `inputs` and `outputs` are
/// indices into the graph's arena, resolved once after construction. Inputs
/// always precede the layer itself in the arena, which is what makes the
/// topological forward order identical to the arena order.
#[derive(Debug)]
pub struct LayerBase {
    /// Unique name, compared case-insensitively across the graph.
    pub name: String,
    pub kind: LayerKind,

    // Logical shape. `padded_c` is `c` rounded up to the vector width and is
    // recomputed whenever `c` changes.
    pub c: usize,
    pub padded_c: usize,
    pub d: usize,
    pub h: usize,
    pub w: usize,

    /// Ordered producer indices (arena positions strictly before this layer).
    pub inputs: Vec<usize>,
    /// Derived consumer indices, unordered; filled by `set_relations`.
    pub outputs: Vec<usize>,
    /// Per input edge: the producer has fan-out >= 2, so gradient writes into
    /// it must accumulate rather than overwrite.
    pub input_shared: Vec<bool>,

    /// Backward may move its gradient buffer to the single producer instead
    /// of emitting into a separately owned one. Resolved at build time.
    pub inplace_bwd: bool,
    /// Stochastic depth: this layer's output is suppressed for the current
    /// training step. Never true at inference time.
    pub skip: bool,
    /// Layer participates in forward/backward (dropout-style toggles).
    pub enabled: bool,

    /// Forward activations, `batch * padded_cdhw` elements.
    pub neurons: TensorBuffer,
    /// Gradients w.r.t. the activations, same extent.
    pub neurons_d1: TensorBuffer,

    pub dst_desc: Option<MemDesc>,
    pub diff_dst_desc: Option<MemDesc>,

    /// Batch size the buffers are currently sized for.
    pub batch_size: usize,
}

impl LayerBase {
    pub fn new(
        name: impl Into<String>,
        kind: LayerKind,
        c: usize,
        d: usize,
        h: usize,
        w: usize,
        inputs: Vec<usize>,
    ) -> Self {
        let padded_c = c.div_ceil(crate::format::VEC_WIDTH) * crate::format::VEC_WIDTH;
        let arity = inputs.len();
        Self {
            name: name.into(),
            kind,
            c,
            padded_c,
            d,
            h,
            w,
            inputs,
            outputs: Vec::new(),
            input_shared: vec![false; arity],
            inplace_bwd: false,
            skip: false,
            enabled: true,
            neurons: TensorBuffer::new(),
            neurons_d1: TensorBuffer::new(),
            dst_desc: None,
            diff_dst_desc: None,
            batch_size: 0,
        }
    }

    /// Element count of one sample over real channels.
    #[inline]
    pub fn cdhw(&self) -> usize {
        self.c * self.d * self.h * self.w
    }

    /// Element count of one sample, padding channels included.
    #[inline]
    pub fn padded_cdhw(&self) -> usize {
        self.padded_c * self.d * self.h * self.w
    }

    #[inline]
    pub fn hw(&self) -> usize {
        self.h * self.w
    }

    /// True when any producer edge requires accumulation.
    pub fn shares_input(&self) -> bool {
        self.input_shared.iter().any(|&s| s)
    }

    /// Update the logical shape, recomputing the padded channel count.
    pub fn set_shape(&mut self, c: usize, d: usize, h: usize, w: usize) {
        self.c = c;
        self.padded_c = c.div_ceil(crate::format::VEC_WIDTH) * crate::format::VEC_WIDTH;
        self.d = d;
        self.h = h;
        self.w = w;
    }

    /// Output descriptor; panics when descriptors were never initialized.
    #[inline]
    pub fn desc(&self) -> &MemDesc {
        self.dst_desc
            .as_ref()
            .expect("descriptors not initialized; call init_descriptors first")
    }

    #[inline]
    pub fn diff_desc(&self) -> &MemDesc {
        self.diff_dst_desc
            .as_ref()
            .expect("descriptors not initialized; call init_descriptors first")
    }

    /// Reallocate the activation and gradient buffers for `batch` samples.
    ///
    /// Must not be called while a forward or backward pass is in flight; the
    /// engine does not lock around resizes (caller-enforced quiescence).
    pub fn set_batch_size(&mut self, batch: usize) {
        let desc = *self.desc();
        let diff = *self.diff_desc();
        debug_assert_eq!(desc.elements(), self.padded_cdhw());
        self.neurons.resize(batch * desc.elements(), Some(desc), 0.0);
        self.neurons_d1.resize(batch * diff.elements(), Some(diff), 0.0);
        self.batch_size = batch;
    }
}
