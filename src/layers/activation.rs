//! Standalone activation layer.
//!
//! The per-kind math lives in an enum-indexed jump table ([`ActivationKind`])
//! shared with the fused batch-norm layer. A closed-form derivative is kept
//! next to each function; [`self_test`] cross-checks the pair against a
//! central finite difference and reports any activation whose derivative
//! disagrees. It is an advisory diagnostic, never run on the hot path.

use crate::error::GraphError;
use crate::format::{negotiate, zero_padding, FormatPolicy, Reorder};
use crate::tensor::TensorBuffer;
use crate::threading::{for_each_sample, partition};

use super::{emit_gradient, LayerBase};

/// Supported activation functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
    Relu,
    LeakyRelu,
    Elu,
    Gelu,
    Swish,
    Tanh,
    Sigmoid,
}

impl ActivationKind {
    pub const ALL: [ActivationKind; 7] = [
        ActivationKind::Relu,
        ActivationKind::LeakyRelu,
        ActivationKind::Elu,
        ActivationKind::Gelu,
        ActivationKind::Swish,
        ActivationKind::Tanh,
        ActivationKind::Sigmoid,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ActivationKind::Relu => "relu",
            ActivationKind::LeakyRelu => "leaky_relu",
            ActivationKind::Elu => "elu",
            ActivationKind::Gelu => "gelu",
            ActivationKind::Swish => "swish",
            ActivationKind::Tanh => "tanh",
            ActivationKind::Sigmoid => "sigmoid",
        }
    }

    /// Parse a kind from its lowercase config name.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.name() == name)
    }

    /// `f(x)`. `alpha` parameterizes leaky-relu (slope) and elu (scale); the
    /// other kinds ignore it.
    #[inline]
    pub fn apply(self, x: f32, alpha: f32) -> f32 {
        match self {
            ActivationKind::Relu => x.max(0.0),
            ActivationKind::LeakyRelu => {
                if x > 0.0 {
                    x
                } else {
                    alpha * x
                }
            }
            ActivationKind::Elu => {
                if x > 0.0 {
                    x
                } else {
                    alpha * (x.exp() - 1.0)
                }
            }
            ActivationKind::Gelu => {
                let inner = SQRT_2_OVER_PI * (x + GELU_COEFF * x * x * x);
                0.5 * x * (1.0 + inner.tanh())
            }
            ActivationKind::Swish => x * sigmoid(x),
            ActivationKind::Tanh => x.tanh(),
            ActivationKind::Sigmoid => sigmoid(x),
        }
    }

    /// `df/dx(x)`, matching [`apply`](Self::apply).
    #[inline]
    pub fn derivative(self, x: f32, alpha: f32) -> f32 {
        match self {
            ActivationKind::Relu => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            ActivationKind::LeakyRelu => {
                if x > 0.0 {
                    1.0
                } else {
                    alpha
                }
            }
            ActivationKind::Elu => {
                if x > 0.0 {
                    1.0
                } else {
                    alpha * x.exp()
                }
            }
            ActivationKind::Gelu => {
                let u = SQRT_2_OVER_PI * (x + GELU_COEFF * x * x * x);
                let t = u.tanh();
                let du = SQRT_2_OVER_PI * (1.0 + 3.0 * GELU_COEFF * x * x);
                0.5 * (1.0 + t) + 0.5 * x * (1.0 - t * t) * du
            }
            ActivationKind::Swish => {
                let s = sigmoid(x);
                s + x * s * (1.0 - s)
            }
            ActivationKind::Tanh => {
                let t = x.tanh();
                1.0 - t * t
            }
            ActivationKind::Sigmoid => {
                let s = sigmoid(x);
                s * (1.0 - s)
            }
        }
    }

    /// Whether `f(0) == 0`; kinds where it is not must re-zero the padding
    /// channels after an elementwise pass over the whole padded buffer.
    pub fn maps_zero_to_zero(self) -> bool {
        !matches!(self, ActivationKind::Sigmoid)
    }
}

const SQRT_2_OVER_PI: f32 = 0.797_884_56;
const GELU_COEFF: f32 = 0.044_715;

#[inline]
fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Compare each activation's closed-form derivative against a central finite
/// difference. Returns a diagnostic listing the failing activation and the
/// failure class (`non-finite` or `derivative mismatch`). Halts the run that
/// invoked it; does not corrupt any state.
pub fn self_test() -> Result<(), String> {
    let mut failures = Vec::new();
    let points = [-3.0f32, -1.0, -0.25, 0.25, 1.0, 3.0];
    let h = 1e-3f32;
    let alpha = 0.01f32;

    for kind in ActivationKind::ALL {
        for &x in &points {
            let analytic = kind.derivative(x, alpha);
            let numeric = (kind.apply(x + h, alpha) - kind.apply(x - h, alpha)) / (2.0 * h);
            if !analytic.is_finite() || !numeric.is_finite() {
                failures.push(format!("{}: non-finite at x={}", kind.name(), x));
            } else if (analytic - numeric).abs() > 5e-2 * (1.0 + analytic.abs()) {
                failures.push(format!(
                    "{}: derivative mismatch at x={} (analytic {}, numeric {})",
                    kind.name(),
                    x,
                    analytic,
                    numeric
                ));
            }
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(failures.join("; "))
    }
}

/// Elementwise activation over the full padded buffer.
#[derive(Debug)]
pub struct ActivationLayer {
    kind: ActivationKind,
    alpha: f32,
    src_reorder: Option<Reorder>,
    src_scratch: TensorBuffer,
    bwd_scratch: TensorBuffer,
}

impl ActivationLayer {
    pub fn new(kind: ActivationKind, alpha: f32) -> Self {
        Self {
            kind,
            alpha,
            src_reorder: None,
            src_scratch: TensorBuffer::new(),
            bwd_scratch: TensorBuffer::new(),
        }
    }

    pub fn activation(&self) -> ActivationKind {
        self.kind
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
        if !base.inplace_bwd {
            self.bwd_scratch.resize(batch * desc.elements(), Some(desc), 0.0);
        }
        Ok(())
    }

    /// View of the input in this layer's own layout, reordering if the
    /// producer's format differs.
    fn source<'a>(&'a mut self, prev: &'a LayerBase, batch: usize) -> &'a [f32] {
        if let Some(reorder) = &self.src_reorder {
            reorder.execute(
                prev.neurons.as_slice(),
                self.src_scratch.as_mut_slice(),
                batch,
                false,
            );
            self.src_scratch.as_slice()
        } else {
            prev.neurons.as_slice()
        }
    }

    pub fn forward(&mut self, base: &mut LayerBase, inputs: &[&LayerBase], batch: usize) {
        let kind = self.kind;
        let alpha = self.alpha;
        let src = self.source(inputs[0], batch);
        let sample_len = base.padded_cdhw();
        let threads = partition(batch * sample_len, base.kind.cost_weight());

        for_each_sample(base.neurons.as_mut_slice(), sample_len, threads, |n, out| {
            let s = &src[n * sample_len..(n + 1) * sample_len];
            for (o, &x) in out.iter_mut().zip(s.iter()) {
                *o = kind.apply(x, alpha);
            }
        });

        if !kind.maps_zero_to_zero() {
            let desc = *base.desc();
            zero_padding(base.neurons.as_mut_slice(), &desc, batch);
        }
    }

    pub fn backward(&mut self, base: &mut LayerBase, inputs: &mut [&mut LayerBase], batch: usize) {
        let kind = self.kind;
        let alpha = self.alpha;
        let sample_len = base.padded_cdhw();
        let threads = partition(batch * sample_len, base.kind.cost_weight());

        if base.inplace_bwd {
            // Fold the local derivative into our own gradient buffer; the
            // driver moves the storage to the producer afterwards. The
            // source view from the forward pass is still valid this step.
            let src_slice: &[f32] = if self.src_reorder.is_some() {
                self.src_scratch.as_slice()
            } else {
                inputs[0].neurons.as_slice()
            };
            for_each_sample(base.neurons_d1.as_mut_slice(), sample_len, threads, |n, d1| {
                let s = &src_slice[n * sample_len..(n + 1) * sample_len];
                for (g, &x) in d1.iter_mut().zip(s.iter()) {
                    *g *= kind.derivative(x, alpha);
                }
            });
            return;
        }

        {
            let prev = &*inputs[0];
            let Self {
                src_reorder,
                src_scratch,
                bwd_scratch,
                ..
            } = self;
            let src_slice: &[f32] = if src_reorder.is_some() {
                src_scratch.as_slice()
            } else {
                prev.neurons.as_slice()
            };
            let d1 = base.neurons_d1.as_slice();
            for_each_sample(bwd_scratch.as_mut_slice(), sample_len, threads, |n, out| {
                let range = n * sample_len..(n + 1) * sample_len;
                let s = &src_slice[range.clone()];
                let g = &d1[range];
                for ((o, &x), &gy) in out.iter_mut().zip(s.iter()).zip(g.iter()) {
                    *o = gy * kind.derivative(x, alpha);
                }
            });
        }

        let desc = *base.diff_desc();
        let shared = base.input_shared[0];
        emit_gradient(self.bwd_scratch.as_slice(), &desc, inputs[0], batch, shared);
    }
}
