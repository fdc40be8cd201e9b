//! Cost layer: loss evaluation and the seed gradient.
//!
//! Always consumes a plain-layout producer (the graph forces the producer
//! plain during negotiation). Forward copies (MSE) or softmaxes
//! (cross-entropy) the predictions into its own buffer and evaluates the
//! batch-mean loss against the externally supplied targets; backward writes
//! the seed gradient into the producer over real channels only.

use crate::error::GraphError;
use crate::format::{negotiate, FormatPolicy, MemoryFormat};
use crate::tensor::TensorBuffer;
use crate::utils::math::KahanSum;

use super::LayerBase;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostKind {
    MeanSquaredError,
    CrossEntropy,
}

impl CostKind {
    pub fn name(self) -> &'static str {
        match self {
            CostKind::MeanSquaredError => "mse",
            CostKind::CrossEntropy => "cross_entropy",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "mse" => Some(CostKind::MeanSquaredError),
            "cross_entropy" => Some(CostKind::CrossEntropy),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct CostLayer {
    kind: CostKind,
    targets: TensorBuffer,
    loss: f32,
}

impl CostLayer {
    pub fn new(kind: CostKind) -> Self {
        Self {
            kind,
            targets: TensorBuffer::new(),
            loss: 0.0,
        }
    }

    pub fn kind(&self) -> CostKind {
        self.kind
    }

    /// Batch-mean loss of the last forward pass.
    pub fn loss(&self) -> f32 {
        self.loss
    }

    pub fn init_descriptors(
        &mut self,
        base: &mut LayerBase,
        prevs: &[&LayerBase],
        batch: usize,
    ) -> Result<(), GraphError> {
        let prev = prevs[0];
        let prev_desc = *prev.desc();
        if prev_desc.format != MemoryFormat::Plain {
            return Err(GraphError::FormatMismatch {
                producer: "blocked producer".into(),
                consumer: base.name.clone(),
            });
        }
        base.set_shape(prev.c, prev.d, prev.h, prev.w);
        let desc = negotiate(base.c, base.d, base.h, base.w, None, true, FormatPolicy::PlainOnly);
        base.dst_desc = Some(desc);
        base.diff_dst_desc = Some(desc);
        self.targets.resize(batch * desc.elements(), Some(desc), 0.0);
        Ok(())
    }

    /// Scatter packed real-channel targets `[batch, c*d*h*w]` into the padded
    /// layout.
    pub fn set_targets(&mut self, data: &[f32], base: &LayerBase, batch: usize) {
        let desc = *base.desc();
        assert_eq!(
            data.len(),
            batch * base.cdhw(),
            "target size mismatch for layer {}",
            base.name
        );
        let spatial = base.d * base.h * base.w;
        let out = self.targets.as_mut_slice();
        for n in 0..batch {
            for c in 0..base.c {
                let from = (n * base.c + c) * spatial;
                let to = desc.offset(n, c, 0, 0, 0);
                out[to..to + spatial].copy_from_slice(&data[from..from + spatial]);
            }
        }
    }

    pub fn forward(&mut self, base: &mut LayerBase, inputs: &[&LayerBase], batch: usize) {
        let desc = *base.desc();
        let (channels, dim_d, dim_h, dim_w) = (base.c, base.d, base.h, base.w);
        let src = inputs[0].neurons.as_slice();
        let targets = self.targets.as_slice();
        let out = base.neurons.as_mut_slice();
        let mut total = KahanSum::new();

        match self.kind {
            CostKind::MeanSquaredError => {
                out.copy_from_slice(src);
                for n in 0..batch {
                    for c in 0..channels {
                        for dd in 0..dim_d {
                            for hh in 0..dim_h {
                                for ww in 0..dim_w {
                                    let i = desc.offset(n, c, dd, hh, ww);
                                    let diff = out[i] - targets[i];
                                    total.add(0.5 * diff * diff);
                                }
                            }
                        }
                    }
                }
            }
            CostKind::CrossEntropy => {
                // Softmax over real channels at every spatial position, then
                // the negative log-likelihood against the targets.
                for n in 0..batch {
                    for dd in 0..dim_d {
                        for hh in 0..dim_h {
                            for ww in 0..dim_w {
                                let mut max = f32::NEG_INFINITY;
                                for c in 0..channels {
                                    max = max.max(src[desc.offset(n, c, dd, hh, ww)]);
                                }
                                let mut denom = 0.0f32;
                                for c in 0..channels {
                                    let i = desc.offset(n, c, dd, hh, ww);
                                    let e = (src[i] - max).exp();
                                    out[i] = e;
                                    denom += e;
                                }
                                for c in 0..channels {
                                    let i = desc.offset(n, c, dd, hh, ww);
                                    out[i] /= denom;
                                    if targets[i] > 0.0 {
                                        total.add(-targets[i] * out[i].max(1e-12).ln());
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
        self.loss = total.value() / batch as f32;
    }

    pub fn backward(&mut self, base: &mut LayerBase, inputs: &mut [&mut LayerBase], batch: usize) {
        let desc = *base.diff_desc();
        let (channels, dim_d, dim_h, dim_w) = (base.c, base.d, base.h, base.w);
        let norm = 1.0 / batch as f32;
        let shared = base.input_shared[0];

        // Both kinds share the same seed form once the softmax is folded in:
        // predictions minus targets, scaled to the batch mean.
        let preds = base.neurons.as_slice();
        let targets = self.targets.as_slice();
        let prev = &mut *inputs[0];
        if !shared {
            prev.neurons_d1.fill(0.0);
        }
        let d_prev = prev.neurons_d1.as_mut_slice();
        for n in 0..batch {
            for c in 0..channels {
                for dd in 0..dim_d {
                    for hh in 0..dim_h {
                        for ww in 0..dim_w {
                            let i = desc.offset(n, c, dd, hh, ww);
                            d_prev[i] += (preds[i] - targets[i]) * norm;
                        }
                    }
                }
            }
        }
    }
}
