//! Weight update rules.
//!
//! Per-tensor state (momentum, moment estimates) is keyed by a stable slot id
//! the graph assigns to each parameter tensor, so one optimizer instance
//! serves every weighted layer.

pub mod adam;
pub mod sgd;

pub use adam::Adam;
pub use sgd::SGD;

pub trait Optimizer {
    /// Apply one update step to `params` from the accumulated `grads`.
    ///
    /// `slot` identifies the parameter tensor; state for a slot is created
    /// lazily on first use and sized to the tensor.
    fn update(&mut self, slot: usize, params: &mut [f32], grads: &[f32]);

    /// Drop all per-tensor state (fresh training run).
    fn reset(&mut self);

    fn learning_rate(&self) -> f32;

    fn set_learning_rate(&mut self, lr: f32);
}
