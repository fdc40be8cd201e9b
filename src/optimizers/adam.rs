//! Adam with bias-corrected moment estimates.

use std::collections::HashMap;

use super::Optimizer;

#[derive(Debug)]
struct SlotState {
    m: Vec<f32>,
    v: Vec<f32>,
    t: u64,
}

#[derive(Debug)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    state: HashMap<usize, SlotState>,
}

impl Adam {
    pub fn new(learning_rate: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        assert!(learning_rate > 0.0, "learning rate must be positive");
        assert!((0.0..1.0).contains(&beta1) && (0.0..1.0).contains(&beta2), "betas must be in [0.0, 1.0)");
        assert!(epsilon > 0.0, "epsilon must be positive");
        Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            state: HashMap::new(),
        }
    }

    /// Common defaults: lr with `beta1 = 0.9`, `beta2 = 0.999`, `eps = 1e-8`.
    pub fn with_defaults(learning_rate: f32) -> Self {
        Self::new(learning_rate, 0.9, 0.999, 1e-8)
    }
}

impl Optimizer for Adam {
    fn update(&mut self, slot: usize, params: &mut [f32], grads: &[f32]) {
        assert_eq!(params.len(), grads.len(), "parameter/gradient size mismatch");
        let state = self.state.entry(slot).or_insert_with(|| SlotState {
            m: vec![0.0; params.len()],
            v: vec![0.0; params.len()],
            t: 0,
        });
        if state.m.len() != params.len() {
            // The slot's tensor was reshaped (resolution change); restart its
            // moment estimates at the new size.
            *state = SlotState {
                m: vec![0.0; params.len()],
                v: vec![0.0; params.len()],
                t: 0,
            };
        }
        state.t += 1;
        let bc1 = 1.0 - self.beta1.powi(state.t as i32);
        let bc2 = 1.0 - self.beta2.powi(state.t as i32);
        for i in 0..params.len() {
            let g = grads[i];
            state.m[i] = self.beta1 * state.m[i] + (1.0 - self.beta1) * g;
            state.v[i] = self.beta2 * state.v[i] + (1.0 - self.beta2) * g * g;
            let m_hat = state.m[i] / bc1;
            let v_hat = state.v[i] / bc2;
            params[i] -= self.learning_rate * m_hat / (v_hat.sqrt() + self.epsilon);
        }
    }

    fn reset(&mut self) {
        self.state.clear();
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.learning_rate = lr;
    }
}
