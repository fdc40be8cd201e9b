//! Stochastic gradient descent with classical momentum.

use std::collections::HashMap;

use super::Optimizer;

#[derive(Debug)]
pub struct SGD {
    learning_rate: f32,
    momentum: f32,
    velocity: HashMap<usize, Vec<f32>>,
}

impl SGD {
    pub fn new(learning_rate: f32, momentum: f32) -> Self {
        assert!(learning_rate > 0.0, "learning rate must be positive");
        assert!(
            (0.0..1.0).contains(&momentum),
            "momentum must be in range [0.0, 1.0)"
        );
        Self {
            learning_rate,
            momentum,
            velocity: HashMap::new(),
        }
    }
}

impl Optimizer for SGD {
    fn update(&mut self, slot: usize, params: &mut [f32], grads: &[f32]) {
        assert_eq!(params.len(), grads.len(), "parameter/gradient size mismatch");
        if self.momentum == 0.0 {
            for (p, &g) in params.iter_mut().zip(grads.iter()) {
                *p -= self.learning_rate * g;
            }
            return;
        }
        let velocity = self
            .velocity
            .entry(slot)
            .or_insert_with(|| vec![0.0; params.len()]);
        if velocity.len() != params.len() {
            // The slot's tensor was reshaped (resolution change); stale
            // momentum has the wrong length and the wrong meaning.
            *velocity = vec![0.0; params.len()];
        }
        for ((p, v), &g) in params.iter_mut().zip(velocity.iter_mut()).zip(grads.iter()) {
            *v = self.momentum * *v + g;
            *p -= self.learning_rate * *v;
        }
    }

    fn reset(&mut self) {
        self.velocity.clear();
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.learning_rate = lr;
    }
}
