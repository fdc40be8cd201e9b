//! Learning-rate schedulers driving epochs of optimization.
//!
//! A scheduler owns the training-rate curve: the orchestrating loop reads
//! `get_lr()` each epoch, trains, then calls `step()`. `reset()` rewinds the
//! schedule for a fresh run or the next cycle.

/// Core trait for learning-rate schedulers.
pub trait LRScheduler {
    /// Learning rate for the current epoch.
    fn get_lr(&self) -> f32;

    /// Advance to the next epoch.
    fn step(&mut self);

    /// Rewind to the initial state.
    fn reset(&mut self);
}

/// Multiplies the rate by `gamma` every `step_size` epochs.
///
/// `lr = initial_lr * gamma^(epoch / step_size)`
pub struct StepDecay {
    initial_lr: f32,
    step_size: usize,
    gamma: f32,
    epoch: usize,
}

impl StepDecay {
    pub fn new(initial_lr: f32, step_size: usize, gamma: f32) -> Self {
        assert!(initial_lr > 0.0, "initial_lr must be positive");
        assert!(step_size > 0, "step_size must be positive");
        assert!(gamma > 0.0, "gamma must be positive");
        Self {
            initial_lr,
            step_size,
            gamma,
            epoch: 0,
        }
    }
}

impl LRScheduler for StepDecay {
    fn get_lr(&self) -> f32 {
        self.initial_lr * self.gamma.powi((self.epoch / self.step_size) as i32)
    }

    fn step(&mut self) {
        self.epoch += 1;
    }

    fn reset(&mut self) {
        self.epoch = 0;
    }
}

/// Multiplies the rate by `decay_rate` every epoch.
pub struct ExponentialDecay {
    initial_lr: f32,
    decay_rate: f32,
    epoch: usize,
}

impl ExponentialDecay {
    pub fn new(initial_lr: f32, decay_rate: f32) -> Self {
        assert!(initial_lr > 0.0, "initial_lr must be positive");
        assert!(decay_rate > 0.0, "decay_rate must be positive");
        Self {
            initial_lr,
            decay_rate,
            epoch: 0,
        }
    }
}

impl LRScheduler for ExponentialDecay {
    fn get_lr(&self) -> f32 {
        self.initial_lr * self.decay_rate.powi(self.epoch as i32)
    }

    fn step(&mut self) {
        self.epoch += 1;
    }

    fn reset(&mut self) {
        self.epoch = 0;
    }
}

/// Cosine annealing from `initial_lr` down to `min_lr` over `t_max` epochs.
///
/// `lr = min_lr + 0.5 * (initial_lr - min_lr) * (1 + cos(pi * epoch / t_max))`
pub struct CosineAnnealing {
    initial_lr: f32,
    min_lr: f32,
    t_max: usize,
    epoch: usize,
}

impl CosineAnnealing {
    pub fn new(initial_lr: f32, min_lr: f32, t_max: usize) -> Self {
        assert!(initial_lr > 0.0, "initial_lr must be positive");
        assert!(min_lr >= 0.0, "min_lr must be non-negative");
        assert!(min_lr <= initial_lr, "min_lr must not exceed initial_lr");
        assert!(t_max > 0, "t_max must be positive");
        Self {
            initial_lr,
            min_lr,
            t_max,
            epoch: 0,
        }
    }
}

impl LRScheduler for CosineAnnealing {
    fn get_lr(&self) -> f32 {
        let t = self.epoch.min(self.t_max) as f32 / self.t_max as f32;
        self.min_lr
            + 0.5 * (self.initial_lr - self.min_lr) * (1.0 + (std::f32::consts::PI * t).cos())
    }

    fn step(&mut self) {
        self.epoch += 1;
    }

    fn reset(&mut self) {
        self.epoch = 0;
    }
}
