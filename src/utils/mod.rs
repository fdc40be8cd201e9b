pub mod lr_scheduler;
pub mod math;
pub mod rng;

pub use rng::SimpleRng;
