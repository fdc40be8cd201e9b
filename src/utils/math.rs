//! Small numeric helpers shared across layers.

/// Kahan compensated accumulator.
///
/// Used wherever a long f32 reduction feeds running statistics (batch means
/// and variances); plain summation loses low-order bits once the partial sum
/// grows a few orders of magnitude past the addends.
#[derive(Debug, Default, Clone, Copy)]
pub struct KahanSum {
    sum: f32,
    compensation: f32,
}

impl KahanSum {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add(&mut self, value: f32) {
        let y = value - self.compensation;
        let t = self.sum + y;
        self.compensation = (t - self.sum) - y;
        self.sum = t;
    }

    #[inline]
    pub fn value(&self) -> f32 {
        self.sum
    }
}
