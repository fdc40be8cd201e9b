//! Deterministic random number generation.
//!
//! A lightweight xorshift PRNG keeps weight initialization, dropout masks and
//! stochastic-depth draws reproducible across runs. Parallel loops never share
//! one generator: each worker derives its own stream with [`SimpleRng::fork`]
//! from a sample index, so a run is bit-identical regardless of thread count.

/// Xorshift-based PRNG with explicit seeding.
#[derive(Debug, Clone)]
pub struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    /// Create a generator from an explicit seed (a zero seed is remapped to a
    /// fixed non-zero constant; xorshift cannot leave the zero state).
    pub fn new(seed: u64) -> Self {
        let state = if seed == 0 { 0x9e37_79b9_7f4a_7c15 } else { seed };
        Self { state }
    }

    /// Derive an independent stream for `stream` (e.g. a sample index).
    ///
    /// Mixes the stream id through a splitmix64 round so that neighbouring
    /// indices do not produce correlated sequences.
    pub fn fork(&self, stream: u64) -> Self {
        let mut z = self
            .state
            .wrapping_add(stream.wrapping_add(1).wrapping_mul(0x9e37_79b9_7f4a_7c15));
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        SimpleRng::new(z ^ (z >> 31))
    }

    /// Next raw 32-bit draw.
    pub fn next_u32(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        (x >> 32) as u32
    }

    /// Uniform sample in `[0, 1)`.
    pub fn next_f32(&mut self) -> f32 {
        // 24 mantissa bits keep the value strictly below 1.
        (self.next_u32() >> 8) as f32 / (1u32 << 24) as f32
    }

    /// Uniform sample in `[low, high)`.
    pub fn gen_range_f32(&mut self, low: f32, high: f32) -> f32 {
        low + (high - low) * self.next_f32()
    }

    /// Bernoulli draw: `true` with probability `p`.
    pub fn gen_bernoulli(&mut self, p: f32) -> bool {
        self.next_f32() < p
    }

    /// Standard normal sample via Box-Muller.
    pub fn gen_normal(&mut self) -> f32 {
        let u1 = self.next_f32().max(f32::MIN_POSITIVE);
        let u2 = self.next_f32();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
    }
}
