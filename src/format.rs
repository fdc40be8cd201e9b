//! Tensor memory formats and the negotiation protocol between layers.
//!
//! Activations live in one of two layouts:
//!
//! - **Plain**: channel-major row-major order `[n][c][d][h][w]`, the layout
//!   the dense, convolution, pooling and cost kernels consume directly.
//! - **Blocked**: channels grouped in vector-width blocks
//!   `[n][c/8][d][h][w][8]`, so that elementwise and normalization kernels
//!   touch contiguous lanes of one SIMD register per step.
//!
//! Both layouts cover the *padded* channel count, so a buffer's element count
//! is independent of its format. When two adjacent layers disagree on format,
//! an explicit [`Reorder`] is inserted at the boundary; there is no implicit
//! coercion anywhere in the engine.

/// Number of f32 lanes per channel block (one 256-bit register).
pub const VEC_WIDTH: usize = 8;

/// Memory layout of an activation or gradient buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryFormat {
    /// Row-major `[n][c][d][h][w]`.
    Plain,
    /// Channel-blocked `[n][c/VEC_WIDTH][d][h][w][VEC_WIDTH]`.
    Blocked,
}

/// Graph-wide policy for choosing blocked layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormatPolicy {
    /// Never produce blocked buffers; useful for debugging and references.
    PlainOnly,
    /// Producers emit blocked layouts whenever a consumer can accept them.
    #[default]
    BlockedWherePossible,
}

/// Describes the logical shape and physical layout of one sample.
///
/// `padded_c` is `c` rounded up to [`VEC_WIDTH`]; the padding channels exist
/// in both formats and are kept at zero by every layer.
///
/// # Examples
///
/// ```
/// use blocknet::format::{MemDesc, MemoryFormat, VEC_WIDTH};
///
/// let desc = MemDesc::new(MemoryFormat::Plain, 10, 1, 4, 4);
/// assert_eq!(desc.padded_c % VEC_WIDTH, 0);
/// assert_eq!(desc.elements(), desc.padded_c * 16);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemDesc {
    pub format: MemoryFormat,
    pub c: usize,
    pub padded_c: usize,
    pub d: usize,
    pub h: usize,
    pub w: usize,
}

impl MemDesc {
    /// Create a descriptor, rounding the channel count up to the vector width.
    pub fn new(format: MemoryFormat, c: usize, d: usize, h: usize, w: usize) -> Self {
        assert!(c > 0 && d > 0 && h > 0 && w > 0, "descriptor dims must be non-zero");
        let padded_c = c.div_ceil(VEC_WIDTH) * VEC_WIDTH;
        Self {
            format,
            c,
            padded_c,
            d,
            h,
            w,
        }
    }

    /// Spatial element count `d * h * w`.
    #[inline]
    pub fn spatial(&self) -> usize {
        self.d * self.h * self.w
    }

    /// Per-sample element count, padding channels included.
    #[inline]
    pub fn elements(&self) -> usize {
        self.padded_c * self.spatial()
    }

    /// Flat offset of `(n, c, d, h, w)` in this layout.
    #[inline]
    pub fn offset(&self, n: usize, c: usize, d: usize, h: usize, w: usize) -> usize {
        debug_assert!(c < self.padded_c && d < self.d && h < self.h && w < self.w);
        match self.format {
            MemoryFormat::Plain => {
                (((n * self.padded_c + c) * self.d + d) * self.h + h) * self.w + w
            }
            MemoryFormat::Blocked => {
                let block = c / VEC_WIDTH;
                let lane = c % VEC_WIDTH;
                let blocks = self.padded_c / VEC_WIDTH;
                ((((n * blocks + block) * self.d + d) * self.h + h) * self.w + w) * VEC_WIDTH + lane
            }
        }
    }

    /// Same shape, different format.
    pub fn with_format(&self, format: MemoryFormat) -> Self {
        Self { format, ..*self }
    }

    /// Shapes agree regardless of format.
    pub fn same_shape(&self, other: &MemDesc) -> bool {
        self.c == other.c && self.d == other.d && self.h == other.h && self.w == other.w
    }
}

/// Choose a layer's output descriptor.
///
/// A format-flexible layer passes its producer's format and inherits it so
/// that no reorder is needed on the boundary. A layer that can present either
/// layout passes `None`; under [`FormatPolicy::BlockedWherePossible`] the free
/// choice is the blocked layout, which is how blocked buffers enter a graph
/// in the first place. `requires_plain` overrides both (the layer feeds a
/// plain-only consumer, or its own kernel mandates plain), and under
/// [`FormatPolicy::PlainOnly`] everything is plain. Pure function of its
/// arguments, so re-running descriptor initialization is idempotent.
pub fn negotiate(
    c: usize,
    d: usize,
    h: usize,
    w: usize,
    producer: Option<MemoryFormat>,
    requires_plain: bool,
    policy: FormatPolicy,
) -> MemDesc {
    let format = if requires_plain || policy == FormatPolicy::PlainOnly {
        MemoryFormat::Plain
    } else {
        producer.unwrap_or(MemoryFormat::Blocked)
    };
    MemDesc::new(format, c, d, h, w)
}

/// Explicit layout conversion between two descriptors of identical shape.
///
/// Built once during descriptor initialization; its cost is paid on every
/// forward or backward call that crosses the boundary. The backward direction
/// supports accumulation so that reordered gradients can add into a shared
/// buffer without a scratch copy.
#[derive(Debug, Clone, Copy)]
pub struct Reorder {
    src: MemDesc,
    dst: MemDesc,
}

impl Reorder {
    /// Create a reorder; the two descriptors must agree on shape.
    pub fn new(src: MemDesc, dst: MemDesc) -> Self {
        assert!(src.same_shape(&dst), "reorder requires identical shapes");
        Self { src, dst }
    }

    pub fn src(&self) -> &MemDesc {
        &self.src
    }

    pub fn dst(&self) -> &MemDesc {
        &self.dst
    }

    /// Convert `src` into `dst` for `batch` samples.
    ///
    /// Only real channels are moved; padding channels of the destination are
    /// left untouched (they are zero by the engine-wide padding invariant).
    /// With `accumulate` the converted values are added to the destination
    /// instead of overwriting it.
    pub fn execute(&self, src: &[f32], dst: &mut [f32], batch: usize, accumulate: bool) {
        let per_sample = self.src.elements();
        assert_eq!(src.len(), batch * per_sample, "reorder src size mismatch");
        assert_eq!(dst.len(), batch * per_sample, "reorder dst size mismatch");

        for n in 0..batch {
            for c in 0..self.src.c {
                for d in 0..self.src.d {
                    for h in 0..self.src.h {
                        for w in 0..self.src.w {
                            let v = src[self.src.offset(n, c, d, h, w)];
                            let o = self.dst.offset(n, c, d, h, w);
                            if accumulate {
                                dst[o] += v;
                            } else {
                                dst[o] = v;
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Zero the padding channels `[c, padded_c)` of every sample.
///
/// Called by layers whose elementwise kernel does not map zero to zero
/// (e.g. a sigmoid activation), so the padding invariant survives.
pub fn zero_padding(buf: &mut [f32], desc: &MemDesc, batch: usize) {
    if desc.c == desc.padded_c {
        return;
    }
    for n in 0..batch {
        for c in desc.c..desc.padded_c {
            for d in 0..desc.d {
                for h in 0..desc.h {
                    for w in 0..desc.w {
                        buf[desc.offset(n, c, d, h, w)] = 0.0;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padded_channel_rounding() {
        let desc = MemDesc::new(MemoryFormat::Plain, 3, 1, 2, 2);
        assert_eq!(desc.padded_c, VEC_WIDTH);

        let desc = MemDesc::new(MemoryFormat::Plain, 8, 1, 2, 2);
        assert_eq!(desc.padded_c, 8);

        let desc = MemDesc::new(MemoryFormat::Plain, 9, 1, 2, 2);
        assert_eq!(desc.padded_c, 16);
    }

    #[test]
    fn test_offsets_cover_all_elements_exactly_once() {
        for format in [MemoryFormat::Plain, MemoryFormat::Blocked] {
            let desc = MemDesc::new(format, 5, 1, 3, 2);
            let mut seen = vec![false; desc.elements() * 2];
            for n in 0..2 {
                for c in 0..desc.padded_c {
                    for d in 0..desc.d {
                        for h in 0..desc.h {
                            for w in 0..desc.w {
                                let o = desc.offset(n, c, d, h, w);
                                assert!(!seen[o], "offset {} visited twice", o);
                                seen[o] = true;
                            }
                        }
                    }
                }
            }
            assert!(seen.iter().all(|&s| s));
        }
    }

    #[test]
    fn test_negotiate_inherits_producer_format() {
        let desc = negotiate(
            16,
            1,
            4,
            4,
            Some(MemoryFormat::Blocked),
            false,
            FormatPolicy::BlockedWherePossible,
        );
        assert_eq!(desc.format, MemoryFormat::Blocked);
    }

    #[test]
    fn test_negotiate_free_choice_is_blocked() {
        let desc = negotiate(16, 1, 4, 4, None, false, FormatPolicy::BlockedWherePossible);
        assert_eq!(desc.format, MemoryFormat::Blocked);

        let desc = negotiate(16, 1, 4, 4, None, true, FormatPolicy::BlockedWherePossible);
        assert_eq!(desc.format, MemoryFormat::Plain);

        let desc = negotiate(16, 1, 4, 4, None, false, FormatPolicy::PlainOnly);
        assert_eq!(desc.format, MemoryFormat::Plain);
    }

    #[test]
    fn test_negotiate_forces_plain_when_required() {
        let desc = negotiate(
            16,
            1,
            4,
            4,
            Some(MemoryFormat::Blocked),
            true,
            FormatPolicy::BlockedWherePossible,
        );
        assert_eq!(desc.format, MemoryFormat::Plain);
    }

    #[test]
    fn test_negotiate_plain_only_policy() {
        let desc = negotiate(
            16,
            1,
            4,
            4,
            Some(MemoryFormat::Blocked),
            false,
            FormatPolicy::PlainOnly,
        );
        assert_eq!(desc.format, MemoryFormat::Plain);
    }

    #[test]
    fn test_reorder_round_trip() {
        let plain = MemDesc::new(MemoryFormat::Plain, 10, 1, 3, 3);
        let blocked = plain.with_format(MemoryFormat::Blocked);

        let batch = 2;
        let mut src = vec![0.0f32; batch * plain.elements()];
        for n in 0..batch {
            for c in 0..plain.c {
                for h in 0..plain.h {
                    for w in 0..plain.w {
                        src[plain.offset(n, c, 0, h, w)] = (n * 1000 + c * 100 + h * 10 + w) as f32;
                    }
                }
            }
        }

        let mut mid = vec![0.0f32; src.len()];
        let mut back = vec![0.0f32; src.len()];
        Reorder::new(plain, blocked).execute(&src, &mut mid, batch, false);
        Reorder::new(blocked, plain).execute(&mid, &mut back, batch, false);
        assert_eq!(src, back);
    }

    #[test]
    fn test_reorder_accumulate() {
        let plain = MemDesc::new(MemoryFormat::Plain, 8, 1, 2, 2);
        let blocked = plain.with_format(MemoryFormat::Blocked);
        let src = vec![1.0f32; plain.elements()];
        let mut dst = vec![2.0f32; plain.elements()];
        Reorder::new(plain, blocked).execute(&src, &mut dst, 1, true);
        assert!(dst.iter().all(|&v| v == 3.0));
    }

    #[test]
    fn test_zero_padding() {
        let desc = MemDesc::new(MemoryFormat::Blocked, 5, 1, 2, 2);
        let mut buf = vec![7.0f32; desc.elements()];
        zero_padding(&mut buf, &desc, 1);
        for c in 0..desc.padded_c {
            for h in 0..2 {
                for w in 0..2 {
                    let v = buf[desc.offset(0, c, 0, h, w)];
                    if c < desc.c {
                        assert_eq!(v, 7.0);
                    } else {
                        assert_eq!(v, 0.0);
                    }
                }
            }
        }
    }
}
