//! Activation and gradient storage.
//!
//! A [`TensorBuffer`] owns flat f32 storage optionally bound to a memory
//! descriptor. Layers resize their buffers whenever the batch size or
//! resolution changes; a resize that does not change the element count is a
//! no-op apart from rebinding the descriptor.

use crate::format::MemDesc;

/// Flat f32 storage bound to an optional layout descriptor.
///
/// Reallocation invalidates every slice previously derived from the buffer;
/// any code caching a view must re-fetch it after a resize. Allocation
/// failure aborts the process; there is no mid-training recovery from an
/// out-of-memory condition.
#[derive(Debug, Default, Clone)]
pub struct TensorBuffer {
    data: Vec<f32>,
    desc: Option<MemDesc>,
}

impl TensorBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resize to `len` elements bound to `desc`, filling new storage with
    /// `value`. No-op when the length is unchanged (the descriptor is still
    /// rebound, so a format change without a size change is cheap).
    pub fn resize(&mut self, len: usize, desc: Option<MemDesc>, value: f32) {
        if self.data.len() != len {
            self.data.clear();
            self.data.resize(len, value);
        }
        self.desc = desc;
    }

    /// Overwrite every element without reallocating.
    pub fn fill(&mut self, value: f32) {
        self.data.fill(value);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn desc(&self) -> Option<&MemDesc> {
        self.desc.as_ref()
    }

    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Swap the underlying storage of two buffers of equal length.
    ///
    /// Used by the in-place backward path to move a gradient buffer to the
    /// predecessor without copying. Descriptors stay with their owners.
    pub fn swap_storage(&mut self, other: &mut TensorBuffer) {
        assert_eq!(
            self.data.len(),
            other.data.len(),
            "storage swap requires equal element counts"
        );
        std::mem::swap(&mut self.data, &mut other.data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{MemDesc, MemoryFormat};

    #[test]
    fn test_resize_allocates_and_fills() {
        let mut buf = TensorBuffer::new();
        buf.resize(16, None, 0.5);
        assert_eq!(buf.len(), 16);
        assert!(buf.as_slice().iter().all(|&v| v == 0.5));
    }

    #[test]
    fn test_resize_same_len_keeps_contents() {
        let mut buf = TensorBuffer::new();
        buf.resize(8, None, 0.0);
        buf.as_mut_slice()[3] = 9.0;

        let desc = MemDesc::new(MemoryFormat::Blocked, 8, 1, 1, 1);
        buf.resize(8, Some(desc), 0.0);
        assert_eq!(buf.as_slice()[3], 9.0);
        assert_eq!(buf.desc(), Some(&desc));
    }

    #[test]
    fn test_resize_changed_len_discards_contents() {
        let mut buf = TensorBuffer::new();
        buf.resize(8, None, 1.0);
        buf.resize(24, None, 0.0);
        assert_eq!(buf.len(), 24);
        assert!(buf.as_slice().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_fill() {
        let mut buf = TensorBuffer::new();
        buf.resize(4, None, 1.0);
        buf.fill(2.0);
        assert!(buf.as_slice().iter().all(|&v| v == 2.0));
    }

    #[test]
    fn test_swap_storage() {
        let mut a = TensorBuffer::new();
        let mut b = TensorBuffer::new();
        a.resize(4, None, 1.0);
        b.resize(4, None, 2.0);
        a.swap_storage(&mut b);
        assert!(a.as_slice().iter().all(|&v| v == 2.0));
        assert!(b.as_slice().iter().all(|&v| v == 1.0));
    }

    #[test]
    #[should_panic(expected = "equal element counts")]
    fn test_swap_storage_mismatch_panics() {
        let mut a = TensorBuffer::new();
        let mut b = TensorBuffer::new();
        a.resize(4, None, 0.0);
        b.resize(8, None, 0.0);
        a.swap_storage(&mut b);
    }
}
