//! Work partitioning for batch fan-out.
//!
//! Every layer's forward and backward pass asks [`partition`] how many threads
//! a workload deserves before dispatching its per-sample loop. Small workloads
//! stay single-threaded (thread launch overhead would dominate); large ones
//! saturate the hardware. The five thresholds are empirically tuned constants,
//! not invariants; they trade launch overhead against parallel speedup on
//! typical mini-batch shapes.

use rayon::prelude::*;
use std::thread;

// Weighted-load thresholds separating the thread-count tiers.
const ULTRALIGHT: f64 = 4_096.0;
const LIGHT: f64 = 32_768.0;
const MEDIUM: f64 = 262_144.0;
const HEAVY: f64 = 2_097_152.0;
const MAXIMUM: f64 = 16_777_216.0;

/// Hardware concurrency as reported by the OS, at least 1.
pub fn max_threads() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// Map an element count and a per-element cost weight to a thread count.
///
/// Pure function of `element_count * cost_weight` compared against five fixed
/// thresholds; the result is non-decreasing in the weighted load and capped at
/// [`max_threads`]. Never blocks, never allocates.
///
/// # Examples
///
/// ```
/// use blocknet::threading::{partition, max_threads};
///
/// assert_eq!(partition(16, 1.0), 1);
/// assert!(partition(50_000_000, 4.0) <= max_threads());
/// ```
pub fn partition(element_count: usize, cost_weight: f32) -> usize {
    let load = element_count as f64 * cost_weight as f64;
    let cap = max_threads();
    let tier = if load < ULTRALIGHT {
        1
    } else if load < LIGHT {
        2
    } else if load < MEDIUM {
        4
    } else if load < HEAVY {
        8
    } else if load < MAXIMUM {
        16
    } else {
        cap
    };
    tier.clamp(1, cap)
}

/// Run `f(sample_index, sample_chunk)` over every `sample_len` chunk of `buf`.
///
/// Fans out on the rayon pool when `threads > 1` and there is more than one
/// sample; the single-sample case always runs on the calling thread. Distinct
/// samples own disjoint chunks, so the closure never races on the output
/// buffer. Any per-sample randomness must be derived from `sample_index`, not
/// from shared generator state.
pub fn for_each_sample<F>(buf: &mut [f32], sample_len: usize, threads: usize, f: F)
where
    F: Fn(usize, &mut [f32]) + Sync,
{
    assert!(sample_len > 0, "sample_len must be non-zero");
    assert_eq!(buf.len() % sample_len, 0, "buffer is not a whole number of samples");
    let batch = buf.len() / sample_len;

    if threads <= 1 || batch <= 1 {
        for (n, chunk) in buf.chunks_mut(sample_len).enumerate() {
            f(n, chunk);
        }
    } else {
        let min_len = batch.div_ceil(threads);
        buf.par_chunks_mut(sample_len)
            .with_min_len(min_len)
            .enumerate()
            .for_each(|(n, chunk)| f(n, chunk));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_single_thread_for_tiny_loads() {
        assert_eq!(partition(1, 1.0), 1);
        assert_eq!(partition(1000, 1.0), 1);
        assert_eq!(partition(0, 100.0), 1);
    }

    #[test]
    fn test_partition_monotone_in_weighted_load() {
        let loads = [
            1usize, 1 << 10, 1 << 13, 1 << 16, 1 << 19, 1 << 22, 1 << 25, 1 << 28,
        ];
        let mut prev = 0usize;
        for &elements in &loads {
            let t = partition(elements, 1.0);
            assert!(
                t >= prev,
                "thread count decreased: {} elements -> {} threads (prev {})",
                elements,
                t,
                prev
            );
            prev = t;
        }
    }

    #[test]
    fn test_partition_capped_at_hardware() {
        let cap = max_threads();
        assert!(partition(usize::MAX / 2, 8.0) <= cap);
        assert!(partition(1, 1.0) >= 1);
    }

    #[test]
    fn test_partition_cost_weight_scales_load() {
        // A heavy cost weight promotes a load across at least one tier.
        let light = partition(8_192, 1.0);
        let heavy = partition(8_192, 64.0);
        assert!(heavy >= light);
    }

    #[test]
    fn test_for_each_sample_serial() {
        let mut buf = vec![0.0f32; 12];
        for_each_sample(&mut buf, 4, 1, |n, chunk| {
            for v in chunk.iter_mut() {
                *v = n as f32;
            }
        });
        assert_eq!(&buf[0..4], &[0.0; 4]);
        assert_eq!(&buf[4..8], &[1.0; 4]);
        assert_eq!(&buf[8..12], &[2.0; 4]);
    }

    #[test]
    fn test_for_each_sample_parallel_matches_serial() {
        let sample_len = 16;
        let batch = 32;
        let mut serial = vec![0.0f32; sample_len * batch];
        let mut parallel = serial.clone();

        let work = |n: usize, chunk: &mut [f32]| {
            for (i, v) in chunk.iter_mut().enumerate() {
                *v = (n * 31 + i) as f32;
            }
        };
        for_each_sample(&mut serial, sample_len, 1, work);
        for_each_sample(&mut parallel, sample_len, 4, work);
        assert_eq!(serial, parallel);
    }

    #[test]
    #[should_panic(expected = "whole number of samples")]
    fn test_for_each_sample_ragged_panics() {
        let mut buf = vec![0.0f32; 10];
        for_each_sample(&mut buf, 4, 1, |_, _| {});
    }
}
