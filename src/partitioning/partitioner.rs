//! Key to segment mapping.

use crate::types::Segment;
use std::hash::Hasher;
use twox_hash::XxHash64;

/// Maps keys to segments by splitting the 64-bit xxHash space into
/// `num_segments` equal ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPartitioner {
    num_segments: usize,
}

impl KeyPartitioner {
    /// Create a partitioner.
    ///
    /// # Panics
    ///
    /// Panics if `num_segments` is zero.
    pub fn new(num_segments: usize) -> Self {
        assert!(num_segments > 0, "num_segments must be at least 1");
        Self { num_segments }
    }

    pub fn num_segments(&self) -> usize {
        self.num_segments
    }

    /// Segment a key belongs to.
    pub fn segment_of(&self, key: &[u8]) -> Segment {
        self.segment_of_hash(hash_key(key))
    }

    /// Segment a precomputed hash belongs to.
    pub fn segment_of_hash(&self, hash: u64) -> Segment {
        ((u128::from(hash) * self.num_segments as u128) >> 64) as Segment
    }

    /// First hash value of a segment's range.
    pub fn segment_start(&self, segment: Segment) -> u64 {
        let start = ((segment as u128) << 64).div_ceil(self.num_segments as u128);
        start.min(u128::from(u64::MAX)) as u64
    }

    /// Middle of a segment's hash range.
    pub fn segment_midpoint(&self, segment: Segment) -> u64 {
        let start = u128::from(self.segment_start(segment));
        let end = if segment + 1 >= self.num_segments {
            1u128 << 64
        } else {
            u128::from(self.segment_start(segment + 1))
        };
        (start + (end - start) / 2) as u64
    }
}

/// xxHash64 of a key.
pub fn hash_key(key: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(key);
    hasher.finish()
}
