/*!
 * Size Classes
 *
 * Geometric request buckets. Class `i` starts at
 * `base << (i * (shift + 1))` and accepts requests below `range_base(i) << shift`.
 */

use crate::core::types::{DeviceSize, SizeClass};
use crate::memory::config::RouterConfig;

/// Size class geometry derived from a `RouterConfig`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClasses {
    base_segment_size: DeviceSize,
    shift: u32,
    max_ranges: u32,
    chunk_element_count: u32,
}

impl SizeClasses {
    pub fn new(config: &RouterConfig) -> Self {
        Self {
            base_segment_size: config.base_segment_size,
            shift: config.range_shift,
            max_ranges: config.max_ranges,
            chunk_element_count: config.chunk_element_count,
        }
    }

    pub fn count(&self) -> u32 {
        self.max_ranges
    }

    /// Smallest segment of class `i`
    #[inline]
    pub fn range_base(&self, i: SizeClass) -> DeviceSize {
        self.base_segment_size << (i * (self.shift + 1))
    }

    /// Exclusive upper bound of requests in class `i`
    #[inline]
    pub fn range_max(&self, i: SizeClass) -> DeviceSize {
        self.range_base(i) << self.shift
    }

    /// Bytes per chunk for class `i`
    #[inline]
    pub fn chunk_size(&self, i: SizeClass) -> DeviceSize {
        self.range_base(i) * self.chunk_element_count as DeviceSize
    }

    /// Requests must stay strictly below this
    pub fn max_request(&self) -> DeviceSize {
        self.range_max(self.max_ranges - 1)
    }

    /// Smallest class whose `range_max` exceeds `size`, clamped to the last
    /// class for oversized requests (the router rejects those separately).
    pub fn range_index(&self, size: DeviceSize) -> SizeClass {
        (0..self.max_ranges)
            .find(|&i| size < self.range_max(i))
            .unwrap_or(self.max_ranges - 1)
    }
}
