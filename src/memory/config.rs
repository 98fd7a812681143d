/*!
 * Router Configuration
 *
 * Size-class geometry and chunk strategy selection
 */

use super::types::{ChunkStrategy, MemoryError, MemoryResult};
use crate::core::limits::{
    DEFAULT_BASE_SEGMENT_SIZE, DEFAULT_CHUNK_ELEMENT_COUNT, DEFAULT_MAX_RANGES,
    DEFAULT_RANGE_SHIFT, ENV_BASE_SEGMENT, ENV_CHUNK_ELEMENTS, ENV_MAX_RANGES, ENV_RANGE_SHIFT,
    ENV_STRATEGY, MAX_BUDDY_TREE_DEPTH, MAX_SIZE_CLASSES,
};
use crate::core::types::{DeviceSize, SizeClass};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Allocation router configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Leaf size of size class 0; every class base is a power-of-two multiple
    pub base_segment_size: DeviceSize,
    /// A class accepts requests below `base << shift`
    pub range_shift: u32,
    /// Number of size classes
    pub max_ranges: u32,
    /// Leaf segments per chunk (power of two)
    pub chunk_element_count: u32,
    /// Strategy for classes without an override
    pub default_strategy: ChunkStrategy,
    /// Per-class strategy overrides
    pub strategy_overrides: BTreeMap<SizeClass, ChunkStrategy>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            base_segment_size: DEFAULT_BASE_SEGMENT_SIZE,
            range_shift: DEFAULT_RANGE_SHIFT,
            max_ranges: DEFAULT_MAX_RANGES,
            chunk_element_count: DEFAULT_CHUNK_ELEMENT_COUNT,
            default_strategy: ChunkStrategy::Buddy,
            strategy_overrides: BTreeMap::new(),
        }
    }
}

impl RouterConfig {
    pub fn with_base_segment_size(mut self, size: DeviceSize) -> Self {
        self.base_segment_size = size;
        self
    }

    pub fn with_range_shift(mut self, shift: u32) -> Self {
        self.range_shift = shift;
        self
    }

    pub fn with_max_ranges(mut self, ranges: u32) -> Self {
        self.max_ranges = ranges;
        self
    }

    pub fn with_chunk_element_count(mut self, count: u32) -> Self {
        self.chunk_element_count = count;
        self
    }

    pub fn with_default_strategy(mut self, strategy: ChunkStrategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    pub fn with_strategy_for(mut self, size_class: SizeClass, strategy: ChunkStrategy) -> Self {
        self.strategy_overrides.insert(size_class, strategy);
        self
    }

    /// Strategy used by regions of `size_class`
    pub fn strategy_for(&self, size_class: SizeClass) -> ChunkStrategy {
        self.strategy_overrides
            .get(&size_class)
            .copied()
            .unwrap_or(self.default_strategy)
    }

    /// Buddy tree depth giving `chunk_element_count` leaves
    pub fn buddy_tree_depth(&self) -> u32 {
        self.chunk_element_count.trailing_zeros() + 1
    }

    /// Defaults overlaid with `RENDER_MEMORY_*` environment variables
    pub fn from_env() -> MemoryResult<Self> {
        let mut config = Self::default();
        if let Some(v) = env_value::<DeviceSize>(ENV_BASE_SEGMENT)? {
            config.base_segment_size = v;
        }
        if let Some(v) = env_value::<u32>(ENV_RANGE_SHIFT)? {
            config.range_shift = v;
        }
        if let Some(v) = env_value::<u32>(ENV_MAX_RANGES)? {
            config.max_ranges = v;
        }
        if let Some(v) = env_value::<u32>(ENV_CHUNK_ELEMENTS)? {
            config.chunk_element_count = v;
        }
        if let Some(v) = env_value::<ChunkStrategy>(ENV_STRATEGY)? {
            config.default_strategy = v;
        }
        config.validate()?;
        Ok(config)
    }

    /// Reject geometries the router cannot serve
    pub fn validate(&self) -> MemoryResult<()> {
        let invalid = |msg: String| Err(MemoryError::InvalidConfig(msg));

        if self.base_segment_size == 0 || !self.base_segment_size.is_power_of_two() {
            return invalid(format!(
                "base_segment_size must be a non-zero power of two, got {}",
                self.base_segment_size
            ));
        }
        if self.max_ranges == 0 || self.max_ranges > MAX_SIZE_CLASSES {
            return invalid(format!(
                "max_ranges must be in 1..={}, got {}",
                MAX_SIZE_CLASSES, self.max_ranges
            ));
        }
        if self.chunk_element_count == 0 || !self.chunk_element_count.is_power_of_two() {
            return invalid(format!(
                "chunk_element_count must be a non-zero power of two, got {}",
                self.chunk_element_count
            ));
        }
        if self.buddy_tree_depth() > MAX_BUDDY_TREE_DEPTH {
            return invalid(format!(
                "chunk_element_count {} needs a buddy tree deeper than {}",
                self.chunk_element_count, MAX_BUDDY_TREE_DEPTH
            ));
        }
        if self.range_shift >= 32 || (self.chunk_element_count as u64) < (1u64 << self.range_shift)
        {
            return invalid(format!(
                "chunk_element_count {} cannot hold a request of 2^{} base segments",
                self.chunk_element_count, self.range_shift
            ));
        }

        // Largest chunk: last class base times the element count
        let last = self.max_ranges - 1;
        let shift_bits = last as u64 * (self.range_shift as u64 + 1)
            + self.chunk_element_count.trailing_zeros() as u64;
        let headroom = self.base_segment_size.leading_zeros() as u64;
        if shift_bits >= headroom {
            return invalid(format!(
                "{} size classes of base {} with {} elements overflow u64",
                self.max_ranges, self.base_segment_size, self.chunk_element_count
            ));
        }

        if let Some((&class, _)) = self
            .strategy_overrides
            .iter()
            .find(|&(&class, _)| class >= self.max_ranges)
        {
            return invalid(format!(
                "strategy override for size class {} but only {} classes exist",
                class, self.max_ranges
            ));
        }

        // Segment chunks index their free list with u32 segment counts
        let largest_segment_class = (0..self.max_ranges)
            .filter(|&class| self.strategy_for(class) == ChunkStrategy::Segment)
            .max();
        if let Some(class) = largest_segment_class {
            let segment_bits = class as u64 * (self.range_shift as u64 + 1)
                + self.chunk_element_count.trailing_zeros() as u64;
            if segment_bits >= u32::BITS as u64 {
                return invalid(format!(
                    "segment chunks of size class {} need 2^{} segments, more than u32::MAX",
                    class, segment_bits
                ));
            }
        }

        Ok(())
    }
}

fn env_value<T: FromStr>(key: &str) -> MemoryResult<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| MemoryError::InvalidConfig(format!("{}={} is not valid", key, raw))),
        Err(_) => Ok(None),
    }
}
