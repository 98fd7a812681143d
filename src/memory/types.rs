/*!
 * Memory Types
 * Handles, caller-facing records, errors and statistics
 */

use crate::core::types::{split_region_key, DeviceSize, MemoryTypeIndex, RegionKey, SizeClass};
use crate::device::{DeviceError, DeviceMemory, MemoryPropertyFlags};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Memory operation result
pub type MemoryResult<T> = Result<T, MemoryError>;

/// Memory errors
#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
pub enum MemoryError {
    #[error("No suitable memory type for mask 0b{type_mask:b} with flags {flags:?}")]
    #[diagnostic(
        code(memory::no_suitable_memory_type),
        help("The resource's memory requirements cannot be satisfied by any device memory type.")
    )]
    NoSuitableMemoryType {
        type_mask: u32,
        flags: MemoryPropertyFlags,
    },

    #[error("Request too large: {requested} bytes, largest size class accepts < {max} bytes")]
    #[diagnostic(
        code(memory::request_too_large),
        help("Allocate dedicated device memory for this resource or raise max_ranges.")
    )]
    RequestTooLarge {
        requested: DeviceSize,
        max: DeviceSize,
    },

    #[error("Zero-sized memory request")]
    #[diagnostic(code(memory::zero_sized_request))]
    ZeroSizedRequest,

    #[error("Device allocation of {size} bytes (memory type {memory_type_index}) failed: {reason}")]
    #[diagnostic(
        code(memory::device_allocation_failed),
        help("The driver refused the allocation. The device is likely out of memory.")
    )]
    DeviceAllocationFailed {
        size: DeviceSize,
        memory_type_index: MemoryTypeIndex,
        reason: DeviceError,
    },

    #[error("Invalid allocator configuration: {0}")]
    #[diagnostic(code(memory::invalid_config))]
    InvalidConfig(String),

    #[error("Unknown chunk {chunk_index} in region 0x{region_key:x}")]
    #[diagnostic(
        code(memory::unknown_chunk),
        help("The record does not belong to this router or was used after cleanup.")
    )]
    UnknownChunk {
        region_key: RegionKey,
        chunk_index: u32,
    },

    #[error("Double free of {size} bytes at offset {offset}")]
    #[diagnostic(
        code(memory::double_free),
        help("An allocation record was returned more than once.")
    )]
    DoubleFree { offset: DeviceSize, size: DeviceSize },

    #[error("Handle at offset {offset} was not produced by this chunk")]
    #[diagnostic(
        code(memory::foreign_handle),
        help("The handle's coordinates or device block do not match the chunk it was returned to.")
    )]
    ForeignHandle { offset: DeviceSize },

    #[error("Allocation router has been shut down")]
    #[diagnostic(code(memory::shut_down))]
    ShutDown,
}

impl MemoryError {
    /// Wrap a driver failure with the allocation that triggered it
    pub fn device(size: DeviceSize, memory_type_index: MemoryTypeIndex, err: DeviceError) -> Self {
        match err {
            DeviceError::NoSuitableMemoryType { type_mask, flags } => {
                MemoryError::NoSuitableMemoryType { type_mask, flags }
            }
            reason => MemoryError::DeviceAllocationFailed {
                size,
                memory_type_index,
                reason,
            },
        }
    }
}

/// Where inside its chunk an allocation lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChunkSlot {
    /// Buddy tree coordinates
    Tree { layer: u32, index: u32 },
    /// Free-list span, in segment units
    Span { position: u32, count: u32 },
}

/// Result of a successful chunk allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllocationHandle {
    pub offset: DeviceSize,
    pub size: DeviceSize,
    pub memory: DeviceMemory,
    pub slot: ChunkSlot,
}

impl AllocationHandle {
    /// Buddy tree layer (0 = leaves), if this came from a buddy chunk
    pub fn layer(&self) -> Option<u32> {
        match self.slot {
            ChunkSlot::Tree { layer, .. } => Some(layer),
            ChunkSlot::Span { .. } => None,
        }
    }

    /// Flattened buddy tree node index, if this came from a buddy chunk
    pub fn index(&self) -> Option<u32> {
        match self.slot {
            ChunkSlot::Tree { index, .. } => Some(index),
            ChunkSlot::Span { .. } => None,
        }
    }

    /// One past the last byte
    pub fn end(&self) -> DeviceSize {
        self.offset + self.size
    }

    /// Whether two handles share any byte of the same device block
    pub fn overlaps(&self, other: &AllocationHandle) -> bool {
        self.memory == other.memory && self.offset < other.end() && other.offset < self.end()
    }
}

/// Caller-facing allocation token
///
/// Opaque to callers: hand it back to `return_memory` unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllocationRecord {
    pub region_key: RegionKey,
    pub chunk_index: u32,
    pub handle: AllocationHandle,
}

impl AllocationRecord {
    pub fn offset(&self) -> DeviceSize {
        self.handle.offset
    }

    pub fn size(&self) -> DeviceSize {
        self.handle.size
    }

    pub fn memory(&self) -> DeviceMemory {
        self.handle.memory
    }

    pub fn size_class(&self) -> SizeClass {
        split_region_key(self.region_key).0
    }

    pub fn memory_type_index(&self) -> MemoryTypeIndex {
        split_region_key(self.region_key).1
    }
}

/// Which sub-allocation algorithm a region's chunks use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStrategy {
    /// Power-of-two buddy tree
    #[default]
    Buddy,
    /// First-fit sorted free list
    Segment,
}

impl std::fmt::Display for ChunkStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ChunkStrategy::Buddy => write!(f, "buddy"),
            ChunkStrategy::Segment => write!(f, "segment"),
        }
    }
}

impl std::str::FromStr for ChunkStrategy {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buddy" => Ok(ChunkStrategy::Buddy),
            "segment" => Ok(ChunkStrategy::Segment),
            other => Err(MemoryError::InvalidConfig(format!(
                "unknown chunk strategy '{}'",
                other
            ))),
        }
    }
}

/// Router-wide statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterStats {
    pub regions: usize,
    pub chunks: usize,
    /// Bytes reserved from the device across all chunks
    pub reserved_bytes: DeviceSize,
    /// Bytes currently handed out (segment granularity)
    pub allocated_bytes: DeviceSize,
    pub live_allocations: u64,
    pub requests: u64,
    pub returns: u64,
}

/// Per-region statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionStats {
    pub region_key: RegionKey,
    pub size_class: SizeClass,
    pub memory_type_index: MemoryTypeIndex,
    pub strategy: ChunkStrategy,
    pub chunks: usize,
    pub capacity: DeviceSize,
    pub free_bytes: DeviceSize,
}
