/*!
 * Device Types
 * Memory property flags, memory type descriptions and driver errors
 */

use crate::core::types::{DeviceSize, MemoryTypeIndex, MemoryTypeMask};
use bitflags::bitflags;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Device operation result
pub type DeviceResult<T> = Result<T, DeviceError>;

bitflags! {
    /// Memory property flags requested by a resource.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MemoryPropertyFlags: u32 {
        /// Fastest memory for device access.
        const DEVICE_LOCAL = 1 << 0;
        /// Mappable by the host.
        const HOST_VISIBLE = 1 << 1;
        /// Host writes visible without explicit flushes.
        const HOST_COHERENT = 1 << 2;
        /// Cached on the host.
        const HOST_CACHED = 1 << 3;
        /// Backed lazily by the implementation.
        const LAZILY_ALLOCATED = 1 << 4;
        /// Protected memory.
        const PROTECTED = 1 << 5;
    }
}

impl Default for MemoryPropertyFlags {
    fn default() -> Self {
        MemoryPropertyFlags::empty()
    }
}

/// One entry of the device's memory type table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryType {
    pub property_flags: MemoryPropertyFlags,
    pub heap_index: u32,
}

impl MemoryType {
    pub const fn new(property_flags: MemoryPropertyFlags, heap_index: u32) -> Self {
        Self {
            property_flags,
            heap_index,
        }
    }
}

/// Opaque, non-owning reference to one device-memory block
///
/// Copying the handle never duplicates the underlying allocation; the chunk
/// that requested it is its only owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceMemory(u64);

impl DeviceMemory {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for DeviceMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "mem#{:x}", self.0)
    }
}

/// Driver boundary errors
#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
pub enum DeviceError {
    #[error("No memory type matches mask 0b{type_mask:b} with flags {flags:?}")]
    #[diagnostic(
        code(device::no_suitable_memory_type),
        help("The resource's memory requirements cannot be met by this device.")
    )]
    NoSuitableMemoryType {
        type_mask: MemoryTypeMask,
        flags: MemoryPropertyFlags,
    },

    #[error("Out of device memory: requested {requested} bytes from heap {heap_index}, {available} bytes available")]
    #[diagnostic(
        code(device::out_of_memory),
        help("The device heap is exhausted. Release resources or lower texture budgets.")
    )]
    OutOfDeviceMemory {
        requested: DeviceSize,
        heap_index: u32,
        available: DeviceSize,
    },

    #[error("Memory type index {0} does not exist on this device")]
    #[diagnostic(code(device::invalid_memory_type))]
    InvalidMemoryType(MemoryTypeIndex),
}
