/*!
 * Simulated Device
 *
 * Host-side stand-in for a GPU: a memory type table plus per-heap byte
 * budgets. No bytes are actually reserved; the device only tracks which
 * blocks are live so teardown and out-of-memory paths can be verified.
 */

use super::traits::{find_memory_type_index, MemoryDevice};
use super::types::{DeviceError, DeviceMemory, DeviceResult, MemoryPropertyFlags, MemoryType};
use crate::core::types::{DeviceSize, MemoryTypeIndex, MemoryTypeMask};
use ahash::RandomState;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
struct LiveBlock {
    size: DeviceSize,
    heap_index: u32,
}

/// Simulated device with a fixed memory type table
pub struct SimulatedDevice {
    memory_types: Vec<MemoryType>,
    heap_budgets: Vec<DeviceSize>,
    heap_usage: Mutex<Vec<DeviceSize>>,
    live: DashMap<DeviceMemory, LiveBlock, RandomState>,
    next_handle: AtomicU64,
    total_allocations: AtomicU64,
}

impl SimulatedDevice {
    /// Create a device from a memory type table and one budget per heap
    pub fn new(memory_types: Vec<MemoryType>, heap_budgets: Vec<DeviceSize>) -> Self {
        let heaps = heap_budgets.len();
        Self {
            memory_types,
            heap_budgets,
            heap_usage: Mutex::new(vec![0; heaps]),
            live: DashMap::with_hasher(RandomState::new()),
            next_handle: AtomicU64::new(1),
            total_allocations: AtomicU64::new(0),
        }
    }

    /// Typical discrete GPU: device-local VRAM heap plus a host-visible heap
    ///
    /// Types: 0 = device local, 1 = host visible|coherent,
    /// 2 = host visible|coherent|cached, 3 = device local|host visible (BAR)
    pub fn discrete(vram_bytes: DeviceSize, host_bytes: DeviceSize) -> Self {
        use MemoryPropertyFlags as F;
        Self::new(
            vec![
                MemoryType::new(F::DEVICE_LOCAL, 0),
                MemoryType::new(F::HOST_VISIBLE | F::HOST_COHERENT, 1),
                MemoryType::new(F::HOST_VISIBLE | F::HOST_COHERENT | F::HOST_CACHED, 1),
                MemoryType::new(F::DEVICE_LOCAL | F::HOST_VISIBLE | F::HOST_COHERENT, 0),
            ],
            vec![vram_bytes, host_bytes],
        )
    }

    pub fn memory_types(&self) -> &[MemoryType] {
        &self.memory_types
    }

    /// Number of device blocks currently allocated
    pub fn live_allocations(&self) -> usize {
        self.live.len()
    }

    /// Bytes currently allocated from a heap
    pub fn heap_usage(&self, heap_index: u32) -> DeviceSize {
        self.heap_usage
            .lock()
            .get(heap_index as usize)
            .copied()
            .unwrap_or(0)
    }

    /// Total number of successful `allocate_device_memory` calls
    pub fn total_allocations(&self) -> u64 {
        self.total_allocations.load(Ordering::Relaxed)
    }

    /// Size of a live block, if the handle is live
    pub fn block_size(&self, memory: DeviceMemory) -> Option<DeviceSize> {
        self.live.get(&memory).map(|entry| entry.value().size)
    }
}

impl MemoryDevice for SimulatedDevice {
    fn find_memory_type_index(
        &self,
        type_mask: MemoryTypeMask,
        flags: MemoryPropertyFlags,
    ) -> DeviceResult<MemoryTypeIndex> {
        find_memory_type_index(&self.memory_types, type_mask, flags)
    }

    fn allocate_device_memory(
        &self,
        size: DeviceSize,
        memory_type_index: MemoryTypeIndex,
    ) -> DeviceResult<DeviceMemory> {
        let heap_index = self
            .memory_types
            .get(memory_type_index as usize)
            .map(|ty| ty.heap_index)
            .ok_or(DeviceError::InvalidMemoryType(memory_type_index))?;

        {
            let mut usage = self.heap_usage.lock();
            let budget = self
                .heap_budgets
                .get(heap_index as usize)
                .copied()
                .unwrap_or(0);
            let used = usage.get(heap_index as usize).copied().unwrap_or(0);
            let available = budget.saturating_sub(used);

            if size > available {
                warn!(
                    requested = size,
                    heap_index,
                    available,
                    "Simulated device heap exhausted"
                );
                return Err(DeviceError::OutOfDeviceMemory {
                    requested: size,
                    heap_index,
                    available,
                });
            }

            if let Some(slot) = usage.get_mut(heap_index as usize) {
                *slot += size;
            }
        }

        let memory = DeviceMemory::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.live.insert(memory, LiveBlock { size, heap_index });
        self.total_allocations.fetch_add(1, Ordering::Relaxed);

        debug!(%memory, size, memory_type_index, heap_index, "Device memory allocated");
        Ok(memory)
    }

    fn free_device_memory(&self, memory: DeviceMemory) {
        match self.live.remove(&memory) {
            Some((_, block)) => {
                let mut usage = self.heap_usage.lock();
                if let Some(slot) = usage.get_mut(block.heap_index as usize) {
                    *slot = slot.saturating_sub(block.size);
                }
                debug!(%memory, size = block.size, "Device memory freed");
            }
            None => {
                warn!(%memory, "Attempted to free unknown device memory");
            }
        }
    }
}
