/*!
 * Segment Chunk
 *
 * One device-memory block managed as a sorted list of free spans measured
 * in whole segments. Allocation is first-fit from the front of the first
 * span large enough; release re-inserts the span and merges it with its
 * direct neighbours, so two adjacent free spans never coexist.
 */

use crate::core::types::{DeviceSize, MemoryTypeIndex};
use crate::device::{DeviceMemory, MemoryDevice};
use crate::memory::traits::SubAllocator;
use crate::memory::types::{AllocationHandle, ChunkSlot, ChunkStrategy, MemoryError, MemoryResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};
use tracing::{error, info, trace};

/// Free span, in segment units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeSpan {
    pub position: u32,
    pub count: u32,
}

impl FreeSpan {
    pub fn end(&self) -> u32 {
        self.position + self.count
    }

    /// Check if this span ends exactly where `other` begins
    pub fn is_adjacent_to(&self, other: &FreeSpan) -> bool {
        self.end() == other.position
    }
}

/// Sorted free-list chunk allocator
pub struct SegmentChunk {
    /// position -> count, ordered by position
    free: BTreeMap<u32, u32>,
    segment_size: DeviceSize,
    segment_count: u32,
    memory: DeviceMemory,
    memory_type_index: MemoryTypeIndex,
    allocated_segments: u32,
    destroyed: bool,
}

impl SegmentChunk {
    /// Round `chunk_size` down to whole segments, allocate the block and
    /// seed one free span covering all of it.
    pub fn new(
        device: &dyn MemoryDevice,
        memory_type_index: MemoryTypeIndex,
        segment_size: DeviceSize,
        chunk_size: DeviceSize,
    ) -> MemoryResult<Self> {
        if segment_size == 0 {
            return Err(MemoryError::InvalidConfig(
                "segment size cannot be zero".to_string(),
            ));
        }

        let segment_count = u32::try_from(chunk_size / segment_size).map_err(|_| {
            MemoryError::InvalidConfig(format!(
                "{} byte chunk holds more than u32::MAX segments of {} bytes",
                chunk_size, segment_size
            ))
        })?;
        if segment_count == 0 {
            return Err(MemoryError::InvalidConfig(format!(
                "{} byte chunk is smaller than one {} byte segment",
                chunk_size, segment_size
            )));
        }

        let capacity = segment_count as DeviceSize * segment_size;
        let memory = device
            .allocate_device_memory(capacity, memory_type_index)
            .map_err(|err| MemoryError::device(capacity, memory_type_index, err))?;

        let mut free = BTreeMap::new();
        free.insert(0, segment_count);

        info!(
            %memory,
            capacity,
            segment_size,
            segment_count,
            memory_type_index,
            "Segment chunk created"
        );

        Ok(Self {
            free,
            segment_size,
            segment_count,
            memory,
            memory_type_index,
            allocated_segments: 0,
            destroyed: false,
        })
    }

    pub fn segment_size(&self) -> DeviceSize {
        self.segment_size
    }

    pub fn segment_count(&self) -> u32 {
        self.segment_count
    }

    /// Snapshot of the free list in position order
    pub fn free_spans(&self) -> Vec<FreeSpan> {
        self.free
            .iter()
            .map(|(&position, &count)| FreeSpan { position, count })
            .collect()
    }

    fn segments_for(&self, size: DeviceSize) -> Option<u32> {
        let segments = size.div_ceil(self.segment_size).max(1);
        u32::try_from(segments).ok()
    }

    fn span_of(&self, handle: &AllocationHandle) -> Option<FreeSpan> {
        match handle.slot {
            ChunkSlot::Span { position, count }
                if handle.memory == self.memory
                    && count > 0
                    && position
                        .checked_add(count)
                        .is_some_and(|end| end <= self.segment_count)
                    && handle.offset == position as DeviceSize * self.segment_size
                    && handle.size == count as DeviceSize * self.segment_size =>
            {
                Some(FreeSpan { position, count })
            }
            _ => None,
        }
    }

    fn report_double_free(&self, handle: &AllocationHandle) -> MemoryError {
        error!(
            memory = %self.memory,
            offset = handle.offset,
            size = handle.size,
            "double free of segment span"
        );
        debug_assert!(false, "double free of segment span at {}", handle.offset);
        MemoryError::DoubleFree {
            offset: handle.offset,
            size: handle.size,
        }
    }
}

impl SubAllocator for SegmentChunk {
    fn allocate(&mut self, size: DeviceSize) -> Option<AllocationHandle> {
        debug_assert!(!self.destroyed, "allocate on a destroyed segment chunk");
        if self.destroyed {
            return None;
        }

        let needed = self.segments_for(size)?;
        let (position, count) = self
            .free
            .iter()
            .find(|&(_, &count)| count >= needed)
            .map(|(&position, &count)| (position, count))?;

        self.free.remove(&position);
        if count > needed {
            self.free.insert(position + needed, count - needed);
        }
        self.allocated_segments += needed;

        let handle = AllocationHandle {
            offset: position as DeviceSize * self.segment_size,
            size: needed as DeviceSize * self.segment_size,
            memory: self.memory,
            slot: ChunkSlot::Span {
                position,
                count: needed,
            },
        };

        trace!(
            memory = %self.memory,
            requested = size,
            position,
            segments = needed,
            free_spans = self.free.len(),
            "Segment span claimed"
        );
        Some(handle)
    }

    fn release(&mut self, handle: &AllocationHandle) -> MemoryResult<()> {
        let span = self.span_of(handle).ok_or(MemoryError::ForeignHandle {
            offset: handle.offset,
        })?;

        let before = self
            .free
            .range(..=span.position)
            .next_back()
            .map(|(&position, &count)| FreeSpan { position, count });
        let after = self
            .free
            .range((Excluded(span.position), Unbounded))
            .next()
            .map(|(&position, &count)| FreeSpan { position, count });

        // Any overlap with a free neighbour means this span is already free
        if before.is_some_and(|b| b.end() > span.position)
            || after.is_some_and(|a| a.position < span.end())
        {
            return Err(self.report_double_free(handle));
        }

        let mut merged = span;
        if let Some(before) = before.filter(|b| b.is_adjacent_to(&span)) {
            self.free.remove(&before.position);
            merged.position = before.position;
            merged.count += before.count;
        }
        if let Some(after) = after.filter(|a| span.is_adjacent_to(a)) {
            self.free.remove(&after.position);
            merged.count += after.count;
        }
        self.free.insert(merged.position, merged.count);
        self.allocated_segments -= span.count;

        trace!(
            memory = %self.memory,
            position = span.position,
            segments = span.count,
            merged_position = merged.position,
            merged_segments = merged.count,
            "Segment span released"
        );
        Ok(())
    }

    fn has_free_space(&self) -> bool {
        !self.destroyed && !self.free.is_empty()
    }

    fn capacity(&self) -> DeviceSize {
        self.segment_count as DeviceSize * self.segment_size
    }

    fn free_bytes(&self) -> DeviceSize {
        (self.segment_count - self.allocated_segments) as DeviceSize * self.segment_size
    }

    fn memory(&self) -> DeviceMemory {
        self.memory
    }

    fn memory_type_index(&self) -> MemoryTypeIndex {
        self.memory_type_index
    }

    fn strategy(&self) -> ChunkStrategy {
        ChunkStrategy::Segment
    }

    fn destroy(&mut self, device: &dyn MemoryDevice) {
        if self.destroyed {
            return;
        }
        device.free_device_memory(self.memory);
        self.destroyed = true;
        info!(
            memory = %self.memory,
            capacity = self.capacity(),
            outstanding_segments = self.allocated_segments,
            "Segment chunk destroyed"
        );
    }
}
