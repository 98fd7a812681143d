/*!
 * Buddy Chunk
 *
 * One device-memory block subdivided by a binary buddy tree packed into a
 * byte array. Node `0` is the root (the whole chunk); the children of node
 * `i` are `2i + 1` and `2i + 2`. Layer 0 holds the leaves (one segment
 * each) and layer `depth - 1` is the root, so a node on layer `l` covers
 * `segment_size << l` bytes.
 *
 * Each node byte carries three flags:
 * - `FREE`: some leaf below (or the node itself, if unsplit) is available
 * - `SPLIT`: the node has been subdivided into two live children
 * - `RIGHT_BUDDY`: the node is its parent's right child
 *
 * Parent, child and sibling relations are pure index arithmetic.
 */

use crate::core::limits::MAX_BUDDY_TREE_DEPTH;
use crate::core::types::{DeviceSize, MemoryTypeIndex};
use crate::device::{DeviceMemory, MemoryDevice};
use crate::memory::traits::SubAllocator;
use crate::memory::types::{AllocationHandle, ChunkSlot, ChunkStrategy, MemoryError, MemoryResult};
use bitflags::bitflags;
use tracing::{error, info, trace};

bitflags! {
    /// Packed state of one buddy tree node.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeState: u8 {
        const FREE = 1 << 0;
        const SPLIT = 1 << 1;
        const RIGHT_BUDDY = 1 << 2;
    }
}

/// Buddy-tree chunk allocator
pub struct BuddyChunk {
    nodes: Vec<NodeState>,
    segment_size: DeviceSize,
    tree_depth: u32,
    memory: DeviceMemory,
    memory_type_index: MemoryTypeIndex,
    allocated: DeviceSize,
    destroyed: bool,
}

impl BuddyChunk {
    /// Allocate a `segment_size << (tree_depth - 1)` byte block from the
    /// device and build a fully free tree over it.
    pub fn new(
        device: &dyn MemoryDevice,
        memory_type_index: MemoryTypeIndex,
        segment_size: DeviceSize,
        tree_depth: u32,
    ) -> MemoryResult<Self> {
        let capacity = Self::capacity_for(segment_size, tree_depth)?;

        let memory = device
            .allocate_device_memory(capacity, memory_type_index)
            .map_err(|err| MemoryError::device(capacity, memory_type_index, err))?;

        let node_count = (1usize << tree_depth) - 1;
        let nodes = (0..node_count)
            .map(|index| {
                // Even non-root indices are right children
                if index != 0 && index % 2 == 0 {
                    NodeState::FREE | NodeState::RIGHT_BUDDY
                } else {
                    NodeState::FREE
                }
            })
            .collect();

        info!(
            %memory,
            capacity,
            segment_size,
            tree_depth,
            memory_type_index,
            "Buddy chunk created"
        );

        Ok(Self {
            nodes,
            segment_size,
            tree_depth,
            memory,
            memory_type_index,
            allocated: 0,
            destroyed: false,
        })
    }

    /// Chunk capacity for a given geometry, rejecting degenerate trees
    pub fn capacity_for(segment_size: DeviceSize, tree_depth: u32) -> MemoryResult<DeviceSize> {
        if segment_size == 0 {
            return Err(MemoryError::InvalidConfig(
                "buddy segment size cannot be zero".to_string(),
            ));
        }
        if tree_depth == 0 || tree_depth > MAX_BUDDY_TREE_DEPTH {
            return Err(MemoryError::InvalidConfig(format!(
                "buddy tree depth must be in 1..={}, got {}",
                MAX_BUDDY_TREE_DEPTH, tree_depth
            )));
        }
        segment_size
            .checked_mul(1u64 << (tree_depth - 1))
            .ok_or_else(|| {
                MemoryError::InvalidConfig(format!(
                    "buddy chunk of {} x 2^{} bytes overflows",
                    segment_size,
                    tree_depth - 1
                ))
            })
    }

    pub fn segment_size(&self) -> DeviceSize {
        self.segment_size
    }

    pub fn tree_depth(&self) -> u32 {
        self.tree_depth
    }

    pub fn leaf_count(&self) -> usize {
        1 << (self.tree_depth - 1)
    }

    /// First flattened index on `layer`
    #[inline]
    pub fn layer_start(&self, layer: u32) -> usize {
        (1usize << (self.tree_depth - layer - 1)) - 1
    }

    /// Layer a flattened index sits on
    #[inline]
    fn layer_of(&self, index: usize) -> u32 {
        let row = usize::BITS - 1 - (index + 1).leading_zeros();
        self.tree_depth - 1 - row
    }

    #[inline]
    fn block_size(&self, layer: u32) -> DeviceSize {
        self.segment_size << layer
    }

    /// Byte offset of node `index` on `layer`
    #[inline]
    pub fn offset(&self, layer: u32, index: usize) -> DeviceSize {
        (index - self.layer_start(layer)) as DeviceSize * self.block_size(layer)
    }

    #[inline]
    fn buddy_of(&self, index: usize) -> usize {
        if self.nodes[index].contains(NodeState::RIGHT_BUDDY) {
            index - 1
        } else {
            index + 1
        }
    }

    /// Smallest layer whose block holds `size` bytes
    fn target_layer(&self, size: DeviceSize) -> Option<u32> {
        let mut layer = 0;
        let mut block = self.segment_size;
        while block < size {
            layer += 1;
            if layer >= self.tree_depth {
                return None;
            }
            block <<= 1;
        }
        Some(layer)
    }

    /// State of the node at `(layer, index)`, if the coordinates are valid
    pub fn node_state(&self, layer: u32, index: usize) -> Option<NodeState> {
        if index >= self.nodes.len() || self.layer_of(index) != layer {
            return None;
        }
        Some(self.nodes[index])
    }

    /// Free bytes found by walking the tree from the root
    ///
    /// Always equals `capacity() - allocated_bytes()` while the tree is
    /// consistent; tests use it to check that.
    pub fn reachable_free_bytes(&self) -> DeviceSize {
        self.reachable_free(0, self.tree_depth - 1)
    }

    fn reachable_free(&self, index: usize, layer: u32) -> DeviceSize {
        let state = self.nodes[index];
        if !state.contains(NodeState::FREE) {
            0
        } else if !state.contains(NodeState::SPLIT) || layer == 0 {
            self.block_size(layer)
        } else {
            let left = 2 * index + 1;
            self.reachable_free(left, layer - 1) + self.reachable_free(left + 1, layer - 1)
        }
    }

    /// Depth-first search for a free, unsplit node on `target`
    fn search(&mut self, index: usize, layer: u32, target: u32) -> Option<usize> {
        let state = self.nodes[index];
        if !state.contains(NodeState::FREE) {
            return None;
        }

        if layer == target {
            if state.contains(NodeState::SPLIT) {
                return None;
            }
            self.nodes[index].remove(NodeState::FREE);
            return Some(index);
        }

        // Descending past a node subdivides it
        self.nodes[index].insert(NodeState::SPLIT);

        let left = 2 * index + 1;
        if let Some(found) = self.search(left, layer - 1, target) {
            return Some(found);
        }
        self.search(left + 1, layer - 1, target)
    }

    /// A parent stops being free once both children are taken
    fn propagate_allocated(&mut self, mut index: usize) {
        while index > 0 {
            let buddy = self.buddy_of(index);
            if self.nodes[buddy].contains(NodeState::FREE) {
                break;
            }
            let parent = (index - 1) / 2;
            self.nodes[parent].remove(NodeState::FREE);
            index = parent;
        }
    }

    /// Mark ancestors free and merge buddies while both halves are whole
    fn propagate_released(&mut self, mut index: usize) {
        let mut merging = true;
        while index > 0 {
            let parent = (index - 1) / 2;
            let buddy = self.buddy_of(index);
            self.nodes[parent].insert(NodeState::FREE);

            if merging {
                let whole = |state: NodeState| {
                    state.contains(NodeState::FREE) && !state.contains(NodeState::SPLIT)
                };
                if whole(self.nodes[index]) && whole(self.nodes[buddy]) {
                    self.nodes[parent].remove(NodeState::SPLIT);
                } else {
                    merging = false;
                }
            }

            index = parent;
        }
    }
}

impl SubAllocator for BuddyChunk {
    fn allocate(&mut self, size: DeviceSize) -> Option<AllocationHandle> {
        debug_assert!(!self.destroyed, "allocate on a destroyed buddy chunk");
        if self.destroyed {
            return None;
        }

        let target = self.target_layer(size)?;
        let index = self.search(0, self.tree_depth - 1, target)?;
        self.propagate_allocated(index);

        let block = self.block_size(target);
        self.allocated += block;

        let handle = AllocationHandle {
            offset: self.offset(target, index),
            size: block,
            memory: self.memory,
            slot: ChunkSlot::Tree {
                layer: target,
                index: index as u32,
            },
        };

        trace!(
            memory = %self.memory,
            requested = size,
            layer = target,
            index,
            offset = handle.offset,
            "Buddy block claimed"
        );
        Some(handle)
    }

    fn release(&mut self, handle: &AllocationHandle) -> MemoryResult<()> {
        let (layer, index) = match handle.slot {
            ChunkSlot::Tree { layer, index } => (layer, index as usize),
            ChunkSlot::Span { .. } => {
                return Err(MemoryError::ForeignHandle {
                    offset: handle.offset,
                })
            }
        };

        let state = match self.node_state(layer, index) {
            Some(state)
                if handle.memory == self.memory
                    && handle.offset == self.offset(layer, index)
                    && handle.size == self.block_size(layer) =>
            {
                state
            }
            _ => {
                return Err(MemoryError::ForeignHandle {
                    offset: handle.offset,
                })
            }
        };

        if state.contains(NodeState::FREE) || state.contains(NodeState::SPLIT) {
            error!(
                memory = %self.memory,
                layer,
                index,
                offset = handle.offset,
                "double free of buddy block"
            );
            debug_assert!(false, "double free of buddy block {}/{}", layer, index);
            return Err(MemoryError::DoubleFree {
                offset: handle.offset,
                size: handle.size,
            });
        }

        self.nodes[index].insert(NodeState::FREE);
        self.allocated -= self.block_size(layer);
        self.propagate_released(index);

        trace!(
            memory = %self.memory,
            layer,
            index,
            offset = handle.offset,
            "Buddy block released"
        );
        Ok(())
    }

    fn has_free_space(&self) -> bool {
        !self.destroyed && self.nodes[0].contains(NodeState::FREE)
    }

    fn capacity(&self) -> DeviceSize {
        self.block_size(self.tree_depth - 1)
    }

    fn free_bytes(&self) -> DeviceSize {
        self.capacity() - self.allocated
    }

    fn memory(&self) -> DeviceMemory {
        self.memory
    }

    fn memory_type_index(&self) -> MemoryTypeIndex {
        self.memory_type_index
    }

    fn strategy(&self) -> ChunkStrategy {
        ChunkStrategy::Buddy
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
            outstanding = self.allocated,
            "Buddy chunk destroyed"
        );
    }
}
