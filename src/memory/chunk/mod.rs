/*!
 * Chunk Allocators
 * Single device-memory block sub-allocation strategies
 */

pub mod buddy;
pub mod segment;

pub use buddy::{BuddyChunk, NodeState};
pub use segment::{FreeSpan, SegmentChunk};
