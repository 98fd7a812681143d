/*!
 * Memory Module
 * Device-memory sub-allocation: chunk strategies and the allocation router
 */

pub mod chunk;
pub mod config;
pub mod router;
pub mod traits;
pub mod types;

// Re-export for convenience
pub use chunk::{BuddyChunk, FreeSpan, NodeState, SegmentChunk};
pub use config::RouterConfig;
pub use router::{AllocationGuard, AllocationRouter, SizeClasses};
pub use traits::*;
pub use types::*;
