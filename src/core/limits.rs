/*!
 * Allocator Limits and Defaults
 *
 * Centralized location for size-class defaults and hard limits.
 */

use super::types::DeviceSize;

// =============================================================================
// SIZE CLASS DEFAULTS
// =============================================================================

/// Smallest segment handed out by the router (64KB)
/// Matches the common `bufferImageGranularity` upper bound
pub const DEFAULT_BASE_SEGMENT_SIZE: DeviceSize = 64 * 1024;

/// Each size class spans `2^shift` base sizes before the next class starts
pub const DEFAULT_RANGE_SHIFT: u32 = 2;

/// Number of geometric size classes
/// With the defaults the largest request is 64KB << 11 = 128MB
pub const DEFAULT_MAX_RANGES: u32 = 4;

/// Leaf segments per chunk (chunk bytes = class base * this)
/// [PERF] Amortizes one driver allocation over many resources
pub const DEFAULT_CHUNK_ELEMENT_COUNT: u32 = 16;

// =============================================================================
// HARD LIMITS
// =============================================================================

/// Deepest buddy tree a chunk may carry (2^23 leaves, 16MB of node bytes)
pub const MAX_BUDDY_TREE_DEPTH: u32 = 24;

/// Upper bound on the number of size classes (shift arithmetic stays in u64)
pub const MAX_SIZE_CLASSES: u32 = 16;

// =============================================================================
// ENVIRONMENT
// =============================================================================

pub const ENV_BASE_SEGMENT: &str = "RENDER_MEMORY_BASE_SEGMENT";
pub const ENV_RANGE_SHIFT: &str = "RENDER_MEMORY_RANGE_SHIFT";
pub const ENV_MAX_RANGES: &str = "RENDER_MEMORY_MAX_RANGES";
pub const ENV_CHUNK_ELEMENTS: &str = "RENDER_MEMORY_CHUNK_ELEMENTS";
pub const ENV_STRATEGY: &str = "RENDER_MEMORY_STRATEGY";
pub const ENV_TRACE_JSON: &str = "RENDER_MEMORY_TRACE_JSON";
