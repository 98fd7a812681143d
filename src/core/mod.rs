/*!
 * Core Module
 * Fundamental sizes, identifiers and limits shared by every allocator layer
 */

pub mod limits;
pub mod types;

// Re-export for convenience
pub use types::*;
