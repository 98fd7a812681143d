/*!
 * Device Boundary
 *
 * The only place the allocator talks to the graphics driver: memory type
 * selection and raw device-memory allocation. Everything above this module
 * works with opaque `DeviceMemory` handles.
 */

pub mod simulated;
pub mod traits;
pub mod types;

pub use simulated::SimulatedDevice;
pub use traits::{find_memory_type_index, MemoryDevice};
pub use types::*;
