/*!
 * Allocation Guard
 *
 * RAII wrapper that returns its record to the router on drop
 */

use super::AllocationRouter;
use crate::core::types::{DeviceSize, MemoryTypeMask};
use crate::device::{DeviceMemory, MemoryPropertyFlags};
use crate::memory::types::{AllocationRecord, MemoryResult};
use std::sync::Arc;
use tracing::error;

/// Scoped device-memory allocation
///
/// # Example
///
/// ```rust
/// use render_memory::device::{MemoryPropertyFlags, SimulatedDevice};
/// use render_memory::memory::AllocationRouter;
/// use std::sync::Arc;
///
/// let device = Arc::new(SimulatedDevice::discrete(1 << 30, 1 << 28));
/// let router = Arc::new(AllocationRouter::new(device)?);
/// let guard = router.request_guarded(4096, !0, MemoryPropertyFlags::DEVICE_LOCAL)?;
/// let (memory, offset) = (guard.memory(), guard.offset());
/// // Returned to the router on drop
/// # let _ = (memory, offset);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct AllocationGuard {
    router: Arc<AllocationRouter>,
    record: AllocationRecord,
    active: bool,
}

impl AllocationGuard {
    pub fn record(&self) -> &AllocationRecord {
        &self.record
    }

    pub fn offset(&self) -> DeviceSize {
        self.record.offset()
    }

    pub fn size(&self) -> DeviceSize {
        self.record.size()
    }

    pub fn memory(&self) -> DeviceMemory {
        self.record.memory()
    }

    /// Return the memory now and surface any error
    pub fn release_early(mut self) -> MemoryResult<()> {
        self.active = false;
        self.router.return_memory(self.record)
    }

    /// Detach the record; the caller becomes responsible for returning it
    pub fn into_record(mut self) -> AllocationRecord {
        self.active = false;
        self.record
    }
}

impl Drop for AllocationGuard {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Err(e) = self.router.return_memory(self.record) {
            error!(
                region_key = self.record.region_key,
                chunk_index = self.record.chunk_index,
                offset = self.record.offset(),
                error = %e,
                "Allocation guard drop failed"
            );
        }
    }
}

impl std::fmt::Debug for AllocationGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationGuard")
            .field("record", &self.record)
            .field("active", &self.active)
            .finish()
    }
}

impl AllocationRouter {
    /// `request_memory` wrapped in a guard that returns it on drop
    pub fn request_guarded(
        self: &Arc<Self>,
        size_bytes: DeviceSize,
        type_mask: MemoryTypeMask,
        flags: MemoryPropertyFlags,
    ) -> MemoryResult<AllocationGuard> {
        let record = self.request_memory(size_bytes, type_mask, flags)?;
        Ok(AllocationGuard {
            router: Arc::clone(self),
            record,
            active: true,
        })
    }
}
