//! Pageable handles and the metadata the manager keeps for them

use std::fmt;
use std::sync::{Arc, Weak};

use super::manager::Shared;
use super::types::{ExecutionSerial, MemorySegment, NativeHandle, PageableId, ResidencyState};

/// The unit of residency: one native heap or directly allocated resource
///
/// The handle is owned by the allocator that created the memory. The
/// residency manager keeps only metadata keyed by [`PageableId`] and a weak
/// link back; dropping the handle is the destruction notification, which
/// removes the pageable from its segment's usage and LRU.
pub struct Pageable {
    id: PageableId,
    segment: MemorySegment,
    size_in_bytes: u64,
    native: NativeHandle,
    owner: Weak<Shared>,
}

impl Pageable {
    pub(crate) fn new(
        id: PageableId,
        segment: MemorySegment,
        size_in_bytes: u64,
        native: NativeHandle,
        owner: Weak<Shared>,
    ) -> Self {
        Pageable {
            id,
            segment,
            size_in_bytes,
            native,
            owner,
        }
    }

    pub fn id(&self) -> PageableId {
        self.id
    }

    pub fn segment(&self) -> MemorySegment {
        self.segment
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.size_in_bytes
    }

    pub fn native(&self) -> NativeHandle {
        self.native
    }

    pub(crate) fn is_owned_by(&self, shared: &Arc<Shared>) -> bool {
        std::ptr::eq(self.owner.as_ptr(), Arc::as_ptr(shared))
    }
}

impl fmt::Debug for Pageable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pageable")
            .field("id", &self.id)
            .field("segment", &self.segment)
            .field("size_in_bytes", &self.size_in_bytes)
            .field("native", &self.native)
            .finish()
    }
}

impl Drop for Pageable {
    fn drop(&mut self) {
        if let Some(shared) = self.owner.upgrade() {
            shared.forget(self.id);
        }
    }
}

/// Residency metadata for one registered pageable
#[derive(Debug, Clone)]
pub(crate) struct PageableEntry {
    pub(crate) segment: MemorySegment,
    pub(crate) size_in_bytes: u64,
    pub(crate) native: NativeHandle,
    pub(crate) is_resident: bool,
    pub(crate) lock_count: u32,
    /// Pending serial at the last time a submission referenced the pageable
    pub(crate) last_submission: ExecutionSerial,
}

impl PageableEntry {
    pub(crate) fn new(segment: MemorySegment, size_in_bytes: u64, native: NativeHandle) -> Self {
        PageableEntry {
            segment,
            size_in_bytes,
            native,
            is_resident: false,
            lock_count: 0,
            last_submission: ExecutionSerial::NEVER,
        }
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.lock_count > 0
    }

    pub(crate) fn state(&self) -> ResidencyState {
        match (self.is_resident, self.is_locked()) {
            (false, _) => ResidencyState::NotResident,
            (true, false) => ResidencyState::ResidentEvictable,
            (true, true) => ResidencyState::ResidentLocked,
        }
    }
}
