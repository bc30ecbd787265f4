//! HIP residency driver for managed allocations
//!
//! HIP has no explicit residency API. For managed (`hipMallocManaged`)
//! allocations the closest equivalent is prefetching: prefetching to the
//! device pages the range into VRAM, prefetching to the CPU pages it out.
//! Non-local pageables already live in system memory and need no call.

use std::ffi::c_void;

use super::ffi;
use super::{DriverError, DriverPageable, DriverResult, ResidencyDriver};
use crate::residency::MemorySegment;

/// Residency driver backed by the HIP runtime
#[derive(Debug)]
pub struct HipDriver {
    device_id: i32,
    non_local_budget: u64,
}

impl HipDriver {
    /// Initialise HIP and bind `device_id`
    ///
    /// `non_local_budget` is the system-memory budget reported for the
    /// non-local segment; HIP does not expose one.
    pub fn new(device_id: i32, non_local_budget: u64) -> DriverResult<Self> {
        let result = unsafe { ffi::hipInit(0) };
        if result != ffi::HIP_SUCCESS {
            return Err(DriverError::InitializationFailed(format!(
                "hipInit failed with code {}",
                result
            )));
        }

        let mut count: i32 = 0;
        let result = unsafe { ffi::hipGetDeviceCount(&mut count) };
        if result != ffi::HIP_SUCCESS || device_id < 0 || device_id >= count {
            return Err(DriverError::DeviceNotFound);
        }

        let result = unsafe { ffi::hipSetDevice(device_id) };
        if result != ffi::HIP_SUCCESS {
            return Err(DriverError::InitializationFailed(format!(
                "hipSetDevice({}) failed with code {}",
                device_id, result
            )));
        }

        tracing::info!(device_id, non_local_budget, "HIP residency driver initialised");
        Ok(HipDriver {
            device_id,
            non_local_budget,
        })
    }

    fn prefetch(&self, pageables: &[DriverPageable], target: i32) -> Result<(), String> {
        for pageable in pageables
            .iter()
            .filter(|p| p.segment == MemorySegment::Local)
        {
            let size = usize::try_from(pageable.size_in_bytes)
                .map_err(|_| format!("{} bytes exceeds the address space", pageable.size_in_bytes))?;
            let result = unsafe {
                ffi::hipMemPrefetchAsync(
                    pageable.handle.raw() as *const c_void,
                    size,
                    target,
                    std::ptr::null_mut(),
                )
            };
            if result != ffi::HIP_SUCCESS {
                return Err(format!(
                    "hipMemPrefetchAsync(0x{:x}, {}, {}) failed with code {}",
                    pageable.handle.raw(),
                    size,
                    target,
                    result
                ));
            }
        }
        Ok(())
    }
}

impl ResidencyDriver for HipDriver {
    fn query_segment_budget(&self, segment: MemorySegment) -> DriverResult<u64> {
        match segment {
            MemorySegment::Local => {
                let mut free: usize = 0;
                let mut total: usize = 0;
                let result = unsafe { ffi::hipMemGetInfo(&mut free, &mut total) };
                if result != ffi::HIP_SUCCESS {
                    return Err(DriverError::BudgetQueryFailed(format!(
                        "hipMemGetInfo failed with code {}",
                        result
                    )));
                }
                Ok(total as u64)
            }
            MemorySegment::NonLocal => Ok(self.non_local_budget),
        }
    }

    fn make_resident(&self, pageables: &[DriverPageable]) -> DriverResult<()> {
        self.prefetch(pageables, self.device_id)
            .map_err(DriverError::MakeResidentFailed)
    }

    fn evict(&self, pageables: &[DriverPageable]) -> DriverResult<()> {
        self.prefetch(pageables, ffi::HIP_CPU_DEVICE_ID)
            .map_err(DriverError::EvictFailed)
    }
}
