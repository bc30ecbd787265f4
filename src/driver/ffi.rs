//! HIP FFI bindings used by the HIP residency driver
//!
//! Only the memory-info and prefetch entry points are bound; everything else
//! in the HIP runtime is owned by the allocator layer.

use std::ffi::c_void;

#[link(name = "amdhip64")]
extern "C" {
    pub fn hipInit(flags: u32) -> i32;
    pub fn hipGetDeviceCount(count: *mut i32) -> i32;
    pub fn hipSetDevice(device_id: i32) -> i32;
    pub fn hipMemGetInfo(free: *mut usize, total: *mut usize) -> i32;
    pub fn hipMemPrefetchAsync(
        dev_ptr: *const c_void,
        count: usize,
        device: i32,
        stream: *mut c_void,
    ) -> i32;
}

/// HIP success code
pub const HIP_SUCCESS: i32 = 0;

/// Pseudo device id addressing host memory in prefetch calls
pub const HIP_CPU_DEVICE_ID: i32 = -1;
