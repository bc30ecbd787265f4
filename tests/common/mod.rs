//! Shared fixtures for residency integration tests
//!
//! Every fixture runs the manager against a [`FakeDriver`], so tests are
//! deterministic and need no GPU. Byte sizes use decimal megabytes to keep
//! budget arithmetic readable.
//!
//! # Usage
//!
//! ```ignore
//! mod common;
//! use common::{ResidencyFixture, MB};
//!
//! let fixture = ResidencyFixture::with_budget(100 * MB);
//! let heap = fixture.allocate(MemorySegment::Local, MB);
//! assert!(fixture.is_resident(&heap));
//! fixture.assert_invariants();
//! ```

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use residencyforge::driver::FakeDriver;
use residencyforge::residency::{
    MemorySegment, NativeHandle, Pageable, ResidencyConfig, ResidencyManager,
};
pub use serial_test::serial;

pub const MB: u64 = 1_000_000;

/// OS budget reported by the fake driver when a test restricts the budget
pub const FAKE_OS_BUDGET: u64 = 10_000 * MB;

/// Installs the log subscriber once per test binary
static LOGGING: Lazy<()> = Lazy::new(residencyforge::logging::init_logging_default);

pub fn init_logging() {
    Lazy::force(&LOGGING);
}

pub struct ResidencyFixture {
    pub manager: ResidencyManager,
    pub driver: Arc<FakeDriver>,
    next_handle: AtomicU64,
}

impl ResidencyFixture {
    /// Manager whose segment budgets are restricted to `budget` bytes
    pub fn with_budget(budget: u64) -> Self {
        Self::with_config(
            FAKE_OS_BUDGET,
            FAKE_OS_BUDGET,
            ResidencyConfig::default().with_restricted_budget(budget),
        )
    }

    pub fn with_config(local_budget: u64, non_local_budget: u64, config: ResidencyConfig) -> Self {
        init_logging();
        let driver = Arc::new(FakeDriver::new(local_budget, non_local_budget));
        let manager = ResidencyManager::new(driver.clone(), config)
            .expect("fake driver manager should construct");
        ResidencyFixture {
            manager,
            driver,
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn next_handle(&self) -> NativeHandle {
        NativeHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a pageable without making it resident
    pub fn register(&self, segment: MemorySegment, size: u64) -> Pageable {
        self.manager
            .register_pageable(segment, size, self.next_handle())
            .expect("register_pageable")
    }

    /// Allocate the way a heap allocator does: make room, create, track
    pub fn allocate(&self, segment: MemorySegment, size: u64) -> Pageable {
        self.manager
            .ensure_can_allocate(size, segment)
            .expect("ensure_can_allocate");
        let pageable = self.register(segment, size);
        self.manager
            .track_resident_allocation(&pageable)
            .expect("track_resident_allocation");
        pageable
    }

    pub fn allocate_many(&self, count: usize, size: u64) -> Vec<Pageable> {
        (0..count)
            .map(|_| self.allocate(MemorySegment::Local, size))
            .collect()
    }

    pub fn is_resident(&self, pageable: &Pageable) -> bool {
        self.manager
            .pageable_info(pageable)
            .expect("pageable_info")
            .is_resident()
    }

    pub fn usage(&self, segment: MemorySegment) -> u64 {
        self.manager.segment_stats(segment).expect("segment_stats").usage
    }

    pub fn budget(&self, segment: MemorySegment) -> u64 {
        self.manager.segment_stats(segment).expect("segment_stats").budget
    }

    /// Advance to the next execution serial
    pub fn submit(&self) {
        self.manager
            .advance_pending_serial()
            .expect("advance_pending_serial");
    }

    pub fn assert_invariants(&self) {
        if let Err(e) = self.manager.verify_invariants() {
            panic!("residency invariant violated: {}", e);
        }
    }
}
