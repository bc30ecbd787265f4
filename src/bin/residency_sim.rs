use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use residencyforge::driver::FakeDriver;
use residencyforge::logging::init_logging_default;
use residencyforge::residency::{
    MemorySegment, NativeHandle, Pageable, ResidencyConfig, ResidencyManager, ResidencyStats,
};
use serde::Serialize;

const MB: u64 = 1_000_000;

#[derive(Parser, Debug)]
#[command(name = "residency-sim", version)]
#[command(
    about = "Replay an allocate/evict/touch workload against the residency manager",
    long_about = None
)]
struct Cli {
    /// Residency budget of each segment, in MB
    #[arg(long, default_value_t = 100)]
    budget_mb: u64,

    /// Number of small heaps allocated first
    #[arg(long, default_value_t = 10)]
    small_count: usize,

    /// Size of each small heap, in MB
    #[arg(long, default_value_t = 1)]
    small_mb: u64,

    /// Number of large heaps allocated after the small ones
    #[arg(long, default_value_t = 20)]
    large_count: usize,

    /// Size of each large heap, in MB
    #[arg(long, default_value_t = 5)]
    large_mb: u64,

    /// Index of the small heap touched after the large allocations
    #[arg(long, default_value_t = 5)]
    touch: usize,

    /// Print phase reports as JSON lines
    #[arg(long)]
    json: bool,

    /// Print Prometheus metrics at the end
    #[arg(long)]
    metrics: bool,
}

#[derive(Debug, Serialize)]
struct PhaseReport {
    phase: &'static str,
    small_resident: Vec<usize>,
    large_resident: usize,
    large_evicted: Vec<usize>,
    stats: ResidencyStats,
}

struct Workload {
    manager: ResidencyManager,
    small: Vec<Pageable>,
    large: Vec<Pageable>,
    next_handle: u64,
}

impl Workload {
    fn allocate(&mut self, count: usize, size: u64) -> anyhow::Result<Vec<Pageable>> {
        let mut heaps = Vec::with_capacity(count);
        for _ in 0..count {
            self.manager.ensure_can_allocate(size, MemorySegment::Local)?;
            let heap = self.manager.register_pageable(
                MemorySegment::Local,
                size,
                NativeHandle::new(self.next_handle),
            )?;
            self.next_handle += 1;
            self.manager.track_resident_allocation(&heap)?;
            heaps.push(heap);
        }
        Ok(heaps)
    }

    fn resident_indices(&self, heaps: &[Pageable]) -> anyhow::Result<Vec<usize>> {
        let mut indices = Vec::new();
        for (i, heap) in heaps.iter().enumerate() {
            if self.manager.pageable_info(heap)?.is_resident() {
                indices.push(i);
            }
        }
        Ok(indices)
    }

    fn report(&self, phase: &'static str) -> anyhow::Result<PhaseReport> {
        let large_resident = self.resident_indices(&self.large)?;
        let large_evicted = (0..self.large.len())
            .filter(|i| !large_resident.contains(i))
            .collect();
        Ok(PhaseReport {
            phase,
            small_resident: self.resident_indices(&self.small)?,
            large_resident: large_resident.len(),
            large_evicted,
            stats: self.manager.stats()?,
        })
    }
}

fn print_report(report: &PhaseReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(report)?);
        return Ok(());
    }

    println!("== {} ==", report.phase);
    println!("  small resident: {:?}", report.small_resident);
    println!(
        "  large resident: {} (evicted: {:?})",
        report.large_resident, report.large_evicted
    );
    for segment in &report.stats.segments {
        println!(
            "  {} segment: usage {} / budget {} bytes, {} evictable, {} locked",
            segment.segment,
            segment.usage,
            segment.budget,
            segment.evictable_count,
            segment.locked_count
        );
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    init_logging_default();
    let cli = Cli::parse();

    if cli.touch >= cli.small_count {
        bail!(
            "--touch {} is out of range for {} small heaps",
            cli.touch,
            cli.small_count
        );
    }

    let budget = cli.budget_mb * MB;
    let driver = Arc::new(FakeDriver::new(budget * 100, budget * 100));
    driver.set_call_recording(false);
    let config = ResidencyConfig::from_env()
        .context("invalid residency configuration in environment")?
        .with_restricted_budget(budget);
    let manager = ResidencyManager::new(driver, config)?;

    let mut workload = Workload {
        manager: manager.clone(),
        small: Vec::new(),
        large: Vec::new(),
        next_handle: 1,
    };

    workload.small = workload.allocate(cli.small_count, cli.small_mb * MB)?;
    print_report(&workload.report("small heaps allocated")?, cli.json)?;

    workload.large = workload.allocate(cli.large_count, cli.large_mb * MB)?;
    print_report(&workload.report("large heaps allocated")?, cli.json)?;

    manager.advance_pending_serial()?;
    manager.ensure_heaps_are_resident([&workload.small[cli.touch]])?;
    print_report(&workload.report("small heap touched")?, cli.json)?;

    manager.advance_pending_serial()?;
    manager.ensure_heaps_are_resident(&workload.large)?;
    print_report(&workload.report("large heaps touched")?, cli.json)?;

    manager
        .verify_invariants()
        .context("residency invariants violated")?;

    if cli.metrics {
        print!("{}", manager.metrics().encode()?);
    }

    Ok(())
}
