//! Prometheus-compatible residency metrics
//!
//! Counts evictions, make-resident batches and soft budget overruns, and
//! mirrors the per-segment budget and usage as gauges. Metrics are rendered
//! in Prometheus text format by [`ResidencyMetrics::encode`].

use prometheus_client::{
    encoding::text::encode, metrics::counter::Counter, metrics::gauge::Gauge,
    registry::Registry,
};

use crate::residency::MemorySegment;

/// Residency metrics registered in their own registry
#[derive(Debug)]
pub struct ResidencyMetrics {
    registry: Registry,

    /// Pageables evicted by the eviction loop
    pub evictions: Counter<u64>,

    /// Bytes evicted by the eviction loop
    pub evicted_bytes: Counter<u64>,

    /// Batched make-resident driver calls issued
    pub make_resident_calls: Counter<u64>,

    /// Pageables made resident by those calls
    pub made_resident: Counter<u64>,

    /// Eviction passes that stopped before reaching the budget
    pub overcommit_events: Counter<u64>,

    /// Make-resident calls that failed
    pub out_of_memory: Counter<u64>,

    /// Evict driver calls that failed (best-effort, not surfaced)
    pub evict_failures: Counter<u64>,

    local_budget_bytes: Gauge,
    local_usage_bytes: Gauge,
    non_local_budget_bytes: Gauge,
    non_local_usage_bytes: Gauge,
}

impl ResidencyMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("residency");

        let evictions = Counter::default();
        registry.register(
            "evictions",
            "Number of pageables evicted to stay under budget",
            evictions.clone(),
        );

        let evicted_bytes = Counter::default();
        registry.register(
            "evicted_bytes",
            "Bytes evicted to stay under budget",
            evicted_bytes.clone(),
        );

        let make_resident_calls = Counter::default();
        registry.register(
            "make_resident_calls",
            "Number of batched make-resident driver calls",
            make_resident_calls.clone(),
        );

        let made_resident = Counter::default();
        registry.register(
            "made_resident",
            "Number of pageables made resident",
            made_resident.clone(),
        );

        let overcommit_events = Counter::default();
        registry.register(
            "overcommit_events",
            "Eviction passes that ran out of candidates above budget",
            overcommit_events.clone(),
        );

        let out_of_memory = Counter::default();
        registry.register(
            "out_of_memory",
            "Make-resident calls rejected by the driver",
            out_of_memory.clone(),
        );

        let evict_failures = Counter::default();
        registry.register(
            "evict_failures",
            "Evict calls rejected by the driver",
            evict_failures.clone(),
        );

        let local_budget_bytes = Gauge::default();
        registry.register(
            "local_budget_bytes",
            "Budget of the local segment",
            local_budget_bytes.clone(),
        );

        let local_usage_bytes = Gauge::default();
        registry.register(
            "local_usage_bytes",
            "Resident bytes in the local segment",
            local_usage_bytes.clone(),
        );

        let non_local_budget_bytes = Gauge::default();
        registry.register(
            "non_local_budget_bytes",
            "Budget of the non-local segment",
            non_local_budget_bytes.clone(),
        );

        let non_local_usage_bytes = Gauge::default();
        registry.register(
            "non_local_usage_bytes",
            "Resident bytes in the non-local segment",
            non_local_usage_bytes.clone(),
        );

        ResidencyMetrics {
            registry,
            evictions,
            evicted_bytes,
            make_resident_calls,
            made_resident,
            overcommit_events,
            out_of_memory,
            evict_failures,
            local_budget_bytes,
            local_usage_bytes,
            non_local_budget_bytes,
            non_local_usage_bytes,
        }
    }

    /// Mirror a segment's budget and usage into the gauges
    pub fn record_segment(&self, segment: MemorySegment, budget: u64, usage: u64) {
        let (budget_gauge, usage_gauge) = match segment {
            MemorySegment::Local => (&self.local_budget_bytes, &self.local_usage_bytes),
            MemorySegment::NonLocal => (&self.non_local_budget_bytes, &self.non_local_usage_bytes),
        };
        budget_gauge.set(to_gauge(budget));
        usage_gauge.set(to_gauge(usage));
    }

    /// Render all metrics in Prometheus text format
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

impl Default for ResidencyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn to_gauge(bytes: u64) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}
