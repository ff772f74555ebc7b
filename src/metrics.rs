//! Prometheus metrics for the block store
//!
//! Process-wide: every `BlockStore` in the process adds to the same series.
//! Gauges move by deltas so several stores can share them.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Once;
use tracing::{error, info};

lazy_static::lazy_static! {
    /// Global metrics registry
    pub static ref METRICS_REGISTRY: Registry = Registry::new();

    // Table metrics
    pub static ref BLOCKS_USED: IntGauge = IntGauge::new(
        "blockstore_blocks_used",
        "Blocks currently allocated"
    ).unwrap();

    pub static ref BLOCKS_CAPACITY: IntGauge = IntGauge::new(
        "blockstore_blocks_capacity",
        "Blocks tracked by block tables"
    ).unwrap();

    pub static ref ALLOCATIONS_TOTAL: IntCounter = IntCounter::new(
        "blockstore_allocations_total",
        "Total allocations"
    ).unwrap();

    pub static ref DELETIONS_TOTAL: IntCounter = IntCounter::new(
        "blockstore_deletions_total",
        "Total deletions"
    ).unwrap();

    pub static ref MIGRATIONS_TOTAL: IntCounter = IntCounter::new(
        "blockstore_migrations_total",
        "Total block migrations"
    ).unwrap();

    pub static ref DEFRAG_RUNS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("blockstore_defrag_runs_total", "Completed defragmentation passes"),
        &["kind"]
    ).unwrap();

    // Stream metrics
    pub static ref STREAM_SNAPSHOTS_TOTAL: IntCounter = IntCounter::new(
        "blockstore_stream_snapshots_total",
        "Input streams switched to a private snapshot"
    ).unwrap();

    // Buffer metrics
    pub static ref BUFFER_BYTES: IntGauge = IntGauge::new(
        "blockstore_buffer_bytes",
        "Bytes held by backing buffers"
    ).unwrap();
}

static INIT: Once = Once::new();

/// Register all metrics with the global registry (idempotent)
pub fn init_metrics() {
    INIT.call_once(|| {
        info!("Initializing Prometheus metrics");

        METRICS_REGISTRY.register(Box::new(BLOCKS_USED.clone())).ok();
        METRICS_REGISTRY.register(Box::new(BLOCKS_CAPACITY.clone())).ok();
        METRICS_REGISTRY.register(Box::new(ALLOCATIONS_TOTAL.clone())).ok();
        METRICS_REGISTRY.register(Box::new(DELETIONS_TOTAL.clone())).ok();
        METRICS_REGISTRY.register(Box::new(MIGRATIONS_TOTAL.clone())).ok();
        METRICS_REGISTRY.register(Box::new(DEFRAG_RUNS_TOTAL.clone())).ok();

        METRICS_REGISTRY.register(Box::new(STREAM_SNAPSHOTS_TOTAL.clone())).ok();

        METRICS_REGISTRY.register(Box::new(BUFFER_BYTES.clone())).ok();
    });
}

/// Apply the change in table and buffer size seen across one operation
pub fn record_usage_delta(used_blocks: i64, capacity_blocks: i64, buffer_bytes: i64) {
    if used_blocks != 0 {
        BLOCKS_USED.add(used_blocks);
    }
    if capacity_blocks != 0 {
        BLOCKS_CAPACITY.add(capacity_blocks);
    }
    if buffer_bytes != 0 {
        BUFFER_BYTES.add(buffer_bytes);
    }
}

pub fn record_defrag(kind: &str) {
    DEFRAG_RUNS_TOTAL.with_label_values(&[kind]).inc();
}

/// Export all metrics in Prometheus text format
pub fn export_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = METRICS_REGISTRY.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return String::from("# Error encoding metrics\n");
    }

    String::from_utf8(buffer).unwrap_or_else(|_| String::from("# Error converting metrics\n"))
}
