//! Metrics definitions for the indexer.
//!
//! This module defines all metrics used throughout the pipeline.
//! Metrics are collected using the `metrics` crate and can be exported
//! to Prometheus via `metrics-exporter-prometheus`.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use std::time::Instant;

/// Initialize all metric descriptions.
/// Call this once at startup before any metrics are recorded.
pub fn init_metrics() {
    describe_counter!(
        "blocks_committed_total",
        "Total number of blocks committed to the store"
    );
    describe_histogram!(
        "block_processing_duration_seconds",
        "Time taken to normalize and commit a block in seconds"
    );
    describe_counter!(
        "reorgs_detected_total",
        "Total number of chain reorganizations detected"
    );
    describe_counter!(
        "blocks_orphaned_total",
        "Total number of stored blocks marked as ommers by a reorg"
    );
    describe_counter!(
        "block_retries_total",
        "Total number of block import attempts that failed and were retried"
    );
    describe_counter!(
        "node_retries_total",
        "Total number of transient node call failures that were retried"
    );
    describe_counter!(
        "capability_cache_hits_total",
        "Capability detections answered from the bytecode cache"
    );
    describe_counter!(
        "capability_cache_misses_total",
        "Capability detections that scanned bytecode"
    );
    describe_counter!(
        "ingestion_halts_total",
        "Number of times ingestion halted on a fatal condition"
    );
}

/// Record a committed block.
pub fn record_block_committed() {
    counter!("blocks_committed_total").increment(1);
}

/// Record block processing duration.
pub fn record_block_processing_duration(duration_secs: f64) {
    histogram!("block_processing_duration_seconds").record(duration_secs);
}

/// Record a chain reorganization.
///
/// # Arguments
/// * `depth` - Number of stored blocks replaced by the new branch
pub fn record_reorg_detected(depth: u64) {
    counter!("reorgs_detected_total").increment(1);
    counter!("blocks_orphaned_total").increment(depth);
}

/// Record a failed block attempt that will be retried.
pub fn record_block_retry() {
    counter!("block_retries_total").increment(1);
}

/// Record a retried node call.
///
/// # Arguments
/// * `operation` - Port operation name (e.g. "get_trace")
pub fn record_node_retry(operation: &'static str) {
    counter!("node_retries_total", "operation" => operation).increment(1);
}

/// Record a capability cache lookup.
pub fn record_capability_cache(hit: bool) {
    if hit {
        counter!("capability_cache_hits_total").increment(1);
    } else {
        counter!("capability_cache_misses_total").increment(1);
    }
}

/// Record an ingestion halt.
pub fn record_ingestion_halted() {
    counter!("ingestion_halts_total").increment(1);
}

/// A timer that automatically records duration when dropped.
pub struct ProcessingTimer {
    start: Instant,
}

impl ProcessingTimer {
    /// Start a new processing timer.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for ProcessingTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProcessingTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        record_block_processing_duration(duration);
    }
}
