//! Prometheus metrics for monitoring disco.
//!
//! Covers the login aggregation pipeline (counters, write-back, cleanup),
//! the ranking and filter caches, and the metadata collaborator.

use prometheus::{Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::Arc;
use tracing::error;

/// All metrics for the disco service
pub struct Metrics {
    pub registry: Registry,

    // Login aggregation
    pub logins_total: IntCounterVec,
    pub aggregator_evictions_total: IntCounterVec,
    pub aggregator_entries: Gauge,

    // Write-back
    pub writeback_batches_total: IntCounterVec,
    pub writeback_rows_total: IntCounter,
    pub writeback_dropped_total: IntCounter,
    pub writeback_batch_size: Histogram,

    // Store
    pub store_retries_total: IntCounterVec,

    // Cleanup
    pub cleanup_runs_total: IntCounterVec,
    pub cleanup_rows_deleted_total: IntCounter,

    // Ranking cache
    pub ranking_lookups_total: IntCounterVec,

    // Filter cache
    pub filter_refreshes_total: IntCounterVec,
    pub filter_stale_served_total: IntCounter,

    // Metadata
    pub metadata_idps: Gauge,
    pub metadata_refreshes_total: IntCounterVec,
}

impl Metrics {
    /// Create a new metrics registry with all metrics
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let logins_total = IntCounterVec::new(
            Opts::new("disco_logins_total", "Login events by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(logins_total.clone()))?;

        let aggregator_evictions_total = IntCounterVec::new(
            Opts::new(
                "disco_aggregator_evictions_total",
                "Counters handed to write-back, by eviction cause",
            ),
            &["cause"],
        )?;
        registry.register(Box::new(aggregator_evictions_total.clone()))?;

        let aggregator_entries = Gauge::with_opts(Opts::new(
            "disco_aggregator_entries",
            "Distinct (network, IdP) counters currently aggregating",
        ))?;
        registry.register(Box::new(aggregator_entries.clone()))?;

        let writeback_batches_total = IntCounterVec::new(
            Opts::new("disco_writeback_batches_total", "Write-back batches by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(writeback_batches_total.clone()))?;

        let writeback_rows_total = IntCounter::with_opts(Opts::new(
            "disco_writeback_rows_total",
            "Rows written to the login statistics store",
        ))?;
        registry.register(Box::new(writeback_rows_total.clone()))?;

        let writeback_dropped_total = IntCounter::with_opts(Opts::new(
            "disco_writeback_dropped_total",
            "Counts dropped because the write-back queue was closed",
        ))?;
        registry.register(Box::new(writeback_dropped_total.clone()))?;

        let writeback_batch_size = Histogram::with_opts(
            HistogramOpts::new("disco_writeback_batch_size", "Counters per write-back batch")
                .buckets(vec![1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0]),
        )?;
        registry.register(Box::new(writeback_batch_size.clone()))?;

        let store_retries_total = IntCounterVec::new(
            Opts::new(
                "disco_store_retries_total",
                "Store operations retried on a fresh connection",
            ),
            &["db"],
        )?;
        registry.register(Box::new(store_retries_total.clone()))?;

        let cleanup_runs_total = IntCounterVec::new(
            Opts::new("disco_cleanup_runs_total", "Retention cleanup runs by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(cleanup_runs_total.clone()))?;

        let cleanup_rows_deleted_total = IntCounter::with_opts(Opts::new(
            "disco_cleanup_rows_deleted_total",
            "Rows removed by retention cleanup",
        ))?;
        registry.register(Box::new(cleanup_rows_deleted_total.clone()))?;

        let ranking_lookups_total = IntCounterVec::new(
            Opts::new("disco_ranking_lookups_total", "Ranking lookups by scope and outcome"),
            &["scope", "outcome"],
        )?;
        registry.register(Box::new(ranking_lookups_total.clone()))?;

        let filter_refreshes_total = IntCounterVec::new(
            Opts::new("disco_filter_refreshes_total", "Filter list refreshes by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(filter_refreshes_total.clone()))?;

        let filter_stale_served_total = IntCounter::with_opts(Opts::new(
            "disco_filter_stale_served_total",
            "Filter lookups answered before their refresh finished",
        ))?;
        registry.register(Box::new(filter_stale_served_total.clone()))?;

        let metadata_idps = Gauge::with_opts(Opts::new(
            "disco_metadata_idps",
            "Number of IdPs known from the discovery feed",
        ))?;
        registry.register(Box::new(metadata_idps.clone()))?;

        let metadata_refreshes_total = IntCounterVec::new(
            Opts::new("disco_metadata_refreshes_total", "Discovery feed refreshes by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(metadata_refreshes_total.clone()))?;

        Ok(Self {
            registry,
            logins_total,
            aggregator_evictions_total,
            aggregator_entries,
            writeback_batches_total,
            writeback_rows_total,
            writeback_dropped_total,
            writeback_batch_size,
            store_retries_total,
            cleanup_runs_total,
            cleanup_rows_deleted_total,
            ranking_lookups_total,
            filter_refreshes_total,
            filter_stale_served_total,
            metadata_idps,
            metadata_refreshes_total,
        })
    }

    /// Record the outcome of a persisted write-back batch
    pub fn record_batch(&self, outcome: &str, size: usize, rows: usize) {
        self.writeback_batches_total
            .with_label_values(&[outcome])
            .inc();
        self.writeback_batch_size.observe(size as f64);
        self.writeback_rows_total.inc_by(rows as u64);
    }

    /// Render metrics in Prometheus text format
    pub fn render(&self) -> String {
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();

        match encoder.encode_to_string(&metric_families) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "Failed to encode metrics");
                String::new()
            }
        }
    }
}

/// Shared metrics instance
pub type SharedMetrics = Arc<Metrics>;

/// Create a shared metrics instance
pub fn create_metrics() -> SharedMetrics {
    Arc::new(Metrics::new().expect("Failed to create metrics"))
}
