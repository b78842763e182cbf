//! Prometheus metrics for KASA

use crate::error::{KasaError, Result};
use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder, register_counter_vec,
    register_gauge, register_gauge_vec, register_histogram_vec,
};
use std::sync::OnceLock;

/// Global metrics instance
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// All KASA metrics
pub struct Metrics {
    /// Records admitted (by table)
    pub records_received: CounterVec,

    /// Records refused (by reason)
    pub records_rejected: CounterVec,

    /// Flush attempts (by table, trigger, outcome)
    pub flushes: CounterVec,

    /// Rows committed to the datastore (by table)
    pub rows_written: CounterVec,

    /// Flush duration (by trigger)
    pub flush_latency: HistogramVec,

    /// Values buffered per table; the series is removed once the table drains
    pub buffered_values: GaugeVec,

    /// Deferred flushes currently armed
    pub timers_armed: Gauge,
}

impl Metrics {
    /// Initialize metrics (call once at startup)
    ///
    /// Returns error if metric registration fails.
    pub fn init() -> Result<&'static Metrics> {
        if let Some(metrics) = METRICS.get() {
            return Ok(metrics);
        }

        let metrics = Metrics {
            records_received: register_counter_vec!(
                "kasa_records_received_total",
                "Total records admitted into table buffers",
                &["table"]
            )
            .map_err(|e| KasaError::Metrics(format!("records_received: {e}")))?,

            records_rejected: register_counter_vec!(
                "kasa_records_rejected_total",
                "Total records refused",
                &["reason"]
            )
            .map_err(|e| KasaError::Metrics(format!("records_rejected: {e}")))?,

            flushes: register_counter_vec!(
                "kasa_flushes_total",
                "Total flush attempts",
                &["table", "trigger", "outcome"]
            )
            .map_err(|e| KasaError::Metrics(format!("flushes: {e}")))?,

            rows_written: register_counter_vec!(
                "kasa_rows_written_total",
                "Total rows committed to the datastore",
                &["table"]
            )
            .map_err(|e| KasaError::Metrics(format!("rows_written: {e}")))?,

            flush_latency: register_histogram_vec!(
                "kasa_flush_latency_seconds",
                "Flush duration including the bulk insert",
                &["trigger"],
                vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]
            )
            .map_err(|e| KasaError::Metrics(format!("flush_latency: {e}")))?,

            buffered_values: register_gauge_vec!(
                "kasa_buffered_values",
                "Values currently buffered per table",
                &["table"]
            )
            .map_err(|e| KasaError::Metrics(format!("buffered_values: {e}")))?,

            timers_armed: register_gauge!(
                "kasa_timers_armed",
                "Deferred flushes currently armed"
            )
            .map_err(|e| KasaError::Metrics(format!("timers_armed: {e}")))?,
        };

        // Set the metrics (only succeeds once)
        let _ = METRICS.set(metrics);

        METRICS
            .get()
            .ok_or_else(|| KasaError::Metrics("Failed to initialize metrics".to_string()))
    }

    /// Get the global metrics instance
    ///
    /// Returns None if metrics haven't been initialized yet.
    pub fn get() -> Option<&'static Metrics> {
        METRICS.get()
    }

    /// Record one admitted record
    pub fn record_received(&self, table: &str) {
        self.records_received.with_label_values(&[table]).inc();
    }

    /// Record one refused record
    pub fn record_rejected(&self, reason: &str) {
        self.records_rejected.with_label_values(&[reason]).inc();
    }

    /// Record a finished flush attempt
    pub fn record_flush(&self, table: &str, trigger: &str, outcome: &str, rows: u64, seconds: f64) {
        self.flushes
            .with_label_values(&[table, trigger, outcome])
            .inc();
        if rows > 0 {
            self.rows_written
                .with_label_values(&[table])
                .inc_by(rows as f64);
        }
        self.flush_latency
            .with_label_values(&[trigger])
            .observe(seconds);
    }

    /// Update a table's buffered value count
    pub fn set_buffered(&self, table: &str, values: usize) {
        self.buffered_values
            .with_label_values(&[table])
            .set(values as f64);
    }

    /// Drop the per-table gauge of a drained table
    pub fn forget_table(&self, table: &str) {
        // Absent when the table never reported a size
        let _ = self.buffered_values.remove_label_values(&[table]);
    }

    /// Update armed timer count
    pub fn set_timers_armed(&self, count: usize) {
        self.timers_armed.set(count as f64);
    }
}

/// Gather all metrics and encode as Prometheus text format
///
/// Returns the metrics as a String, ready to be served via HTTP.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_ok() {
        String::from_utf8(buffer).unwrap_or_default()
    } else {
        String::new()
    }
}

/// Helper to record metrics if initialized, otherwise skip
pub fn try_record_received(table: &str) {
    if let Some(m) = Metrics::get() {
        m.record_received(table);
    }
}

/// Helper to record metrics if initialized, otherwise skip
pub fn try_record_rejected(reason: &str) {
    if let Some(m) = Metrics::get() {
        m.record_rejected(reason);
    }
}

/// Helper to record metrics if initialized, otherwise skip
pub fn try_record_flush(table: &str, trigger: &str, outcome: &str, rows: u64, seconds: f64) {
    if let Some(m) = Metrics::get() {
        m.record_flush(table, trigger, outcome, rows, seconds);
    }
}

/// Helper to record metrics if initialized, otherwise skip
pub fn try_set_buffered(table: &str, values: usize) {
    if let Some(m) = Metrics::get() {
        m.set_buffered(table, values);
    }
}

/// Helper to record metrics if initialized, otherwise skip
pub fn try_forget_table(table: &str) {
    if let Some(m) = Metrics::get() {
        m.forget_table(table);
    }
}

/// Helper to record metrics if initialized, otherwise skip
pub fn try_set_timers_armed(count: usize) {
    if let Some(m) = Metrics::get() {
        m.set_timers_armed(count);
    }
}
