//! Prometheus metrics for toimitus outputs
//!
//! [`OutputMetrics`] is the [`Observer`] handed to every client of an
//! output. Counters are registered on a caller-supplied registry, never the
//! process-global default one, so several outputs (and tests) can coexist.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};
use std::time::Duration;
use toimitus_core::Observer;

/// Counters and gauges of one output
#[derive(Clone)]
pub struct OutputMetrics {
    // ─────────────────────────────────────────────────────────────────────────
    // Event counters
    // ─────────────────────────────────────────────────────────────────────────
    /// Batches that started publishing
    pub batches: IntCounter,

    /// Events acknowledged by a sink
    pub events_acked: IntCounter,

    /// Events handed back after a failed attempt
    pub events_failed: IntCounter,

    /// Events dropped on purpose (encoding failures)
    pub events_dropped: IntCounter,

    // ─────────────────────────────────────────────────────────────────────────
    // Connection I/O
    // ─────────────────────────────────────────────────────────────────────────
    pub write_errors: IntCounter,
    pub read_errors: IntCounter,
    pub bytes_written: IntCounter,
    pub bytes_read: IntCounter,

    // ─────────────────────────────────────────────────────────────────────────
    // Flow control
    // ─────────────────────────────────────────────────────────────────────────
    /// Time from sending a round to its final ack
    pub publish_latency_seconds: Histogram,

    /// Most recently reported window size
    pub window_size: IntGauge,
}

/// Plain-number view of [`OutputMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub batches: u64,
    pub events_acked: u64,
    pub events_failed: u64,
    pub events_dropped: u64,
    pub write_errors: u64,
    pub read_errors: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub window_size: i64,
}

impl OutputMetrics {
    /// Create the metrics and register them on `registry`
    ///
    /// Fails if metrics with the same names are already registered there.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let c = IntCounter::with_opts(Opts::new(name, help))?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };

        let publish_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "toimitus_publish_latency_seconds",
                "Time from sending a round to its final acknowledgement",
            )
            // Buckets: 1ms to 30s
            .buckets(vec![
                0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0,
            ]),
        )?;
        registry.register(Box::new(publish_latency_seconds.clone()))?;

        let window_size = IntGauge::with_opts(Opts::new(
            "toimitus_window_size",
            "Current send window size",
        ))?;
        registry.register(Box::new(window_size.clone()))?;

        Ok(Self {
            batches: counter("toimitus_batches_total", "Batches that started publishing")?,
            events_acked: counter("toimitus_events_acked_total", "Events acknowledged")?,
            events_failed: counter(
                "toimitus_events_failed_total",
                "Events handed back after a failed attempt",
            )?,
            events_dropped: counter(
                "toimitus_events_dropped_total",
                "Events dropped because they failed to encode",
            )?,
            write_errors: counter("toimitus_write_errors_total", "Connection write failures")?,
            read_errors: counter("toimitus_read_errors_total", "Acknowledgement read failures")?,
            bytes_written: counter("toimitus_bytes_written_total", "Bytes written to sinks")?,
            bytes_read: counter("toimitus_bytes_read_total", "Bytes read from sinks")?,
            publish_latency_seconds,
            window_size,
        })
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            batches: self.batches.get(),
            events_acked: self.events_acked.get(),
            events_failed: self.events_failed.get(),
            events_dropped: self.events_dropped.get(),
            write_errors: self.write_errors.get(),
            read_errors: self.read_errors.get(),
            bytes_written: self.bytes_written.get(),
            bytes_read: self.bytes_read.get(),
            window_size: self.window_size.get(),
        }
    }
}

impl Observer for OutputMetrics {
    fn new_batch(&self, _events: usize) {
        self.batches.inc();
    }

    fn acked(&self, events: usize) {
        self.events_acked.inc_by(events as u64);
    }

    fn failed(&self, events: usize) {
        self.events_failed.inc_by(events as u64);
    }

    fn dropped(&self, events: usize) {
        self.events_dropped.inc_by(events as u64);
    }

    fn write_error(&self) {
        self.write_errors.inc();
    }

    fn read_error(&self) {
        self.read_errors.inc();
    }

    fn write_bytes(&self, bytes: usize) {
        self.bytes_written.inc_by(bytes as u64);
    }

    fn read_bytes(&self, bytes: usize) {
        self.bytes_read.inc_by(bytes as u64);
    }

    fn report_latency(&self, latency: Duration) {
        self.publish_latency_seconds.observe(latency.as_secs_f64());
    }

    fn window_size(&self, size: usize) {
        self.window_size.set(size as i64);
    }
}

/// Encode everything registered on `registry` in Prometheus text format
pub fn gather(registry: &Registry) -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_ok() {
        String::from_utf8(buffer).unwrap_or_default()
    } else {
        String::new()
    }
}
