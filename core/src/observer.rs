//! Observer - reporting hooks called by network clients
//!
//! One observer instance is injected into every client of an output at
//! construction. Implementations must be cheap and lock-free; the hooks sit
//! on the publish path.

use std::time::Duration;

/// Reporting hooks, all defaulting to no-ops
pub trait Observer: Send + Sync {
    /// A batch of `events` started publishing
    fn new_batch(&self, _events: usize) {}

    /// `events` were acknowledged by the sink
    fn acked(&self, _events: usize) {}

    /// `events` were not delivered in this attempt and were handed back
    fn failed(&self, _events: usize) {}

    /// `events` were dropped on purpose (encoding failure)
    fn dropped(&self, _events: usize) {}

    /// Writing to the connection failed
    fn write_error(&self) {}

    /// Reading acknowledgements failed
    fn read_error(&self) {}

    /// Bytes written to the connection
    fn write_bytes(&self, _bytes: usize) {}

    /// Bytes of acknowledgements read
    fn read_bytes(&self, _bytes: usize) {}

    /// Time from sending a round to its final acknowledgement
    fn report_latency(&self, _latency: Duration) {}

    /// Current window size after adaptation
    fn window_size(&self, _size: usize) {}
}

/// Observer that ignores everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl Observer for NoopObserver {}
