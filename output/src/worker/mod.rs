//! Batching worker - groups producer events into batches
//!
//! Producers push [`Message`]s through an [`EventSender`] into a bounded
//! queue. The [`BatchingWorker`] collects them into batches of at most
//! `bulk_max_size` events and publishes each batch downstream, either when
//! it fills up or when the flush timer fires.
//!
//! ```text
//! EventSender ──► queue (queue_hwm) ──► BatchingWorker ──► mpsc<Batch> ──► client workers
//! ```
//!
//! # Example
//!
//! ```ignore
//! let (batches_tx, batches_rx) = mpsc::channel(1);
//! let (sender, worker) = Batcher::new()
//!     .bulk_max_size(2048)
//!     .flush_interval(Duration::from_secs(1))
//!     .build(batches_tx);
//! tokio::spawn(worker.run(shutdown_rx));
//! sender.publish_confirmed(event).await?;
//! ```

mod runner;

pub use runner::BatchingWorker;

use crate::error::PublishError;
use std::time::Duration;
use tokio::sync::mpsc;
use toimitus_core::{Batch, Event, Message, SignalError, Signaler};

/// Default input queue capacity
pub const DEFAULT_QUEUE_HWM: usize = 4096;

/// Default maximum events per batch
pub const DEFAULT_BULK_MAX_SIZE: usize = 2048;

/// Default flush interval
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Builder for a batching worker and its producer handle
#[derive(Debug, Clone)]
pub struct Batcher {
    queue_hwm: usize,
    bulk_max_size: usize,
    flush_interval: Duration,
}

impl Batcher {
    pub fn new() -> Self {
        Self {
            queue_hwm: DEFAULT_QUEUE_HWM,
            bulk_max_size: DEFAULT_BULK_MAX_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }

    /// Input queue capacity; producers wait once it is full
    pub fn queue_hwm(mut self, capacity: usize) -> Self {
        self.queue_hwm = capacity.max(1);
        self
    }

    /// Maximum events per published batch
    pub fn bulk_max_size(mut self, size: usize) -> Self {
        self.bulk_max_size = size.max(1);
        self
    }

    /// Upper bound on how long an event waits in a partial batch
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Create the producer handle and the worker publishing into `out`
    pub fn build(self, out: mpsc::Sender<Batch>) -> (EventSender, BatchingWorker) {
        let (tx, rx) = mpsc::channel(self.queue_hwm);
        let worker = BatchingWorker {
            rx,
            out,
            bulk_max_size: self.bulk_max_size,
            flush_interval: self.flush_interval,
            events: Vec::with_capacity(self.bulk_max_size),
            signals: Vec::new(),
        };
        (EventSender { tx }, worker)
    }
}

impl Default for Batcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Producer handle of a batching worker
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Message>,
}

impl EventSender {
    /// Queue a message, waiting while the queue is full
    pub async fn send(&self, msg: Message) -> Result<(), PublishError> {
        self.tx.send(msg).await.map_err(|e| {
            e.0.fail(SignalError::new("output closed"));
            PublishError::Closed
        })
    }

    /// Queue a message without waiting
    ///
    /// A rejected message has its signaler failed, like [`send`](Self::send).
    pub fn try_send(&self, msg: Message) -> Result<(), PublishError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(msg) => {
                msg.fail(SignalError::new("output queue full"));
                PublishError::Full
            }
            mpsc::error::TrySendError::Closed(msg) => {
                msg.fail(SignalError::new("output closed"));
                PublishError::Closed
            }
        })
    }

    /// Fire-and-forget single event
    pub async fn publish(&self, event: Event) -> Result<(), PublishError> {
        self.send(Message::single(event)).await
    }

    /// Fire-and-forget single event, failing instead of waiting when full
    pub fn try_publish(&self, event: Event) -> Result<(), PublishError> {
        self.try_send(Message::single(event))
    }

    /// Fire-and-forget slice of events
    pub async fn publish_bulk(&self, events: Vec<Event>) -> Result<(), PublishError> {
        self.send(Message::bulk(events)).await
    }

    /// Publish one event and wait until it is acknowledged or given up on
    pub async fn publish_confirmed(&self, event: Event) -> Result<(), PublishError> {
        self.confirmed(Message::single(event)).await
    }

    /// Publish a slice and wait until every event is acknowledged or given up on
    pub async fn publish_bulk_confirmed(&self, events: Vec<Event>) -> Result<(), PublishError> {
        self.confirmed(Message::bulk(events)).await
    }

    async fn confirmed(&self, msg: Message) -> Result<(), PublishError> {
        let (signal, waiter) = Signaler::single();
        self.send(msg.with_signal(signal)).await?;
        waiter.wait().await.map_err(PublishError::from)
    }

    /// Whether the worker has stopped accepting messages
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
