//! Batching worker loop

use std::mem;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use toimitus_core::{Batch, Event, Message, Payload, SignalError, SignalExt, Signaler};
use tracing::{debug, info, warn};

/// Groups queued messages into batches and publishes them downstream
#[derive(Debug)]
pub struct BatchingWorker {
    pub(crate) rx: mpsc::Receiver<Message>,
    pub(crate) out: mpsc::Sender<Batch>,
    pub(crate) bulk_max_size: usize,
    pub(crate) flush_interval: Duration,
    /// Events of the batch being filled
    pub(crate) events: Vec<Event>,
    /// Signalers of every message that contributed to `events`
    pub(crate) signals: Vec<Signaler>,
}

impl BatchingWorker {
    /// Run until `shutdown` turns true or every [`EventSender`](super::EventSender) is gone
    ///
    /// On shutdown the partial batch is offered downstream once more and every
    /// message still queued is failed. When the senders are dropped instead,
    /// the queue is drained normally first.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            bulk_max_size = self.bulk_max_size,
            flush_interval_ms = self.flush_interval.as_millis() as u64,
            "Batching worker started"
        );

        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = crate::raised(&mut shutdown) => break,

                msg = self.rx.recv() => match msg {
                    Some(msg) => self.handle(msg).await,
                    None => {
                        debug!("all senders dropped");
                        if !self.events.is_empty() {
                            self.flush().await;
                        }
                        info!("Batching worker stopped");
                        return;
                    }
                },

                _ = ticker.tick() => {
                    if !self.events.is_empty() {
                        self.flush().await;
                    }
                }
            }
        }

        self.shutdown();
    }

    async fn handle(&mut self, msg: Message) {
        let Message { payload, context } = msg;
        match payload {
            Payload::Single(event) => {
                self.events.push(event);
                if let Some(signal) = context.signal {
                    self.signals.push(signal);
                }
                if self.events.len() >= self.bulk_max_size {
                    self.flush().await;
                }
            }
            Payload::Bulk(events) if events.is_empty() => context.signal.completed(),
            Payload::Bulk(events) => self.add_bulk(events, context.signal).await,
        }
    }

    /// Place a slice, publishing full batches as it goes
    async fn add_bulk(&mut self, mut events: Vec<Event>, mut signal: Option<Signaler>) {
        loop {
            let space = self.bulk_max_size - self.events.len();
            if events.len() <= space {
                self.events.append(&mut events);
                self.signals.extend(signal);
                if self.events.len() >= self.bulk_max_size {
                    self.flush().await;
                }
                return;
            }

            // slice overflows: fill up, publish, continue with the rest
            let rest = events.split_off(space);
            self.events.append(&mut events);
            let (now, later) = match signal {
                Some(signal) => {
                    let mut halves = signal.split(2).into_iter();
                    (halves.next(), halves.next())
                }
                None => (None, None),
            };
            self.signals.extend(now);
            debug!(
                placed = space,
                remaining = rest.len(),
                "bulk message split across batches"
            );
            self.flush().await;

            events = rest;
            signal = later;
        }
    }

    fn take_batch(&mut self) -> Batch {
        let events = mem::replace(&mut self.events, Vec::with_capacity(self.bulk_max_size));
        let signal = Signaler::composite(mem::take(&mut self.signals));
        Batch::new(events, signal)
    }

    async fn flush(&mut self) {
        let batch = self.take_batch();
        let count = batch.len();
        match self.out.send(batch).await {
            Ok(()) => debug!(events = count, "batch published"),
            Err(mpsc::error::SendError(batch)) => {
                warn!(events = count, "no client worker left, cancelling batch");
                batch.cancelled();
            }
        }
    }

    fn shutdown(mut self) {
        info!("Batching worker shutting down");
        self.rx.close();

        if !self.events.is_empty() {
            let batch = self.take_batch();
            let count = batch.len();
            if let Err(err) = self.out.try_send(batch) {
                debug!(events = count, "partial batch not accepted at shutdown");
                err.into_inner().cancelled();
            }
        }

        let mut failed = 0usize;
        while let Ok(msg) = self.rx.try_recv() {
            failed += msg.len();
            msg.fail(SignalError::new("output shutting down"));
        }
        if failed > 0 {
            warn!(events = failed, "failed queued events at shutdown");
        }
        info!("Batching worker stopped");
    }
}
