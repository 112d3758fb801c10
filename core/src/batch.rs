//! Batch - the unit of work handed to a network client
//!
//! A batch owns its events and the signaler of every producer call that
//! contributed to it. The client finishes a batch with exactly one of:
//!
//! - [`Batch::ack`] - everything delivered
//! - [`Batch::retry`] / [`Batch::retry_events`] / [`Batch::retry_unacked`] -
//!   hand all or part of it back for another attempt
//! - [`Batch::requeue`] - hand it back without consuming an attempt
//! - [`Batch::discard`] / [`Batch::cancelled`] / [`Batch::fail`] - give up
//!
//! Hand-backs go through the [`RetryQueue`] the batch was bound to when a
//! dispatcher picked it up. Once the retry budget is spent the producer is
//! told about the failure instead.

use crate::error::SignalError;
use crate::event::Event;
use crate::signal::{SignalExt, Signaler};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Where handed-back batches go
#[derive(Debug, Clone)]
pub struct RetryQueue {
    tx: mpsc::UnboundedSender<Batch>,
    max_retries: Option<u32>,
}

impl RetryQueue {
    /// Wrap a sender; `max_retries = None` retries forever
    pub fn new(tx: mpsc::UnboundedSender<Batch>, max_retries: Option<u32>) -> Self {
        Self { tx, max_retries }
    }

    /// Create a queue together with its receiving end
    pub fn channel(max_retries: Option<u32>) -> (Self, mpsc::UnboundedReceiver<Batch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx, max_retries), rx)
    }

    /// Hand-backs allowed per batch, `None` for unlimited
    pub fn max_retries(&self) -> Option<u32> {
        self.max_retries
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_retries.is_some_and(|max| attempts > max)
    }
}

/// Ordered events plus the signaler waiting on them
#[derive(Debug)]
pub struct Batch {
    events: Vec<Event>,
    signal: Option<Signaler>,
    retry: Option<RetryQueue>,
    attempts: u32,
}

impl Batch {
    /// Unbound batch with no attempts yet
    pub fn new(events: Vec<Event>, signal: Option<Signaler>) -> Self {
        Self {
            events,
            signal,
            retry: None,
            attempts: 0,
        }
    }

    /// Events still to deliver
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Number of events
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the batch carries no events
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// How many times this batch has been handed back
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Route future hand-backs to `queue`
    pub fn bind(&mut self, queue: RetryQueue) {
        self.retry = Some(queue);
    }

    /// Whether a retry queue is attached
    pub fn is_bound(&self) -> bool {
        self.retry.is_some()
    }

    /// Every event was acknowledged
    pub fn ack(self) {
        self.signal.completed();
    }

    /// Hand the whole batch back
    pub fn retry(self) {
        self.hand_back(true);
    }

    /// Hand back only `events`; the rest counts as delivered
    pub fn retry_events(mut self, events: Vec<Event>) {
        if events.is_empty() {
            self.ack();
            return;
        }
        self.events = events;
        self.hand_back(true);
    }

    /// Hand back the events after the first `acked`
    pub fn retry_unacked(mut self, acked: usize) {
        let acked = acked.min(self.events.len());
        let rest = self.events.split_off(acked);
        self.retry_events(rest);
    }

    /// Hand the batch back without consuming a retry attempt
    pub fn requeue(self) {
        self.hand_back(false);
    }

    /// Discard without retry
    pub fn discard(self) {
        self.fail(SignalError::new("batch dropped"));
    }

    /// Discard because the pipeline is shutting down
    pub fn cancelled(self) {
        self.fail(SignalError::new("batch cancelled"));
    }

    /// Give up on the batch with a specific cause
    pub fn fail(self, cause: SignalError) {
        self.signal.failed(cause);
    }

    fn hand_back(mut self, count_attempt: bool) {
        let Some(queue) = self.retry.clone() else {
            debug!(events = self.events.len(), "batch has no retry queue");
            self.fail(SignalError::new("no retry queue"));
            return;
        };

        if count_attempt {
            self.attempts += 1;
            if queue.exhausted(self.attempts) {
                warn!(
                    events = self.events.len(),
                    attempts = self.attempts,
                    "retry limit reached, dropping batch"
                );
                self.fail(SignalError::new("retry limit reached"));
                return;
            }
        }

        if let Err(mpsc::error::SendError(batch)) = queue.tx.send(self) {
            batch.fail(SignalError::new("retry queue closed"));
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn events(n: usize) -> Vec<Event> {
        (0..n).map(|i| Event::default().field("n", i)).collect()
    }

    fn numbers(batch: &Batch) -> Vec<u64> {
        batch
            .events()
            .iter()
            .map(|e| e.get("n").and_then(|v| v.as_u64()).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn ack_completes_signal() {
        let (signal, waiter) = Signaler::single();
        Batch::new(events(3), Some(signal)).ack();
        assert_eq!(waiter.wait().await, Ok(()));
    }

    #[tokio::test]
    async fn retry_without_queue_fails() {
        let (signal, waiter) = Signaler::single();
        Batch::new(events(3), Some(signal)).retry();
        assert_eq!(
            waiter.wait().await,
            Err(SignalError::new("no retry queue"))
        );
    }

    #[test]
    fn retry_unacked_hands_back_suffix() {
        let (queue, mut rx) = RetryQueue::channel(None);
        let mut batch = Batch::new(events(5), None);
        batch.bind(queue);

        batch.retry_unacked(2);

        let back = rx.try_recv().unwrap();
        assert_eq!(numbers(&back), vec![2, 3, 4]);
        assert_eq!(back.attempts(), 1);
        assert!(back.is_bound());
    }

    #[test]
    fn retry_unacked_everything_acked_completes() {
        let (queue, mut rx) = RetryQueue::channel(None);
        let (signal, mut waiter) = Signaler::single();
        let mut batch = Batch::new(events(3), Some(signal));
        batch.bind(queue);

        batch.retry_unacked(7);

        assert!(rx.try_recv().is_err());
        assert_eq!(waiter.try_result(), Some(Ok(())));
    }

    #[test]
    fn retry_limit_fails_signal() {
        let (queue, mut rx) = RetryQueue::channel(Some(1));
        let (signal, mut waiter) = Signaler::single();
        let mut batch = Batch::new(events(2), Some(signal));
        batch.bind(queue);

        batch.retry();
        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.attempts(), 1);
        assert!(waiter.try_result().is_none());

        batch.retry();
        assert!(rx.try_recv().is_err());
        assert_eq!(
            waiter.try_result(),
            Some(Err(SignalError::new("retry limit reached")))
        );
    }

    #[test]
    fn requeue_does_not_consume_attempts() {
        let (queue, mut rx) = RetryQueue::channel(Some(0));
        let mut batch = Batch::new(events(1), None);
        batch.bind(queue);

        batch.requeue();
        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.attempts(), 0);
    }

    #[test]
    fn closed_queue_fails_signal() {
        let (queue, rx) = RetryQueue::channel(None);
        drop(rx);
        let (signal, mut waiter) = Signaler::single();
        let mut batch = Batch::new(events(1), Some(signal));
        batch.bind(queue);

        batch.retry();
        assert_eq!(
            waiter.try_result(),
            Some(Err(SignalError::new("retry queue closed")))
        );
    }

    #[test]
    fn discard_and_cancelled_fail() {
        let (signal, mut waiter) = Signaler::single();
        Batch::new(events(1), Some(signal)).discard();
        assert_eq!(waiter.try_result(), Some(Err(SignalError::new("batch dropped"))));

        let (signal, mut waiter) = Signaler::single();
        Batch::new(events(1), Some(signal)).cancelled();
        assert_eq!(
            waiter.try_result(),
            Some(Err(SignalError::new("batch cancelled")))
        );
    }

    #[test]
    fn dropped_batch_fails_signal() {
        let (signal, mut waiter) = Signaler::single();
        drop(Batch::new(events(1), Some(signal)));
        assert!(matches!(waiter.try_result(), Some(Err(_))));
    }
}
