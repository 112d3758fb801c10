//! Message - what producers hand to a batching worker
//!
//! A message carries either one event or a slice of events, never both,
//! plus a [`Context`] with the signaler to notify once delivery finished.

use crate::error::SignalError;
use crate::event::Event;
use crate::signal::{SignalExt, Signaler};

/// Events carried by a message
#[derive(Debug)]
pub enum Payload {
    /// One event
    Single(Event),
    /// A slice of events published in one call
    Bulk(Vec<Event>),
}

impl Payload {
    /// Number of events carried
    pub fn len(&self) -> usize {
        match self {
            Payload::Single(_) => 1,
            Payload::Bulk(events) => events.len(),
        }
    }

    /// Whether no events are carried
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Delivery context of a message
#[derive(Debug, Default)]
pub struct Context {
    /// Notified once all events of the message are acked or given up on
    pub signal: Option<Signaler>,
}

impl Context {
    /// Context notifying `signal`
    pub fn new(signal: Option<Signaler>) -> Self {
        Self { signal }
    }
}

/// Unit of work accepted by a batching worker
#[derive(Debug)]
pub struct Message {
    /// Events to ship
    pub payload: Payload,
    /// Producer-side bookkeeping
    pub context: Context,
}

impl Message {
    /// Single-event message without delivery notification
    pub fn single(event: Event) -> Self {
        Self {
            payload: Payload::Single(event),
            context: Context::default(),
        }
    }

    /// Bulk message without delivery notification
    pub fn bulk(events: Vec<Event>) -> Self {
        Self {
            payload: Payload::Bulk(events),
            context: Context::default(),
        }
    }

    /// Attach a signaler
    pub fn with_signal(mut self, signal: Signaler) -> Self {
        self.context.signal = Some(signal);
        self
    }

    /// Number of events carried
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether no events are carried
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Give up on the message and tell the producer why
    pub fn fail(self, cause: SignalError) {
        self.context.signal.failed(cause);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_len() {
        assert_eq!(Message::single(Event::default()).len(), 1);
        assert_eq!(Message::bulk(vec![Event::default(); 4]).len(), 4);
        assert!(Message::bulk(Vec::new()).is_empty());
    }

    #[tokio::test]
    async fn fail_notifies_producer() {
        let (signal, waiter) = Signaler::single();
        let msg = Message::single(Event::default()).with_signal(signal);

        msg.fail(SignalError::new("shutting down"));

        assert_eq!(
            waiter.wait().await,
            Err(SignalError::new("shutting down"))
        );
    }
}
