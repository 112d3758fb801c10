//! toimitus-core - Core types for the toimitus event shipper
//!
//! This crate provides the types shared between outputs and anything that
//! feeds or implements them:
//!
//! - [`Event`] - the opaque record being shipped
//! - [`Message`] - what producers hand to a batching worker
//! - [`Signaler`] - the acknowledgement tree producers wait on
//! - [`Batch`] - the unit of work a [`NetworkClient`] publishes
//! - [`Codec`] / [`JsonCodec`] - per-event serialization
//! - [`Observer`] - reporting hooks
//! - [`OutputError`] - the error crossing the client boundary
//!
//! Concrete sinks only need this crate to implement [`NetworkClient`]:
//!
//! ```text
//! toimitus-core ◄── toimitus-output ◄── toimitus-runtime
//!       ▲
//!       └────────── third-party sink clients
//! ```

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]
#![warn(missing_docs)]

/// Batches and the retry queue they are handed back through
pub mod batch;
mod client;
/// Per-event serialization
pub mod codec;
mod error;
/// The opaque event record
pub mod event;
/// Producer-facing message envelope
pub mod message;
mod observer;
/// Acknowledgement signalers
pub mod signal;

pub use batch::{Batch, RetryQueue};
pub use client::NetworkClient;
pub use codec::{Codec, JsonCodec};
pub use error::{CodecError, OutputError, SignalError};
pub use event::{Event, Fields};
pub use message::{Context, Message, Payload};
pub use observer::{NoopObserver, Observer};
pub use signal::{SignalExt, SignalResult, SignalWaiter, Signaler, SplitChild};

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_public_types_are_send() {
        fn assert_send<T: Send>() {}
        assert_send::<Event>();
        assert_send::<Message>();
        assert_send::<Signaler>();
        assert_send::<Batch>();
    }

    #[test]
    fn test_observer_is_object_safe() {
        let observer: Arc<dyn Observer> = Arc::new(NoopObserver);
        observer.new_batch(10);
        observer.acked(10);
        observer.window_size(15);
    }

    #[test]
    fn test_codec_is_object_safe() {
        let codec: Arc<dyn Codec> = Arc::new(JsonCodec::new());
        let bytes = codec.encode(&Event::default().field("a", 1)).unwrap();
        assert!(!bytes.is_empty());
    }

    #[tokio::test]
    async fn test_bulk_message_split_across_batches() {
        // producer publishes 5 events that end up in two batches
        let (signal, waiter) = Signaler::single();
        let mut parts = signal.split(2).into_iter();

        let first = Batch::new(vec![Event::default(); 2], parts.next());
        let second = Batch::new(vec![Event::default(); 3], parts.next());

        second.ack();
        first.ack();
        assert_eq!(waiter.wait().await, Ok(()));
    }
}
