//! NetworkClient trait - the shape every sink connection exposes
//!
//! Backoff and failover wrappers are generic over this trait, and client
//! workers drive any implementation the same way:
//!
//! ```text
//!  connect() ──► publish(batch) ──► publish(batch) ──► ... ──► close()
//!      ▲               │ Err
//!      └───────────────┘ (worker marks the client disconnected)
//! ```

use crate::batch::Batch;
use crate::error::OutputError;
use async_trait::async_trait;

/// A connection to one sink
///
/// # Implementation Requirements
///
/// - `publish` takes ownership of the batch and must finish it: ack it,
///   hand all or part of it back, or fail it. Returning an error does not
///   release the implementation from that duty.
/// - After `publish` returns an error other than
///   [`OutputError::Timeout`] the caller treats the connection as broken and
///   calls `connect` again before the next publish.
/// - `close` is safe to call on a client that is not connected.
///
/// # Example
///
/// ```ignore
/// use toimitus_core::{Batch, NetworkClient, OutputError};
/// use async_trait::async_trait;
///
/// struct Discard;
///
/// #[async_trait]
/// impl NetworkClient for Discard {
///     fn name(&self) -> &str {
///         "discard"
///     }
///
///     async fn connect(&mut self) -> Result<(), OutputError> {
///         Ok(())
///     }
///
///     async fn close(&mut self) -> Result<(), OutputError> {
///         Ok(())
///     }
///
///     async fn publish(&mut self, batch: Batch) -> Result<(), OutputError> {
///         batch.ack();
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait NetworkClient: Send {
    /// Name for logs, usually the remote address
    fn name(&self) -> &str;

    /// Establish the connection
    async fn connect(&mut self) -> Result<(), OutputError>;

    /// Tear the connection down
    async fn close(&mut self) -> Result<(), OutputError>;

    /// Deliver a batch
    async fn publish(&mut self, batch: Batch) -> Result<(), OutputError>;
}

#[async_trait]
impl<C: NetworkClient + ?Sized> NetworkClient for Box<C> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn connect(&mut self) -> Result<(), OutputError> {
        (**self).connect().await
    }

    async fn close(&mut self) -> Result<(), OutputError> {
        (**self).close().await
    }

    async fn publish(&mut self, batch: Batch) -> Result<(), OutputError> {
        (**self).publish(batch).await
    }
}
