//! toimitus output - event shipping to windowed-protocol sinks
//!
//! Producers hand events to a batching worker; client workers push the
//! resulting batches through wrapped network clients:
//!
//! ```text
//! EventSender ──► BatchingWorker ──► WorkQueue ──► ClientWorker ──► Backoff ──► Failover ──► WindowedClient
//!                                        ▲                                                        │
//!                                        └──────────────── hand-back (retry) ─────────────────────┘
//! ```
//!
//! Every stage reports delivery back to the producer through the
//! signaler attached to its events.

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod backoff;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod failover;
pub mod metrics;
pub mod protocol;
pub mod stall;
pub mod transport;
pub mod window;
pub mod worker;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use backoff::{Backoff, BackoffClient, BackoffKind};
pub use config::{Config, LogFormat};
pub use dispatch::{ClientWorker, WorkQueue};
pub use error::{ConfigError, PublishError};
pub use failover::FailoverClient;
pub use metrics::{MetricsSnapshot, OutputMetrics};
pub use protocol::{ClientConfig, WindowedClient};
pub use stall::{StallListener, StallPolicy};
pub use transport::{Dialer, Stream, TcpDialer};
pub use window::{Window, WindowGauge};
pub use worker::{Batcher, BatchingWorker, EventSender};

/// Resolves once `flag` is raised or its sender is gone
///
/// The `watch::Ref` from `wait_for` is dropped before returning, so the
/// future stays `Send` inside `select!`.
pub(crate) async fn raised(flag: &mut tokio::sync::watch::Receiver<bool>) {
    let _ = flag.wait_for(|set| *set).await;
}

// Core types most users need alongside the output machinery
pub use toimitus_core::{
    Batch, Codec, Event, JsonCodec, Message, NetworkClient, Observer, OutputError, SignalError,
    Signaler,
};
