//! Convenience re-exports for shipper authors.
//!
//! ```rust
//! use toimitus_runtime::prelude::*;
//! ```

// Core types
pub use toimitus_core::{Batch, Codec, Event, Fields, JsonCodec, Message, Signaler};

// Producer side
pub use toimitus_output::{Batcher, EventSender, PublishError};

// Clients and wrappers
pub use toimitus_output::{
    Backoff, BackoffClient, BackoffKind, ClientConfig, FailoverClient, NetworkClient, TcpDialer,
    WindowedClient,
};

// Configuration and observability
pub use toimitus_output::{Config, LogFormat, OutputMetrics, StallPolicy};

// Error types
pub use toimitus_output::{ConfigError, OutputError, SignalError};

// Runtime
pub use crate::{RunningShipper, Shipper};
