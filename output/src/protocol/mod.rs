//! Windowed framed protocol
//!
//! [`frame`] holds the wire format, [`WindowedClient`] drives it: it sends
//! at most one window of events per round, waits for cumulative acks and
//! adapts the window to what the receiver keeps up with.

mod client;
pub mod frame;

pub use client::{ClientConfig, WindowedClient};
pub use frame::{Frame, FrameError};
