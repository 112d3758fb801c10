//! Windowed protocol client
//!
//! One publish call may take several rounds. Each round:
//!
//! ```text
//!  events[acked..]          window W
//!  ├──── first W ────┤
//!        │ encode (bad events dropped, rest continue)
//!        ▼
//!  '2''W' count ─► '2''J' ... or '2''C' zlib(...)  ─► sink
//!                                                     │
//!  acked += count ◄── '2''A' seq ◄─ ... ◄── '2''A' seq ┘
//! ```
//!
//! A completed round grows the window, any failure halves it. Network and
//! protocol errors close the connection; ack timeouts close it only after
//! `max_consecutive_timeouts` in a row, and that last one is reported as an
//! IO error so callers re-dial. On any error the unacknowledged suffix is
//! handed back through the batch.

use crate::protocol::frame::{self, ACK_FRAME_LEN};
use crate::stall::{StallListener, StallPolicy};
use crate::transport::{Dialer, Stream};
use crate::window::{DEFAULT_WINDOW_START, Window, WindowGauge};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use toimitus_core::{Batch, Codec, Event, NetworkClient, NoopObserver, Observer, OutputError};
use tracing::{debug, info, warn};

/// Default per-round acknowledgement timeout (30 seconds)
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of ack timeouts in a row before the connection is closed
pub const DEFAULT_MAX_CONSECUTIVE_TIMEOUTS: u32 = 3;

/// Default maximum window, also the default batch size
pub const DEFAULT_MAX_WINDOW: usize = 2048;

/// Tuning for a [`WindowedClient`]
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long to wait for each write and each ack frame
    pub timeout: Duration,
    pub max_consecutive_timeouts: u32,
    /// zlib level, 0 sends plain frames
    pub compression_level: u32,
    /// Adapt the window; when off every round carries the whole remainder
    pub slow_start: bool,
    pub window_start: usize,
    pub max_window: usize,
    /// Reconnect connections older than this before the next round
    pub ttl: Option<Duration>,
    /// Zero disables stall detection
    pub stall_timeout: Duration,
    pub stall_policy: StallPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_consecutive_timeouts: DEFAULT_MAX_CONSECUTIVE_TIMEOUTS,
            compression_level: 3,
            slow_start: true,
            window_start: DEFAULT_WINDOW_START,
            max_window: DEFAULT_MAX_WINDOW,
            ttl: None,
            stall_timeout: Duration::from_secs(300),
            stall_policy: StallPolicy::AlertOnly,
        }
    }
}

struct Connection {
    stream: Box<dyn Stream>,
    connected_at: Instant,
}

/// Client speaking the windowed protocol over one byte stream
pub struct WindowedClient {
    dialer: Arc<dyn Dialer>,
    codec: Arc<dyn Codec>,
    observer: Arc<dyn Observer>,
    config: ClientConfig,
    conn: Option<Connection>,
    window: Option<Window>,
    consecutive_timeouts: u32,
}

/// How a round ended when it did not complete
enum Failure {
    Timeout,
    Io(std::io::Error),
    Protocol(String),
}

/// Round outcome short of full acknowledgement
struct RoundError {
    /// Events of the round slice that no longer need sending
    consumed: usize,
    error: OutputError,
}

impl WindowedClient {
    pub fn new(dialer: Arc<dyn Dialer>, codec: Arc<dyn Codec>, config: ClientConfig) -> Self {
        let window = config
            .slow_start
            .then(|| Window::new(config.window_start, config.max_window));
        Self {
            dialer,
            codec,
            observer: Arc::new(NoopObserver),
            config,
            conn: None,
            window,
            consecutive_timeouts: 0,
        }
    }

    /// Report through `observer` instead of discarding
    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Current window, `None` with slow start disabled
    pub fn window_gauge(&self) -> Option<WindowGauge> {
        self.window.as_ref().map(Window::gauge)
    }

    async fn drop_connection(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            let _ = conn.stream.shutdown().await;
            debug!(client = %self.dialer.addr(), "connection closed");
        }
    }

    /// Re-dial when the connection outlived its TTL
    async fn refresh_expired(&mut self) -> Result<(), OutputError> {
        let (Some(ttl), Some(conn)) = (self.config.ttl, self.conn.as_ref()) else {
            return Ok(());
        };
        if conn.connected_at.elapsed() < ttl {
            return Ok(());
        }
        info!(
            client = %self.dialer.addr(),
            ttl_secs = ttl.as_secs(),
            "connection ttl expired, reconnecting"
        );
        self.connect().await
    }

    /// Send events until all are acknowledged or a round fails
    ///
    /// `acked` counts events of `events` that need no further sending.
    async fn send_rounds(
        &mut self,
        events: &[Event],
        acked: &mut usize,
        stall: Option<&StallListener>,
    ) -> Result<(), OutputError> {
        while *acked < events.len() {
            self.refresh_expired().await?;

            let remaining = &events[*acked..];
            let limit = self
                .window
                .as_ref()
                .map_or(remaining.len(), |w| w.get().min(remaining.len()));

            match self.send_round(&remaining[..limit], stall).await {
                Ok(()) => {
                    *acked += limit;
                    if let Some(window) = self.window.as_mut() {
                        window.try_grow(remaining.len());
                        self.observer.window_size(window.get());
                    }
                }
                Err(RoundError { consumed, error }) => {
                    *acked += consumed;
                    if let Some(window) = self.window.as_mut() {
                        window.shrink();
                        self.observer.window_size(window.get());
                    }
                    return Err(error);
                }
            }
        }
        Ok(())
    }

    /// One window: encode, write, collect acks
    async fn send_round(
        &mut self,
        events: &[Event],
        stall: Option<&StallListener>,
    ) -> Result<(), RoundError> {
        let mut payloads: Vec<Bytes> = Vec::with_capacity(events.len());
        let mut positions = Vec::with_capacity(events.len());
        for (idx, event) in events.iter().enumerate() {
            match self.codec.encode(event) {
                Ok(bytes) => {
                    payloads.push(bytes);
                    positions.push(idx);
                }
                Err(e) => {
                    warn!(
                        client = %self.dialer.addr(),
                        codec = self.codec.name(),
                        error = %e,
                        "dropping event that failed to encode"
                    );
                    self.observer.dropped(1);
                }
            }
        }

        // k acked payloads release every event before the (k+1)-th payload,
        // including dropped ones
        let consumed = |k: usize| positions.get(k).copied().unwrap_or(events.len());

        if payloads.is_empty() {
            return Ok(());
        }

        let compression = (self.config.compression_level > 0).then_some(self.config.compression_level);
        let wire = frame::encode_round(&payloads, compression).map_err(|e| RoundError {
            consumed: consumed(0),
            error: OutputError::Io(e),
        })?;

        let Some(conn) = self.conn.as_mut() else {
            return Err(RoundError {
                consumed: consumed(0),
                error: OutputError::NotConnected,
            });
        };

        let count = payloads.len() as u32;
        let started = Instant::now();
        let result = exchange(
            &mut conn.stream,
            &wire,
            count,
            self.config.timeout,
            self.observer.as_ref(),
            stall,
        )
        .await;

        let (acked, failure) = match result {
            Ok(()) => {
                self.consecutive_timeouts = 0;
                self.observer.acked(count as usize);
                self.observer.report_latency(started.elapsed());
                debug!(
                    client = %self.dialer.addr(),
                    events = count,
                    window = self.window.as_ref().map(Window::get),
                    "round acknowledged"
                );
                return Ok(());
            }
            Err(failed) => failed,
        };

        if acked > 0 {
            self.consecutive_timeouts = 0;
            self.observer.acked(acked as usize);
        }

        let error = match failure {
            Failure::Timeout => {
                self.consecutive_timeouts += 1;
                if self.consecutive_timeouts >= self.config.max_consecutive_timeouts {
                    warn!(
                        client = %self.dialer.addr(),
                        timeouts = self.consecutive_timeouts,
                        "too many consecutive ack timeouts, closing connection"
                    );
                    let timeouts = std::mem::take(&mut self.consecutive_timeouts);
                    self.drop_connection().await;
                    OutputError::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("{timeouts} consecutive ack timeouts"),
                    ))
                } else {
                    debug!(
                        client = %self.dialer.addr(),
                        timeouts = self.consecutive_timeouts,
                        acked,
                        "ack timeout"
                    );
                    OutputError::Timeout(self.config.timeout)
                }
            }
            Failure::Io(e) => {
                warn!(client = %self.dialer.addr(), error = %e, acked, "connection failed");
                self.drop_connection().await;
                OutputError::Io(e)
            }
            Failure::Protocol(msg) => {
                warn!(client = %self.dialer.addr(), error = %msg, "protocol violation");
                self.drop_connection().await;
                OutputError::Protocol(msg)
            }
        };

        Err(RoundError {
            consumed: consumed(acked as usize),
            error,
        })
    }
}

/// Write one round and read cumulative acks until `count` is reached
///
/// On failure returns how many payloads were acknowledged before it.
async fn exchange(
    stream: &mut Box<dyn Stream>,
    wire: &[u8],
    count: u32,
    timeout: Duration,
    observer: &dyn Observer,
    stall: Option<&StallListener>,
) -> Result<(), (u32, Failure)> {
    let write = async {
        stream.write_all(wire).await?;
        stream.flush().await
    };
    match tokio::time::timeout(timeout, write).await {
        Ok(Ok(())) => observer.write_bytes(wire.len()),
        Ok(Err(e)) => {
            observer.write_error();
            return Err((0, Failure::Io(e)));
        }
        Err(_) => {
            // a blocked write leaves a partial frame behind
            observer.write_error();
            return Err((
                0,
                Failure::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "write timed out",
                )),
            ));
        }
    }

    let mut acked = 0u32;
    while acked < count {
        let mut raw = [0u8; ACK_FRAME_LEN];
        let mut filled = 0;
        let deadline = Instant::now() + timeout;
        while filled < ACK_FRAME_LEN {
            match tokio::time::timeout_at(deadline, stream.read(&mut raw[filled..])).await {
                Ok(Ok(0)) => {
                    observer.read_error();
                    return Err((
                        acked,
                        Failure::Io(std::io::Error::from(std::io::ErrorKind::UnexpectedEof)),
                    ));
                }
                Ok(Ok(n)) => filled += n,
                Ok(Err(e)) => {
                    observer.read_error();
                    return Err((acked, Failure::Io(e)));
                }
                // half a frame consumed: the stream is no longer aligned
                Err(_) if filled > 0 => {
                    observer.read_error();
                    return Err((
                        acked,
                        Failure::Io(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "timed out inside an ack frame",
                        )),
                    ));
                }
                Err(_) => return Err((acked, Failure::Timeout)),
            }
        }
        observer.read_bytes(ACK_FRAME_LEN);

        let seq = match frame::decode_ack(&raw) {
            Ok(seq) => seq,
            Err(e) => {
                observer.read_error();
                return Err((acked, Failure::Protocol(e.to_string())));
            }
        };
        if seq < acked {
            return Err((
                acked,
                Failure::Protocol(format!("ack sequence went backwards: {seq} < {acked}")),
            ));
        }
        if seq > count {
            return Err((
                acked,
                Failure::Protocol(format!("ack {seq} exceeds {count} events sent")),
            ));
        }

        if let Some(stall) = stall {
            stall.ack((seq - acked) as usize).await;
        }
        acked = seq;
    }
    Ok(())
}

#[async_trait]
impl NetworkClient for WindowedClient {
    fn name(&self) -> &str {
        self.dialer.addr()
    }

    async fn connect(&mut self) -> Result<(), OutputError> {
        self.drop_connection().await;

        let stream = self.dialer.dial().await?;
        self.conn = Some(Connection {
            stream,
            connected_at: Instant::now(),
        });
        self.consecutive_timeouts = 0;
        info!(
            client = %self.dialer.addr(),
            window = self.window.as_ref().map(Window::get),
            "connected"
        );
        Ok(())
    }

    async fn close(&mut self) -> Result<(), OutputError> {
        self.drop_connection().await;
        Ok(())
    }

    async fn publish(&mut self, batch: Batch) -> Result<(), OutputError> {
        if self.conn.is_none() {
            batch.requeue();
            return Err(OutputError::NotConnected);
        }

        let total = batch.len();
        self.observer.new_batch(total);
        if total == 0 {
            batch.ack();
            return Ok(());
        }

        let mut stall = StallListener::spawn(
            self.config.stall_timeout,
            self.config.stall_policy,
            self.dialer.addr(),
        );
        let expiry = stall.as_mut().and_then(StallListener::take_expiry);
        let stalled = async move {
            match expiry {
                Some(rx) => {
                    if rx.await.is_err() {
                        std::future::pending::<()>().await
                    }
                }
                None => std::future::pending::<()>().await,
            }
        };

        let mut acked = 0usize;
        let outcome = {
            let rounds = self.send_rounds(batch.events(), &mut acked, stall.as_ref());
            tokio::select! {
                result = rounds => Some(result),
                _ = stalled => None,
            }
        };
        drop(stall);

        let error = match outcome {
            Some(Ok(())) => {
                batch.ack();
                return Ok(());
            }
            Some(Err(error)) => error,
            None => {
                // the round future was dropped mid-flight; the stream may
                // hold a partial exchange
                self.drop_connection().await;
                if let Some(window) = self.window.as_mut() {
                    window.shrink();
                    self.observer.window_size(window.get());
                }
                OutputError::Stalled(self.config.stall_timeout)
            }
        };

        let unacked = total - acked.min(total);
        self.observer.failed(unacked);
        debug!(
            client = %self.dialer.addr(),
            acked,
            unacked,
            error = %error,
            "handing back unacknowledged events"
        );
        batch.retry_unacked(acked);
        Err(error)
    }
}
