//! In-process receiver for exercising clients without a network
//!
//! [`MockReceiver`] speaks the receiving side of the windowed protocol with
//! scriptable ack behaviour and records what it got. [`MemoryDialer`]
//! connects a client to it over an in-memory duplex pipe.
//!
//! ```ignore
//! let receiver = MockReceiver::new(AckBehavior::AckAll);
//! let mut client = WindowedClient::new(
//!     Arc::new(MemoryDialer::new(receiver.clone())),
//!     Arc::new(JsonCodec::new()),
//!     ClientConfig::default(),
//! );
//! ```

use crate::protocol::frame::{self, ACK_FRAME_LEN, Frame};
use crate::transport::{Dialer, Stream};
use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use serde_json::Value;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tracing::debug;

const PIPE_CAPACITY: usize = 1 << 20;

/// How the receiver acknowledges each round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckBehavior {
    /// One ack covering the whole round
    AckAll,
    /// Cumulative acks every `n` events, then the final count
    Steps(u32),
    /// Always ack this sequence number, whatever was sent
    Fixed(u32),
    /// Read rounds but never ack
    Never,
    /// Ack up to `n` (nothing for 0) and close the connection
    AckThenClose(u32),
    /// Send exactly these sequence numbers, in order
    Seq(Vec<u32>),
    /// Send only the first half of an ack frame for `n`, then go quiet
    Torn(u32),
}

#[derive(Debug, Default)]
struct State {
    behavior: Option<AckBehavior>,
    refusing: bool,
    connections: usize,
    windows: Vec<u32>,
    compressed: usize,
    received: Vec<Value>,
    acks: Vec<u32>,
}

/// Scriptable receiving end of the windowed protocol
#[derive(Debug, Clone)]
pub struct MockReceiver {
    state: Arc<Mutex<State>>,
}

impl MockReceiver {
    pub fn new(behavior: AckBehavior) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                behavior: Some(behavior),
                ..State::default()
            })),
        }
    }

    /// Change ack behaviour for rounds read from now on
    pub fn set_behavior(&self, behavior: AckBehavior) {
        self.state.lock().behavior = Some(behavior);
    }

    /// Refuse new connections
    pub fn set_refusing(&self, refusing: bool) {
        self.state.lock().refusing = refusing;
    }

    /// Number of accepted connections
    pub fn connections(&self) -> usize {
        self.state.lock().connections
    }

    /// Window sizes announced by clients, one per round
    pub fn window_announcements(&self) -> Vec<u32> {
        self.state.lock().windows.clone()
    }

    /// Number of compressed frames seen
    pub fn compressed_frames(&self) -> usize {
        self.state.lock().compressed
    }

    /// Decoded event payloads in arrival order
    pub fn received(&self) -> Vec<Value> {
        self.state.lock().received.clone()
    }

    /// Ack sequence numbers sent back
    pub fn acks(&self) -> Vec<u32> {
        self.state.lock().acks.clone()
    }

    fn accept(&self) -> io::Result<DuplexStream> {
        {
            let mut state = self.state.lock();
            if state.refusing {
                return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
            }
            state.connections += 1;
        }

        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        let receiver = self.clone();
        tokio::spawn(async move {
            if let Err(e) = receiver.serve(server).await {
                debug!(error = %e, "mock receiver connection ended");
            }
        });
        Ok(client)
    }

    async fn serve(self, mut stream: DuplexStream) -> io::Result<()> {
        let mut buf = BytesMut::new();
        loop {
            let count = match next_frame(&mut stream, &mut buf).await? {
                Some(Frame::Window(count)) => count,
                Some(other) => return Err(unexpected(&other)),
                None => return Ok(()),
            };
            self.state.lock().windows.push(count);

            let mut got = 0u32;
            while got < count {
                match next_frame(&mut stream, &mut buf).await? {
                    Some(Frame::Data { payload, .. }) => {
                        self.record(&payload);
                        got += 1;
                    }
                    Some(Frame::Compressed(inner)) => {
                        self.state.lock().compressed += 1;
                        let frames = frame::decode_all(&inner)
                            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                        for frame in frames {
                            match frame {
                                Frame::Data { payload, .. } => {
                                    self.record(&payload);
                                    got += 1;
                                }
                                other => return Err(unexpected(&other)),
                            }
                        }
                    }
                    Some(other) => return Err(unexpected(&other)),
                    None => return Ok(()),
                }
            }

            let behavior = self
                .state
                .lock()
                .behavior
                .clone()
                .unwrap_or(AckBehavior::AckAll);
            match behavior {
                AckBehavior::AckAll => self.ack(&mut stream, count).await?,
                AckBehavior::Steps(step) => {
                    let step = step.max(1);
                    let mut seq = step.min(count);
                    loop {
                        self.ack(&mut stream, seq).await?;
                        if seq == count {
                            break;
                        }
                        seq = (seq + step).min(count);
                    }
                }
                AckBehavior::Fixed(seq) => self.ack(&mut stream, seq).await?,
                AckBehavior::Never => {}
                AckBehavior::AckThenClose(seq) => {
                    if seq > 0 {
                        self.ack(&mut stream, seq.min(count)).await?;
                    }
                    stream.shutdown().await?;
                    return Ok(());
                }
                AckBehavior::Seq(seqs) => {
                    for seq in seqs {
                        self.ack(&mut stream, seq).await?;
                    }
                }
                AckBehavior::Torn(seq) => {
                    let mut out = BytesMut::new();
                    frame::encode_ack(&mut out, seq);
                    stream.write_all(&out[..ACK_FRAME_LEN / 2]).await?;
                    stream.flush().await?;
                }
            }
        }
    }

    fn record(&self, payload: &[u8]) {
        let value = serde_json::from_slice(payload)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(payload).into_owned()));
        self.state.lock().received.push(value);
    }

    async fn ack(&self, stream: &mut DuplexStream, seq: u32) -> io::Result<()> {
        let mut out = BytesMut::new();
        frame::encode_ack(&mut out, seq);
        stream.write_all(&out).await?;
        self.state.lock().acks.push(seq);
        Ok(())
    }
}

async fn next_frame(stream: &mut DuplexStream, buf: &mut BytesMut) -> io::Result<Option<Frame>> {
    loop {
        if let Some(frame) =
            frame::decode(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
        {
            return Ok(Some(frame));
        }
        if stream.read_buf(buf).await? == 0 {
            return Ok(None);
        }
    }
}

fn unexpected(frame: &Frame) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("unexpected frame {frame:?}"),
    )
}

/// Dialer connecting to a [`MockReceiver`]
#[derive(Debug, Clone)]
pub struct MemoryDialer {
    addr: String,
    receiver: MockReceiver,
}

impl MemoryDialer {
    pub fn new(receiver: MockReceiver) -> Self {
        Self::with_addr("memory", receiver)
    }

    pub fn with_addr(addr: impl Into<String>, receiver: MockReceiver) -> Self {
        Self {
            addr: addr.into(),
            receiver,
        }
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    fn addr(&self) -> &str {
        &self.addr
    }

    async fn dial(&self) -> io::Result<Box<dyn Stream>> {
        Ok(Box::new(self.receiver.accept()?))
    }
}
