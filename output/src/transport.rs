//! Byte-stream transports for the windowed client
//!
//! The client only needs something it can read and write. Dialing is a
//! trait so tests can hand it in-memory pipes instead of sockets.

use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// Default connect timeout (10 seconds)
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A connected duplex byte stream
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// Opens connections to one remote address
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Remote address, used as the client name in logs
    fn addr(&self) -> &str;

    async fn dial(&self) -> io::Result<Box<dyn Stream>>;
}

/// Plain TCP dialer
#[derive(Debug, Clone)]
pub struct TcpDialer {
    addr: String,
    connect_timeout: Duration,
}

impl TcpDialer {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    fn addr(&self) -> &str {
        &self.addr
    }

    async fn dial(&self) -> io::Result<Box<dyn Stream>> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", self.addr),
                )
            })??;
        stream.set_nodelay(true)?;
        debug!(addr = %self.addr, "tcp connection established");
        Ok(Box::new(stream))
    }
}
