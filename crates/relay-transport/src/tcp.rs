//! Length-prefixed TCP transport.
//!
//! Each payload travels as a 4-byte big-endian length followed by the payload
//! bytes. A connection whose peer announces a payload above the configured
//! limit fails with
//! [`relay_protocol::ProtocolError::FrameTooLarge`] and should be dropped.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use relay_protocol::codec::{self, MAX_FRAME_SIZE};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, info};

use crate::traits::{Connection, ConnectionId, Transport, TransportError};

/// TCP transport configuration.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Largest accepted payload in bytes.
    pub max_frame_size: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 5556)),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

/// TCP listener handing out [`TcpConnection`]s.
pub struct TcpTransport {
    listener: TcpListener,
    config: TcpConfig,
}

impl TcpTransport {
    /// Bind a TCP transport.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn new(config: TcpConfig) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(config.bind_addr).await?;

        info!(addr = %config.bind_addr, "TCP transport listening");

        Ok(Self { listener, config })
    }

    /// Get the local address this transport is bound to.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError> {
        let (stream, addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;

        debug!(peer = %addr, "Accepted TCP connection");

        Ok(Box::new(TcpConnection::new(
            stream,
            addr,
            self.config.max_frame_size,
        )))
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}

/// A length-prefixed TCP connection.
pub struct TcpConnection {
    id: ConnectionId,
    stream: TcpStream,
    remote_addr: SocketAddr,
    is_open: bool,
    read_buffer: BytesMut,
    write_buffer: BytesMut,
    max_frame_size: usize,
}

impl TcpConnection {
    fn new(stream: TcpStream, remote_addr: SocketAddr, max_frame_size: usize) -> Self {
        Self {
            id: ConnectionId::generate(),
            stream,
            remote_addr,
            is_open: true,
            read_buffer: BytesMut::with_capacity(4096),
            write_buffer: BytesMut::with_capacity(4096),
            max_frame_size,
        }
    }

    /// Open an outbound connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        max_frame_size: usize,
    ) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let remote_addr = stream.peer_addr()?;
        Ok(Self::new(stream, remote_addr, max_frame_size))
    }
}

#[async_trait]
impl Connection for TcpConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        loop {
            let max_size = self.max_frame_size;
            if let Some(payload) = codec::split_prefixed(&mut self.read_buffer, max_size)? {
                return Ok(Some(payload));
            }

            if self.stream.read_buf(&mut self.read_buffer).await? == 0 {
                self.is_open = false;

                if self.read_buffer.is_empty() {
                    debug!(connection = %self.id, "Peer closed connection");
                    return Ok(None);
                }

                return Err(TransportError::ReceiveFailed(format!(
                    "stream ended with {} unframed bytes",
                    self.read_buffer.len()
                )));
            }
        }
    }

    async fn send(&mut self, payload: Bytes) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }

        self.write_buffer.clear();
        codec::write_prefixed(&payload, &mut self.write_buffer)?;
        self.stream.write_all(&self.write_buffer).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !std::mem::replace(&mut self.is_open, false) {
            return Ok(());
        }

        self.stream.shutdown().await?;
        Ok(())
    }

    fn remote_addr(&self) -> Option<String> {
        Some(self.remote_addr.to_string())
    }

    fn is_open(&self) -> bool {
        self.is_open
    }
}

/// Client side of the request/reply channel: one reply per request, in order.
pub struct RequestClient {
    conn: TcpConnection,
    timeout: Option<Duration>,
}

impl RequestClient {
    /// Connect to a relay request port.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, TransportError> {
        Ok(Self {
            conn: TcpConnection::connect(addr, MAX_FRAME_SIZE).await?,
            timeout: None,
        })
    }

    /// Fail requests whose reply takes longer than `timeout`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Send an encoded request and wait for the encoded reply.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails, is closed before the reply
    /// arrives, or the reply does not arrive within the timeout.
    pub async fn request(&mut self, payload: Bytes) -> Result<Bytes, TransportError> {
        self.conn.send(payload).await?;

        let reply = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.conn.recv())
                .await
                .map_err(|_| TransportError::Timeout)??,
            None => self.conn.recv().await?,
        };

        reply.ok_or(TransportError::ConnectionClosed)
    }

    /// Close the underlying connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the shutdown fails.
    pub async fn close(mut self) -> Result<(), TransportError> {
        self.conn.close().await
    }
}
