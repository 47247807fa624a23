//! One established duplex TCP stream.
//!
//! A [`Connection`] owns both halves of its socket. Reads and writes may run
//! concurrently; each of them also waits on the connection's close signal, so
//! [`Connection::close`] unblocks a pending read or write instead of waiting
//! for the peer.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, watch};

use crate::framing::{FrameError, Framing, read_frame, write_frame};

/// Identifier of a connection within one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Reserved identifier of a client's single connection.
    pub const CLIENT: ConnectionId = ConnectionId(0);
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Errors from reading or writing a [`Connection`].
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The connection was already closed, or was closed while the operation waited.
    #[error("connection closed")]
    Closed,
    /// The socket failed or the peer reset the connection.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    /// The payload does not fit in one length-prefixed frame. Nothing was sent.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// The payload size.
        size: u64,
        /// The configured maximum.
        max: u32,
    },
    /// The write did not finish within the configured timeout.
    #[error("write timed out after {0:?}")]
    TimedOut(Duration),
}

impl From<FrameError> for ConnectionError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::PayloadTooLarge { size, max } => {
                ConnectionError::PayloadTooLarge { size, max }
            }
            FrameError::ConnectionClosed => ConnectionError::Closed,
            FrameError::Io(e) => ConnectionError::Transport(e),
        }
    }
}

/// A TCP stream owned by one endpoint.
pub struct Connection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    framing: Framing,
    write_timeout: Option<Duration>,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// `true` once closed. Pending reads and writes wait on it.
    closed: watch::Sender<bool>,
}

impl Connection {
    /// Wrap an established stream.
    pub fn new(
        id: ConnectionId,
        stream: TcpStream,
        framing: Framing,
        write_timeout: Option<Duration>,
    ) -> std::io::Result<Self> {
        let peer_addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            id,
            peer_addr,
            framing,
            write_timeout,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            closed: watch::channel(false).0,
        })
    }

    /// The connection's identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The remote address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Whether the connection has not been closed yet.
    pub fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }

    /// Close the connection.
    ///
    /// Idempotent and non-blocking. Returns `true` only for the call that
    /// actually closed it. Socket halves not held by a pending operation are
    /// released here; a pending read or write wakes up, fails with
    /// [`ConnectionError::Closed`] and releases its half.
    pub fn close(&self) -> bool {
        let closed_now = self.closed.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        });
        if !closed_now {
            return false;
        }

        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        tracing::debug!("Connection {} to {} closed", self.id, self.peer_addr);
        true
    }

    /// Send all of `bytes`, framed according to the connection's framing.
    ///
    /// Transport failures and timeouts close the connection.
    pub async fn write(&self, bytes: &[u8]) -> Result<(), ConnectionError> {
        if !self.is_open() {
            return Err(ConnectionError::Closed);
        }
        let close_signal = closed(self.closed.subscribe());

        let mut guard = self.writer.lock().await;
        if !self.is_open() {
            guard.take();
            return Err(ConnectionError::Closed);
        }
        let Some(writer) = guard.as_mut() else {
            return Err(ConnectionError::Closed);
        };

        let result = tokio::select! {
            biased;
            _ = close_signal => Err(ConnectionError::Closed),
            result = self.write_bounded(writer, bytes) => result,
        };

        match result {
            Ok(()) => Ok(()),
            Err(ConnectionError::PayloadTooLarge { size, max }) => {
                Err(ConnectionError::PayloadTooLarge { size, max })
            }
            Err(err) => {
                if !matches!(err, ConnectionError::Closed) {
                    tracing::warn!("Write to connection {} failed: {err}", self.id);
                }
                guard.take();
                drop(guard);
                self.close();
                Err(err)
            }
        }
    }

    /// Wait for the next chunk from the peer.
    ///
    /// Returns `None` when the peer closes the stream, the transport fails or
    /// the connection is closed locally; the connection is closed in every
    /// one of those cases.
    pub async fn read_chunk(&self) -> Option<Vec<u8>> {
        if !self.is_open() {
            return None;
        }
        let close_signal = closed(self.closed.subscribe());

        let mut guard = self.reader.lock().await;
        if !self.is_open() {
            guard.take();
            return None;
        }
        let reader = guard.as_mut()?;

        let chunk = tokio::select! {
            biased;
            _ = close_signal => None,
            chunk = read_next(self.id, reader, &self.framing) => chunk,
        };

        if chunk.is_none() {
            guard.take();
            drop(guard);
            self.close();
        }
        chunk
    }

    /// Start a new pass over the incoming chunks.
    ///
    /// The returned [`ReadLoop`] yields chunks until the connection ends.
    pub fn read_loop(&self) -> ReadLoop<'_> {
        ReadLoop { connection: self }
    }

    async fn write_bounded(
        &self,
        writer: &mut OwnedWriteHalf,
        bytes: &[u8],
    ) -> Result<(), ConnectionError> {
        match self.write_timeout {
            Some(limit) => tokio::time::timeout(limit, write_framed(writer, bytes, &self.framing))
                .await
                .map_err(|_| ConnectionError::TimedOut(limit))?,
            None => write_framed(writer, bytes, &self.framing).await,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Lazy sequence of chunks received on a [`Connection`].
pub struct ReadLoop<'a> {
    connection: &'a Connection,
}

impl ReadLoop<'_> {
    /// The next chunk, or `None` once the connection has ended.
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        self.connection.read_chunk().await
    }
}

async fn closed(mut rx: watch::Receiver<bool>) {
    // Sender lives as long as the connection, so an error means it is gone.
    let _ = rx.wait_for(|closed| *closed).await;
}

async fn read_next(
    id: ConnectionId,
    reader: &mut OwnedReadHalf,
    framing: &Framing,
) -> Option<Vec<u8>> {
    match framing {
        Framing::Raw { read_buffer } => {
            let mut buf = vec![0u8; (*read_buffer).max(1)];
            match reader.read(&mut buf).await {
                Ok(0) => {
                    tracing::debug!("Connection {id} closed by peer");
                    None
                }
                Ok(n) => {
                    buf.truncate(n);
                    tracing::trace!("Connection {id} received {n} bytes");
                    Some(buf)
                }
                Err(e) => {
                    tracing::warn!("Read from connection {id} failed: {e}");
                    None
                }
            }
        }
        Framing::LengthPrefixed(config) => loop {
            match read_frame(reader, config).await {
                Ok(payload) if payload.is_empty() => continue,
                Ok(payload) => {
                    tracing::trace!("Connection {id} received {} byte frame", payload.len());
                    break Some(payload);
                }
                Err(FrameError::ConnectionClosed) => {
                    tracing::debug!("Connection {id} closed by peer");
                    break None;
                }
                Err(e) => {
                    tracing::warn!("Read from connection {id} failed: {e}");
                    break None;
                }
            }
        },
    }
}

async fn write_framed(
    writer: &mut OwnedWriteHalf,
    bytes: &[u8],
    framing: &Framing,
) -> Result<(), ConnectionError> {
    match framing {
        Framing::Raw { .. } => {
            writer.write_all(bytes).await?;
            writer.flush().await?;
            Ok(())
        }
        Framing::LengthPrefixed(config) => Ok(write_frame(writer, bytes, config).await?),
    }
}
