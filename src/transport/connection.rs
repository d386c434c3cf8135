//! Pooled stream connection.
//!
//! This module wraps one accepted or dialed TCP stream so it can be
//! stored in the connection pool and shared by concurrent senders.
//!
//! # Halves
//!
//! The stream is split on construction:
//!
//! - The write half sits behind an async mutex; every `write` sends one
//!   complete message, so concurrent senders never interleave bytes
//! - The read half is taken exactly once by the pool's serve task

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::io::{Error as IoError, ErrorKind};
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::Result;
use crate::identifiers::{ConnectionId, ConnectionKey};

use super::target::Network;

// ============================================================================
// Connection
// ============================================================================

/// A TCP connection shared between the pool and its users.
///
/// Cloning is cheap; all clones refer to the same socket.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: ConnectionId,
    network: Network,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    /// Read half, until the serve task takes it.
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    /// Cancelled once the connection is closed.
    closed: CancellationToken,
}

impl Connection {
    /// Wraps a connected TCP stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) if the socket addresses
    /// cannot be read.
    pub fn new(stream: TcpStream) -> Result<Self> {
        let local_addr = stream.local_addr()?;
        let remote_addr = stream.peer_addr()?;
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();

        let id = ConnectionId::generate();
        debug!(connection_id = %id, %local_addr, %remote_addr, "Connection created");

        Ok(Self {
            inner: Arc::new(ConnectionInner {
                id,
                network: Network::Tcp,
                local_addr,
                remote_addr,
                reader: Mutex::new(Some(reader)),
                writer: tokio::sync::Mutex::new(writer),
                closed: CancellationToken::new(),
            }),
        })
    }

    /// Returns the connection's unique ID.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Returns the network this connection runs over.
    #[inline]
    #[must_use]
    pub fn network(&self) -> Network {
        self.inner.network
    }

    /// Returns the local socket address.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Returns the remote peer's socket address.
    #[inline]
    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    /// Returns the pool key for this connection.
    #[inline]
    #[must_use]
    pub fn key(&self) -> ConnectionKey {
        ConnectionKey::from(self.inner.remote_addr)
    }

    /// Returns `true` if both values refer to the same socket.
    #[inline]
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Writes `data` in full.
    ///
    /// Returns the number of bytes written. A failed write may have been
    /// partial; the connection is not closed by this call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) if the connection is closed
    /// or the socket write fails.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        let closed = &self.inner.closed;

        // A peer that stops reading must not hold the writer past close().
        let mut writer = tokio::select! {
            biased;
            _ = closed.cancelled() => return Err(not_connected()),
            writer = self.inner.writer.lock() => writer,
        };

        tokio::select! {
            biased;
            _ = closed.cancelled() => return Err(not_connected()),
            written = async {
                writer.write_all(data).await?;
                writer.flush().await
            } => written?,
        }

        trace!(connection_id = %self.inner.id, bytes = data.len(), "Data written");
        Ok(data.len())
    }

    /// Shuts down the write direction without closing the connection.
    #[cfg(test)]
    pub(crate) async fn shutdown_write(&self) -> Result<()> {
        self.inner.writer.lock().await.shutdown().await?;
        Ok(())
    }

    /// Returns `true` once [`close`](Self::close) was called.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Closes the connection.
    ///
    /// Shuts down the write direction and stops the pool's reader.
    /// Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.is_cancelled() {
            return;
        }
        self.inner.closed.cancel();

        let mut writer = self.inner.writer.lock().await;
        let _ = writer.shutdown().await;

        debug!(connection_id = %self.inner.id, "Connection closed");
    }

    /// Takes the read half. Returns `None` after the first call.
    pub(crate) fn take_reader(&self) -> Option<OwnedReadHalf> {
        self.inner.reader.lock().take()
    }

    /// Token cancelled when the connection closes.
    pub(crate) fn closed_token(&self) -> &CancellationToken {
        &self.inner.closed
    }
}

fn not_connected() -> crate::Error {
    IoError::new(ErrorKind::NotConnected, "connection is closed").into()
}

// ============================================================================
// Connection - Display
// ============================================================================

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} connection {} ({} -> {})",
            self.inner.network, self.inner.id, self.inner.local_addr, self.inner.remote_addr
        )
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("local_addr", &self.inner.local_addr)
            .field("remote_addr", &self.inner.remote_addr)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================
