//! Connection pool with per-entry time-to-live.
//!
//! Manages live connections keyed by the remote peer's address. Every
//! stored connection is served by its own task, which reads the stream,
//! frames SIP messages and forwards them on the output channel.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │               ConnectionPool                 │
//! │  ┌────────────────────────────────────────┐  │
//! │  │ 203.0.113.5:40000 → Connection (ttl)   │──┼──► serve task ──► output
//! │  │ 198.51.100.7:5060 → Connection (ttl)   │──┼──► serve task ──► output
//! │  └────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! A serve task ends on EOF, read or framing error, TTL expiry, close or
//! cancellation. It then removes its entry (unless a newer connection
//! has taken the key) and closes the connection.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::future::join_all;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::ConnectionKey;
use crate::message::IncomingMessage;
use crate::options::{DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_READ_BUFFER_SIZE};

use super::ErrorSender;
use super::connection::Connection;
use super::framing::StreamFramer;

// ============================================================================
// Constants
// ============================================================================

/// Stand-in lifetime when a TTL does not fit the clock.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

// ============================================================================
// Types
// ============================================================================

/// One pooled connection.
struct PoolEntry {
    connection: Connection,
    expires_at: Instant,
}

impl PoolEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now && !self.connection.is_closed()
    }
}

/// Why a serve task stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServeExit {
    Cancelled,
    Closed,
    Replaced,
    Expired,
    Eof,
    ReadError,
    FramingError,
}

// ============================================================================
// ConnectionPool
// ============================================================================

/// Keyed, TTL-bounded registry of peer connections.
///
/// Thread-safe; the internal lock is never held across an `.await`.
pub struct ConnectionPool {
    entries: Mutex<FxHashMap<ConnectionKey, PoolEntry>>,
    output: mpsc::Sender<IncomingMessage>,
    errs: ErrorSender,
    cancel: CancellationToken,
    done: CancellationToken,
    tracker: TaskTracker,
    max_message_size: usize,
    read_buffer_size: usize,
}

// ============================================================================
// ConnectionPool - Constructor
// ============================================================================

impl ConnectionPool {
    /// Creates a pool forwarding inbound messages to `output`.
    ///
    /// Spawns a supervisor that drains the pool once `cancel` fires.
    /// Must be called within a Tokio runtime.
    pub fn new(
        output: mpsc::Sender<IncomingMessage>,
        errs: ErrorSender,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Self::with_limits(
            output,
            errs,
            cancel,
            DEFAULT_MAX_MESSAGE_SIZE,
            DEFAULT_READ_BUFFER_SIZE,
        )
    }

    /// Creates a pool with explicit framing limits.
    pub fn with_limits(
        output: mpsc::Sender<IncomingMessage>,
        errs: ErrorSender,
        cancel: CancellationToken,
        max_message_size: usize,
        read_buffer_size: usize,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            entries: Mutex::new(FxHashMap::default()),
            output,
            errs,
            cancel,
            done: CancellationToken::new(),
            tracker: TaskTracker::new(),
            max_message_size,
            read_buffer_size: read_buffer_size.max(1),
        });

        tokio::spawn(Arc::clone(&pool).supervise());

        pool
    }
}

// ============================================================================
// ConnectionPool - Public API
// ============================================================================

impl ConnectionPool {
    /// Stores `connection` under `key` for `ttl` and starts serving it.
    ///
    /// An expired or closed entry under the same key is replaced.
    ///
    /// # Errors
    ///
    /// - [`Error::PoolClosed`] if the pool was cancelled
    /// - [`Error::ConnectionExists`] if a live connection holds `key`
    pub fn put(
        self: &Arc<Self>,
        key: ConnectionKey,
        connection: Connection,
        ttl: Duration,
    ) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::pool_closed("connection"));
        }

        let now = Instant::now();
        {
            let mut entries = self.entries.lock();
            if entries.get(&key).is_some_and(|entry| entry.is_live(now)) {
                return Err(Error::connection_exists(key));
            }
            entries.insert(
                key.clone(),
                PoolEntry {
                    connection: connection.clone(),
                    expires_at: deadline_after(now, ttl),
                },
            );
        }

        debug!(pool = "connection", %key, ttl_secs = ttl.as_secs(), %connection, "Connection stored");

        match connection.take_reader() {
            Some(reader) => {
                self.tracker
                    .spawn(Arc::clone(self).serve(key, connection, reader));
            }
            None => warn!(pool = "connection", %key, "Connection already served elsewhere"),
        }

        Ok(())
    }

    /// Returns the live connection under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionNotFound`] if the key is absent, expired
    /// or its connection is closed.
    pub fn get(&self, key: &ConnectionKey) -> Result<Connection> {
        let now = Instant::now();
        let entries = self.entries.lock();

        entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.connection.clone())
            .ok_or_else(|| Error::connection_not_found(key.clone()))
    }

    /// Resets the TTL of the live entry under `key`.
    ///
    /// Returns `true` if the entry exists.
    pub fn refresh(&self, key: &ConnectionKey, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        match entries.get_mut(key).filter(|entry| entry.is_live(now)) {
            Some(entry) => {
                entry.expires_at = deadline_after(now, ttl);
                trace!(pool = "connection", %key, "TTL refreshed");
                true
            }
            None => false,
        }
    }

    /// Removes and closes the connection under `key`.
    ///
    /// Returns `true` if an entry existed.
    pub async fn remove(&self, key: &ConnectionKey) -> bool {
        let removed = self.entries.lock().remove(key);

        match removed {
            Some(entry) => {
                entry.connection.close().await;
                debug!(pool = "connection", %key, "Connection removed");
                true
            }
            None => false,
        }
    }

    /// Removes and closes `connection` if it still occupies its key.
    ///
    /// Returns `true` if it was pooled.
    pub async fn evict(&self, connection: &Connection) -> bool {
        let evicted = self.forget(&connection.key(), connection);
        if evicted {
            connection.close().await;
            debug!(pool = "connection", key = %connection.key(), "Connection evicted");
        }
        evicted
    }

    /// Returns the number of stored entries, expired ones included until
    /// their serve task reaps them.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if the pool holds no entries.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Returns the stored keys.
    #[must_use]
    pub fn keys(&self) -> Vec<ConnectionKey> {
        self.entries.lock().keys().cloned().collect()
    }

    /// Waits until the pool has fully stopped.
    pub async fn done(&self) {
        self.done.cancelled().await;
    }

    /// Returns `true` once the pool has fully stopped.
    #[inline]
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }
}

// ============================================================================
// ConnectionPool - Lifecycle
// ============================================================================

impl ConnectionPool {
    async fn supervise(self: Arc<Self>) {
        self.cancel.cancelled().await;
        debug!(pool = "connection", "Connection pool shutting down");

        self.tracker.close();
        self.tracker.wait().await;

        let leftovers: Vec<Connection> = {
            let mut entries = self.entries.lock();
            entries.drain().map(|(_, entry)| entry.connection).collect()
        };
        join_all(leftovers.iter().map(Connection::close)).await;

        self.done.cancel();
        info!(pool = "connection", "Connection pool stopped");
    }

    /// Deadline of the entry under `key` if it still holds `connection`.
    fn deadline(&self, key: &ConnectionKey, connection: &Connection) -> Option<Instant> {
        self.entries
            .lock()
            .get(key)
            .filter(|entry| entry.connection.same_as(connection))
            .map(|entry| entry.expires_at)
    }

    /// Removes the entry under `key` if it still holds `connection`.
    fn forget(&self, key: &ConnectionKey, connection: &Connection) -> bool {
        let mut entries = self.entries.lock();
        let owned = entries
            .get(key)
            .is_some_and(|entry| entry.connection.same_as(connection));
        if owned {
            entries.remove(key);
        }
        owned
    }
}

// ============================================================================
// ConnectionPool - Serve Loop
// ============================================================================

impl ConnectionPool {
    async fn serve(
        self: Arc<Self>,
        key: ConnectionKey,
        connection: Connection,
        reader: OwnedReadHalf,
    ) {
        debug!(pool = "connection", %key, "Serve loop started");

        let closed = connection.closed_token().clone();
        let mut frames = FramedRead::with_capacity(
            reader,
            StreamFramer::new(self.max_message_size),
            self.read_buffer_size,
        );

        let exit = loop {
            let Some(deadline) = self.deadline(&key, &connection) else {
                break ServeExit::Replaced;
            };

            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break ServeExit::Cancelled,
                _ = closed.cancelled() => break ServeExit::Closed,
                _ = sleep_until(deadline) => {
                    // The TTL may have been refreshed while sleeping.
                    match self.deadline(&key, &connection) {
                        Some(current) if current > Instant::now() => continue,
                        Some(_) => break ServeExit::Expired,
                        None => break ServeExit::Replaced,
                    }
                }
                frame = frames.next() => frame,
            };

            match frame {
                Some(Ok(text)) => {
                    if let Some(exit) = self.forward(&key, &connection, &closed, text).await {
                        break exit;
                    }
                }
                Some(Err(Error::Io(e))) => {
                    warn!(pool = "connection", %key, error = %e, "Read failed");
                    let _ = self.errs.send(Error::Io(e));
                    break ServeExit::ReadError;
                }
                Some(Err(e)) => {
                    warn!(pool = "connection", %key, error = %e, "Inbound stream rejected");
                    let _ = self.errs.send(e);
                    break ServeExit::FramingError;
                }
                None => break ServeExit::Eof,
            }
        };

        let _ = self.forget(&key, &connection);
        connection.close().await;

        debug!(pool = "connection", %key, reason = ?exit, "Serve loop terminated");
    }

    /// Delivers one message; a full output channel never blocks shutdown.
    async fn forward(
        &self,
        key: &ConnectionKey,
        connection: &Connection,
        closed: &CancellationToken,
        text: String,
    ) -> Option<ServeExit> {
        let message = IncomingMessage {
            text,
            source: connection.remote_addr(),
            destination: connection.local_addr(),
            connection: key.clone(),
        };

        trace!(pool = "connection", %key, start_line = message.start_line(), "Message received");

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Some(ServeExit::Cancelled),
            _ = closed.cancelled() => Some(ServeExit::Closed),
            sent = self.output.send(message) => {
                if sent.is_err() {
                    debug!(pool = "connection", %key, "Output channel closed, message dropped");
                }
                None
            }
        }
    }
}

/// `now + ttl`, clamped for lifetimes the clock cannot represent.
fn deadline_after(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

// ============================================================================
// Tests
// ============================================================================
