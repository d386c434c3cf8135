//! Listener pool.
//!
//! Owns listening sockets keyed by their wildcard bind address and runs one
//! accept loop per listener. Every accepted stream is wrapped in a
//! [`Connection`] and handed off to whoever holds the receiving end of the
//! handoff channel.
//!
//! # Lifecycle
//!
//! ```text
//! put(key, listener) ──► accept loop ──► handoff ──► (bridge)
//!                             ▲
//! cancel ─────────────────────┘ stop all loops ──► done
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::net::TcpListener;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::identifiers::ListenerKey;

use super::ErrorSender;
use super::connection::Connection;
use super::handoff::HandoffSender;

// ============================================================================
// Constants
// ============================================================================

/// Pause after a failed accept before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

// ============================================================================
// Types
// ============================================================================

/// One registered listener.
struct ListenerEntry {
    local_addr: SocketAddr,
    /// Stops this listener's accept loop.
    stop: CancellationToken,
}

// ============================================================================
// ListenerPool
// ============================================================================

/// Keyed registry of listening sockets.
///
/// Listeners live until removed or until the pool is cancelled.
pub struct ListenerPool {
    listeners: Mutex<FxHashMap<ListenerKey, ListenerEntry>>,
    conns: HandoffSender<Connection>,
    errs: ErrorSender,
    cancel: CancellationToken,
    done: CancellationToken,
    tracker: TaskTracker,
}

// ============================================================================
// ListenerPool - Constructor
// ============================================================================

impl ListenerPool {
    /// Creates a pool feeding accepted connections into `conns`.
    ///
    /// Spawns a supervisor that tears the pool down once `cancel` fires.
    /// Must be called within a Tokio runtime.
    pub fn new(
        conns: HandoffSender<Connection>,
        errs: ErrorSender,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            listeners: Mutex::new(FxHashMap::default()),
            conns,
            errs,
            cancel,
            done: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });

        tokio::spawn(Arc::clone(&pool).supervise());

        pool
    }
}

// ============================================================================
// ListenerPool - Public API
// ============================================================================

impl ListenerPool {
    /// Registers `listener` under `key` and starts accepting on it.
    ///
    /// # Errors
    ///
    /// - [`Error::PoolClosed`] if the pool was cancelled
    /// - [`Error::ListenerExists`] if `key` is taken
    /// - [`Error::Io`] if the listener's address cannot be read
    pub fn put(&self, key: ListenerKey, listener: TcpListener) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::pool_closed("listener"));
        }

        let local_addr = listener.local_addr()?;
        let stop = self.cancel.child_token();

        {
            let mut listeners = self.listeners.lock();
            if listeners.contains_key(&key) {
                return Err(Error::listener_exists(key));
            }
            listeners.insert(
                key.clone(),
                ListenerEntry {
                    local_addr,
                    stop: stop.clone(),
                },
            );
        }

        self.tracker.spawn(accept_loop(
            key.clone(),
            listener,
            self.conns.clone(),
            self.errs.clone(),
            stop,
        ));

        info!(pool = "listener", %key, %local_addr, "Listener registered");
        Ok(())
    }

    /// Stops and forgets the listener under `key`.
    ///
    /// Returns `true` if it existed.
    pub fn remove(&self, key: &ListenerKey) -> bool {
        let removed = self.listeners.lock().remove(key);

        match removed {
            Some(entry) => {
                entry.stop.cancel();
                debug!(pool = "listener", %key, "Listener removed");
                true
            }
            None => false,
        }
    }

    /// Returns `true` if a listener is registered under `key`.
    #[inline]
    #[must_use]
    pub fn contains(&self, key: &ListenerKey) -> bool {
        self.listeners.lock().contains_key(key)
    }

    /// Returns the bound address of the listener under `key`.
    #[must_use]
    pub fn local_addr(&self, key: &ListenerKey) -> Option<SocketAddr> {
        self.listeners.lock().get(key).map(|entry| entry.local_addr)
    }

    /// Returns the registered keys.
    #[must_use]
    pub fn keys(&self) -> Vec<ListenerKey> {
        self.listeners.lock().keys().cloned().collect()
    }

    /// Returns the number of registered listeners.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Returns `true` if no listener is registered.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
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
// ListenerPool - Lifecycle
// ============================================================================

impl ListenerPool {
    async fn supervise(self: Arc<Self>) {
        self.cancel.cancelled().await;
        debug!(pool = "listener", "Listener pool shutting down");

        self.tracker.close();
        self.tracker.wait().await;
        self.listeners.lock().clear();

        self.done.cancel();
        info!(pool = "listener", "Listener pool stopped");
    }
}

// ============================================================================
// Accept Loop
// ============================================================================

async fn accept_loop(
    key: ListenerKey,
    listener: TcpListener,
    conns: HandoffSender<Connection>,
    errs: ErrorSender,
    stop: CancellationToken,
) {
    debug!(pool = "listener", %key, "Accept loop started");

    loop {
        let accepted = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let stream = match accepted {
            Ok((stream, addr)) => {
                debug!(pool = "listener", %key, %addr, "TCP connection accepted");
                stream
            }
            Err(e) => {
                error!(pool = "listener", %key, error = %e, "Accept failed");
                let _ = errs.send(Error::Io(e));
                sleep(ACCEPT_ERROR_BACKOFF).await;
                continue;
            }
        };

        let conn = match Connection::new(stream) {
            Ok(conn) => conn,
            Err(e) => {
                warn!(pool = "listener", %key, error = %e, "Accepted stream unusable");
                let _ = errs.send(e);
                continue;
            }
        };

        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            handed = conns.send(conn) => {
                if handed.is_err() {
                    debug!(pool = "listener", %key, "Handoff channel closed");
                    break;
                }
            }
        }
    }

    debug!(pool = "listener", %key, "Accept loop terminated");
}

// ============================================================================
// Tests
// ============================================================================
