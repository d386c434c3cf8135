//! Rendezvous channel between accept loops and the pool bridge.
//!
//! A send completes only once the receiver has taken the value, so an
//! accepted connection is not handed off until the consumer is ready for
//! it. That throttles accepting to the pace of pool insertion.
//!
//! The receiver is the single closer. There is no `close` on the sending
//! side: the channel closes when the [`HandoffReceiver`] is dropped or
//! [`HandoffReceiver::close`] consumes it.

// ============================================================================
// Imports
// ============================================================================

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

// ============================================================================
// Types
// ============================================================================

/// One value in flight together with its delivery acknowledgement.
struct Slot<T> {
    value: T,
    ack: oneshot::Sender<()>,
}

/// Error returned by [`HandoffSender::send`].
#[derive(Error, Debug)]
pub enum HandoffError<T> {
    /// The receiver is gone; the value is returned to the caller.
    #[error("handoff channel closed")]
    Closed(T),

    /// The receiver closed while the value was queued; the value was dropped.
    #[error("handoff channel closed before the value was taken")]
    Discarded,
}

impl<T> HandoffError<T> {
    /// Returns the undelivered value, if the channel still had it.
    #[must_use]
    pub fn into_inner(self) -> Option<T> {
        match self {
            Self::Closed(value) => Some(value),
            Self::Discarded => None,
        }
    }
}

/// Creates a connected sender/receiver pair.
#[must_use]
pub fn channel<T>() -> (HandoffSender<T>, HandoffReceiver<T>) {
    let (tx, rx) = mpsc::channel(1);
    (HandoffSender { tx }, HandoffReceiver { rx })
}

// ============================================================================
// HandoffSender
// ============================================================================

/// Producing half. Cloneable; every accept loop holds one.
pub struct HandoffSender<T> {
    tx: mpsc::Sender<Slot<T>>,
}

impl<T> Clone for HandoffSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> HandoffSender<T> {
    /// Hands `value` to the receiver, waiting until it has been taken.
    ///
    /// # Errors
    ///
    /// - [`HandoffError::Closed`] if the receiver was already gone
    /// - [`HandoffError::Discarded`] if it went away while the value was queued
    pub async fn send(&self, value: T) -> Result<(), HandoffError<T>> {
        let (ack, delivered) = oneshot::channel();

        self.tx
            .send(Slot { value, ack })
            .await
            .map_err(|err| HandoffError::Closed(err.0.value))?;

        delivered.await.map_err(|_| HandoffError::Discarded)
    }

    /// Returns `true` once the receiver is gone.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// ============================================================================
// HandoffReceiver
// ============================================================================

/// Consuming half. Exactly one exists per channel.
pub struct HandoffReceiver<T> {
    rx: mpsc::Receiver<Slot<T>>,
}

impl<T> HandoffReceiver<T> {
    /// Takes the next value, releasing its sender.
    ///
    /// Returns `None` once every sender is dropped. Cancel safe.
    pub async fn recv(&mut self) -> Option<T> {
        let slot = self.rx.recv().await?;
        let _ = slot.ack.send(());
        Some(slot.value)
    }

    /// Closes the channel. Pending and future sends fail.
    pub fn close(mut self) {
        self.rx.close();
    }
}

// ============================================================================
// Tests
// ============================================================================
