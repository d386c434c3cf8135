//! Stream transport layer.
//!
//! This module moves SIP messages over TCP: it listens for inbound
//! connections, pools them for reuse, and dials peers on demand.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────┐  handoff   ┌──────────────┐
//!  listen() ────► │ ListenerPool │ ─────────► │    bridge    │
//!                 └──────────────┘            └──────┬───────┘
//!                                                    │ put
//!                 ┌──────────────┐   get/put  ┌──────▼───────┐
//!  send()  ─────► │ TcpProtocol  │ ─────────► │ConnectionPool│ ──► output
//!                 └──────────────┘            └──────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `connection` | Shared TCP connection wrapper |
//! | `connection_pool` | TTL-bounded connection registry and serve loops |
//! | `framing` | SIP message framing over byte streams |
//! | `handoff` | Rendezvous channel for accepted connections |
//! | `listener_pool` | Listening sockets and accept loops |
//! | `target` | Networks and endpoint targets |
//! | `tcp` | The TCP protocol adapter |

// ============================================================================
// Submodules
// ============================================================================

/// Shared TCP connection wrapper.
pub mod connection;

/// Connection pool with per-entry TTL.
pub mod connection_pool;

/// SIP stream framing.
pub mod framing;

/// Rendezvous channel.
pub mod handoff;

/// Listener pool and accept loops.
pub mod listener_pool;

/// Networks and targets.
pub mod target;

/// TCP protocol adapter.
pub mod tcp;

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::message::Message;

// ============================================================================
// Re-exports
// ============================================================================

pub use connection::Connection;
pub use connection_pool::ConnectionPool;
pub use framing::StreamFramer;
pub use listener_pool::ListenerPool;
pub use target::{Network, Target};
pub use tcp::TcpProtocol;

// ============================================================================
// Types
// ============================================================================

/// Channel on which pools and protocols report asynchronous failures.
pub type ErrorSender = mpsc::UnboundedSender<Error>;

// ============================================================================
// Protocol
// ============================================================================

/// Capability set shared by every transport variant.
///
/// Stream and datagram variants share only this contract, not their
/// implementation.
#[async_trait]
pub trait Protocol: Send + Sync + fmt::Display {
    /// Network this protocol runs over.
    fn network(&self) -> Network;

    /// Whether delivery is reliable.
    fn reliable(&self) -> bool;

    /// Whether the transport is a byte stream without message boundaries.
    fn streamed(&self) -> bool;

    /// Starts accepting inbound traffic on `target`.
    ///
    /// Returns the bound local address.
    async fn listen(&self, target: &Target) -> Result<SocketAddr>;

    /// Delivers `msg` to `target`.
    async fn send(&self, target: &Target, msg: &dyn Message) -> Result<()>;

    /// Completes once the protocol has fully shut down.
    async fn done(&self);
}
