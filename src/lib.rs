//! SIP stream transport - connection-pooling TCP transport for SIP stacks.
//!
//! This library moves already-serialized SIP messages over TCP. It accepts
//! inbound connections, keeps outbound and inbound connections in a shared
//! pool for reuse, frames inbound byte streams back into messages, and
//! dials peers on demand.
//!
//! # Architecture
//!
//! A [`TcpProtocol`] owns two pools joined by a bridge task:
//!
//! - **[`ListenerPool`]**: listening sockets keyed by `0.0.0.0:<port>`,
//!   one accept loop each
//! - **[`ConnectionPool`]**: live connections keyed by remote address,
//!   each with a TTL and a serve loop feeding the output channel
//!
//! Accepted connections travel from the listener pool to the bridge over a
//! rendezvous handoff, and the bridge inserts them into the connection pool.
//! Outbound sends look up the same pool, so replies reuse whichever
//! connection the peer opened.
//!
//! # Quick Start
//!
//! ```no_run
//! use sip_stream_transport::{
//!     Protocol, RawMessage, Result, Target, TcpProtocol, TransportOptions,
//! };
//! use tokio::sync::mpsc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let (output, mut inbound) = mpsc::channel(64);
//!     let (errs, _errors) = mpsc::unbounded_channel();
//!     let cancel = CancellationToken::new();
//!
//!     let tcp = TcpProtocol::spawn(output, errs, cancel.clone(), TransportOptions::new());
//!     let bound = tcp.listen(&Target::port(5060)).await?;
//!     println!("Listening on {bound}");
//!
//!     let msg = RawMessage::new("OPTIONS sip:bob@203.0.113.5 SIP/2.0\r\nContent-Length: 0\r\n\r\n");
//!     tcp.send(&Target::new("203.0.113.5", 5060), &msg).await?;
//!
//!     if let Some(incoming) = inbound.recv().await {
//!         println!("{} from {}", incoming.start_line(), incoming.source);
//!     }
//!
//!     cancel.cancel();
//!     tcp.done().await;
//!     tcp.join().await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe IDs and pool keys |
//! | [`message`] | Outbound message contract and inbound messages |
//! | [`options`] | Transport configuration |
//! | [`transport`] | Protocol trait, pools and the TCP adapter |

// ============================================================================
// Modules
// ============================================================================

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers and pool keys.
pub mod identifiers;

/// Messages handed to and produced by the transport.
pub mod message;

/// Transport configuration.
pub mod options;

/// Stream transport layer.
///
/// Defines the [`Protocol`] contract and its TCP implementation.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{ConnectionId, ConnectionKey, ListenerKey, ProtocolId};

// Message types
pub use message::{IncomingMessage, Message, RawMessage};

// Configuration
pub use options::TransportOptions;

// Transport types
pub use transport::{
    Connection, ConnectionPool, ErrorSender, ListenerPool, Network, Protocol, StreamFramer,
    Target, TcpProtocol,
};
