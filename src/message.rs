//! SIP message types seen by the transport.
//!
//! The transport does not parse SIP. Outbound messages only need a wire
//! rendering and a short form for logs; inbound messages are delivered as
//! framed text together with the addresses they travelled between.
//!
//! | Type | Direction | Purpose |
//! |------|-----------|---------|
//! | [`Message`] | Outbound | Anything that renders to SIP wire text |
//! | [`RawMessage`] | Outbound | Pre-serialized message text |
//! | [`IncomingMessage`] | Inbound | One framed message read from a connection |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;

use crate::identifiers::ConnectionKey;

// ============================================================================
// Message
// ============================================================================

/// An outbound message the transport can serialize onto the wire.
pub trait Message: Send + Sync {
    /// Full wire text, start line through body.
    fn wire_text(&self) -> String;

    /// One-line human readable summary for logging.
    fn short(&self) -> String;
}

// ============================================================================
// RawMessage
// ============================================================================

/// A message that is already in wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    text: String,
}

impl RawMessage {
    /// Wraps pre-serialized message text.
    #[inline]
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// Returns the message text.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Returns the start line (request or status line).
    #[must_use]
    pub fn start_line(&self) -> &str {
        self.text.lines().next().unwrap_or_default()
    }
}

impl Message for RawMessage {
    fn wire_text(&self) -> String {
        self.text.clone()
    }

    fn short(&self) -> String {
        self.start_line().to_string()
    }
}

impl fmt::Display for RawMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl From<String> for RawMessage {
    fn from(text: String) -> Self {
        Self { text }
    }
}

impl From<&str> for RawMessage {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

// ============================================================================
// IncomingMessage
// ============================================================================

/// A complete message framed from a pooled connection's byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    /// Framed message text (headers and body).
    pub text: String,
    /// Remote peer the message came from.
    pub source: SocketAddr,
    /// Local address it arrived on.
    pub destination: SocketAddr,
    /// Pool key of the connection that carried it.
    pub connection: ConnectionKey,
}

impl IncomingMessage {
    /// Returns the start line (request or status line).
    #[must_use]
    pub fn start_line(&self) -> &str {
        self.text.lines().next().unwrap_or_default()
    }
}

// ============================================================================
// Tests
// ============================================================================
