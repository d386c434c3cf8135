//! Type-safe identifiers and pool keys.
//!
//! Newtype wrappers prevent mixing a listener key with a connection key,
//! or a protocol instance id with a connection id.
//!
//! | Type | Format | Used by |
//! |------|--------|---------|
//! | [`ProtocolId`] | UUID v4 | Protocol instance log context |
//! | [`ConnectionId`] | UUID v4 | Connection display form |
//! | [`ListenerKey`] | `0.0.0.0:<port>` | Listener pool |
//! | [`ConnectionKey`] | `<host>:<port>` | Connection pool |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// ProtocolId
// ============================================================================

/// Unique identifier of one protocol (transport adapter) instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtocolId(Uuid);

impl ProtocolId {
    /// Generates a new random protocol ID.
    #[inline]
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[inline]
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// ConnectionId
// ============================================================================

/// Unique identifier of one wrapped stream socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generates a new random connection ID.
    #[inline]
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// ListenerKey
// ============================================================================

/// Listener pool key.
///
/// Always rendered with the wildcard host so listeners are discoverable
/// by port regardless of the interface they were bound on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListenerKey(String);

impl ListenerKey {
    /// Creates the key for a listener bound to `port`.
    #[inline]
    #[must_use]
    pub fn for_port(port: u16) -> Self {
        Self(format!("0.0.0.0:{port}"))
    }

    /// Returns the key as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ListenerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// ConnectionKey
// ============================================================================

/// Connection pool key: the remote peer's `<host>:<port>` string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionKey(String);

impl ConnectionKey {
    /// Creates a key from an already formatted address string.
    #[inline]
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the key as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<SocketAddr> for ConnectionKey {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Tests
// ============================================================================
