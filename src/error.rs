//! Error types for the SIP stream transport.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use sip_stream_transport::{Result, Target};
//!
//! async fn example(protocol: &TcpProtocol, msg: &RawMessage) -> Result<()> {
//!     protocol.send(&Target::new("203.0.113.5", 5060), msg).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Transport | [`Error::InvalidTarget`], [`Error::Resolve`], [`Error::Listen`], [`Error::Dial`] |
//! | Pool | [`Error::ListenerExists`], [`Error::ConnectionExists`], [`Error::ConnectionNotFound`], [`Error::PoolClosed`] |
//! | Stream | [`Error::Framing`], [`Error::Io`] |
//! | Lifecycle | [`Error::AlreadyStarted`], [`Error::Config`] |
//! | External | [`Error::Json`] |
//!
//! Transport errors always carry the attempted operation and the display
//! form of the protocol instance that failed, so they are self-describing
//! when logged.

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;

use crate::identifiers::{ConnectionKey, ListenerKey};

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// Caller-supplied target is missing a required field.
    ///
    /// Returned before any network I/O is attempted.
    #[error("{protocol}: {operation} failed: {message}")]
    InvalidTarget {
        /// What is wrong with the target.
        message: String,
        /// The attempted operation.
        operation: String,
        /// Display form of the protocol instance.
        protocol: String,
    },

    /// Target could not be resolved to a socket address.
    #[error("{protocol}: {operation} failed: {source}")]
    Resolve {
        /// Underlying resolver error.
        #[source]
        source: IoError,
        /// The attempted operation.
        operation: String,
        /// Display form of the protocol instance.
        protocol: String,
    },

    /// Listening socket could not be opened.
    #[error("{protocol}: {operation} failed: {source}")]
    Listen {
        /// Underlying bind error.
        #[source]
        source: IoError,
        /// The attempted operation.
        operation: String,
        /// Display form of the protocol instance.
        protocol: String,
    },

    /// Outbound connection could not be established.
    #[error("{protocol}: {operation} failed: {source}")]
    Dial {
        /// Underlying connect error.
        #[source]
        source: IoError,
        /// The attempted operation.
        operation: String,
        /// Display form of the protocol instance.
        protocol: String,
    },

    // ========================================================================
    // Pool Errors
    // ========================================================================
    /// A listener is already registered under this key.
    #[error("Listener {key} already exists in the pool")]
    ListenerExists {
        /// The duplicate key.
        key: ListenerKey,
    },

    /// A live connection is already registered under this key.
    #[error("Connection {key} already exists in the pool")]
    ConnectionExists {
        /// The duplicate key.
        key: ConnectionKey,
    },

    /// No live connection under this key.
    #[error("Connection {key} not found in the pool")]
    ConnectionNotFound {
        /// The missing key.
        key: ConnectionKey,
    },

    /// The pool was cancelled and accepts no new entries.
    #[error("{pool} pool is closed")]
    PoolClosed {
        /// Which pool rejected the entry.
        pool: &'static str,
    },

    // ========================================================================
    // Stream Errors
    // ========================================================================
    /// Inbound byte stream does not frame into SIP messages.
    #[error("Framing error: {message}")]
    Framing {
        /// Description of the framing violation.
        message: String,
    },

    // ========================================================================
    // Lifecycle Errors
    // ========================================================================
    /// The bridging task was already started.
    #[error("Protocol already started")]
    AlreadyStarted,

    /// Transport options are invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error, including failed writes on an established connection.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates an invalid target error.
    #[inline]
    pub fn invalid_target(
        message: impl Into<String>,
        operation: impl Into<String>,
        protocol: impl Into<String>,
    ) -> Self {
        Self::InvalidTarget {
            message: message.into(),
            operation: operation.into(),
            protocol: protocol.into(),
        }
    }

    /// Creates a resolution error.
    #[inline]
    pub fn resolve(
        source: IoError,
        operation: impl Into<String>,
        protocol: impl Into<String>,
    ) -> Self {
        Self::Resolve {
            source,
            operation: operation.into(),
            protocol: protocol.into(),
        }
    }

    /// Creates a listen error.
    #[inline]
    pub fn listen(
        source: IoError,
        operation: impl Into<String>,
        protocol: impl Into<String>,
    ) -> Self {
        Self::Listen {
            source,
            operation: operation.into(),
            protocol: protocol.into(),
        }
    }

    /// Creates a dial error.
    #[inline]
    pub fn dial(source: IoError, operation: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self::Dial {
            source,
            operation: operation.into(),
            protocol: protocol.into(),
        }
    }

    /// Creates a listener exists error.
    #[inline]
    pub fn listener_exists(key: ListenerKey) -> Self {
        Self::ListenerExists { key }
    }

    /// Creates a connection exists error.
    #[inline]
    pub fn connection_exists(key: ConnectionKey) -> Self {
        Self::ConnectionExists { key }
    }

    /// Creates a connection not found error.
    #[inline]
    pub fn connection_not_found(key: ConnectionKey) -> Self {
        Self::ConnectionNotFound { key }
    }

    /// Creates a pool closed error.
    #[inline]
    pub fn pool_closed(pool: &'static str) -> Self {
        Self::PoolClosed { pool }
    }

    /// Creates a framing error.
    #[inline]
    pub fn framing(message: impl Into<String>) -> Self {
        Self::Framing {
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a wrapped transport error.
    ///
    /// Transport errors carry the operation and protocol identity.
    #[inline]
    #[must_use]
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidTarget { .. }
                | Self::Resolve { .. }
                | Self::Listen { .. }
                | Self::Dial { .. }
        )
    }

    /// Returns `true` if a pool rejected the operation.
    #[inline]
    #[must_use]
    pub fn is_pool_error(&self) -> bool {
        matches!(
            self,
            Self::ListenerExists { .. }
                | Self::ConnectionExists { .. }
                | Self::ConnectionNotFound { .. }
                | Self::PoolClosed { .. }
        )
    }

    /// Returns `true` if the caller-supplied target was invalid.
    #[inline]
    #[must_use]
    pub fn is_validation_error(&self) -> bool {
        matches!(self, Self::InvalidTarget { .. })
    }

    /// Returns the attempted operation and protocol identity of a transport error.
    #[must_use]
    pub fn protocol_info(&self) -> Option<(&str, &str)> {
        match self {
            Self::InvalidTarget {
                operation, protocol, ..
            }
            | Self::Resolve {
                operation, protocol, ..
            }
            | Self::Listen {
                operation, protocol, ..
            }
            | Self::Dial {
                operation, protocol, ..
            } => Some((operation, protocol)),
            _ => None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
