//! Transport configuration.
//!
//! Provides a type-safe interface for the values the stream transport
//! needs at construction time, replacing process-wide constants.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use sip_stream_transport::TransportOptions;
//!
//! let options = TransportOptions::new()
//!     .with_connection_ttl(Duration::from_secs(600))
//!     .with_refresh_ttl_on_reuse()
//!     .with_serialize_dials();
//!
//! options.validate()?;
//! ```
//!
//! Options can also be loaded from JSON, with durations in seconds:
//!
//! ```json
//! { "connection_ttl": 600, "listen_host": "0.0.0.0", "serialize_dials": true }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Default lifetime of a pooled connection.
pub const DEFAULT_CONNECTION_TTL: Duration = Duration::from_secs(60 * 60);

/// Longest accepted connection lifetime.
pub const MAX_CONNECTION_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Default host a listener binds to when the target omits one.
pub const DEFAULT_LISTEN_HOST: &str = "0.0.0.0";

/// Default upper bound on one framed inbound message.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Default size of one socket read.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

// ============================================================================
// TransportOptions
// ============================================================================

/// Stream transport configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportOptions {
    /// Time-to-live applied to every connection pool insertion.
    #[serde(with = "duration_secs")]
    pub connection_ttl: Duration,

    /// Host used by `listen` when the target has none.
    pub listen_host: String,

    /// Largest inbound message accepted by the framer, in bytes.
    pub max_message_size: usize,

    /// Bytes requested per socket read.
    pub read_buffer_size: usize,

    /// Reset a connection's TTL whenever `send` reuses it.
    pub refresh_ttl_on_reuse: bool,

    /// Remove a connection from the pool after a failed write.
    pub evict_on_write_error: bool,

    /// Serialize lookup, dial and insert per remote address.
    pub serialize_dials: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl TransportOptions {
    /// Creates options with default settings.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            connection_ttl: DEFAULT_CONNECTION_TTL,
            listen_host: DEFAULT_LISTEN_HOST.to_string(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            refresh_ttl_on_reuse: false,
            evict_on_write_error: false,
            serialize_dials: false,
        }
    }

    /// Parses options from a JSON document.
    ///
    /// Missing fields take their defaults. The result is validated.
    ///
    /// # Errors
    ///
    /// - [`Error::Json`] if the document is malformed
    /// - [`Error::Config`] if a value is out of range
    pub fn from_json(json: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl TransportOptions {
    /// Sets the pooled connection time-to-live.
    #[inline]
    #[must_use]
    pub fn with_connection_ttl(mut self, ttl: Duration) -> Self {
        self.connection_ttl = ttl;
        self
    }

    /// Sets the default listen host.
    #[inline]
    #[must_use]
    pub fn with_listen_host(mut self, host: impl Into<String>) -> Self {
        self.listen_host = host.into();
        self
    }

    /// Sets the largest accepted inbound message.
    #[inline]
    #[must_use]
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Sets the socket read size.
    #[inline]
    #[must_use]
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Enables TTL refresh when `send` reuses a pooled connection.
    #[inline]
    #[must_use]
    pub fn with_refresh_ttl_on_reuse(mut self) -> Self {
        self.refresh_ttl_on_reuse = true;
        self
    }

    /// Enables pool eviction after a failed write.
    #[inline]
    #[must_use]
    pub fn with_evict_on_write_error(mut self) -> Self {
        self.evict_on_write_error = true;
        self
    }

    /// Enables per-address dial serialization.
    #[inline]
    #[must_use]
    pub fn with_serialize_dials(mut self) -> Self {
        self.serialize_dials = true;
        self
    }
}

// ============================================================================
// Validation
// ============================================================================

impl TransportOptions {
    /// Checks that every value is usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a zero TTL, a TTL above
    /// [`MAX_CONNECTION_TTL`], zero sizes or an empty listen host.
    pub fn validate(&self) -> Result<()> {
        if self.connection_ttl.is_zero() {
            return Err(Error::config("connection_ttl must be greater than zero"));
        }
        if self.connection_ttl > MAX_CONNECTION_TTL {
            return Err(Error::config(format!(
                "connection_ttl must not exceed {} seconds",
                MAX_CONNECTION_TTL.as_secs()
            )));
        }
        if self.max_message_size == 0 {
            return Err(Error::config("max_message_size must be greater than zero"));
        }
        if self.read_buffer_size == 0 {
            return Err(Error::config("read_buffer_size must be greater than zero"));
        }
        if self.listen_host.trim().is_empty() {
            return Err(Error::config("listen_host must not be empty"));
        }
        Ok(())
    }
}

// ============================================================================
// Serde Helpers
// ============================================================================

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = TransportOptions::new();
        assert_eq!(options.connection_ttl, DEFAULT_CONNECTION_TTL);
        assert_eq!(options.listen_host, "0.0.0.0");
        assert!(!options.refresh_ttl_on_reuse);
        assert!(!options.evict_on_write_error);
        assert!(!options.serialize_dials);
        assert_eq!(options, TransportOptions::default());
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_builder_chain() {
        let options = TransportOptions::new()
            .with_connection_ttl(Duration::from_secs(5))
            .with_listen_host("127.0.0.1")
            .with_refresh_ttl_on_reuse()
            .with_evict_on_write_error()
            .with_serialize_dials();

        assert_eq!(options.connection_ttl, Duration::from_secs(5));
        assert_eq!(options.listen_host, "127.0.0.1");
        assert!(options.refresh_ttl_on_reuse);
        assert!(options.evict_on_write_error);
        assert!(options.serialize_dials);
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let result = TransportOptions::new()
            .with_connection_ttl(Duration::ZERO)
            .validate();
        let err = result.unwrap_err();
        assert!(err.to_string().contains("connection_ttl"));
    }

    #[test]
    fn test_oversized_ttl_rejected() {
        let err = TransportOptions::from_json(r#"{ "connection_ttl": 18446744073709551615 }"#)
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
        assert!(err.to_string().contains("connection_ttl"));

        let at_limit = TransportOptions::new().with_connection_ttl(MAX_CONNECTION_TTL);
        assert!(at_limit.validate().is_ok());
    }

    #[test]
    fn test_from_json_partial() {
        let options =
            TransportOptions::from_json(r#"{ "connection_ttl": 30, "serialize_dials": true }"#)
                .expect("valid json");
        assert_eq!(options.connection_ttl, Duration::from_secs(30));
        assert!(options.serialize_dials);
        assert_eq!(options.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
    }

    #[test]
    fn test_from_json_invalid_value() {
        let err = TransportOptions::from_json(r#"{ "max_message_size": 0 }"#).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));

        let err = TransportOptions::from_json("not json").unwrap_err();
        assert!(matches!(err, Error::Json(_)));
    }
}
