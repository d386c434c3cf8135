//! Transport networks and caller-supplied targets.
//!
//! A [`Target`] may omit its host and/or port. Before use the transport
//! completes it with the network's well-known port and, when listening,
//! with the configured listen host.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// Constants
// ============================================================================

/// Well-known SIP port for TCP and UDP.
pub const DEFAULT_SIP_PORT: u16 = 5060;

/// Well-known SIP port for TLS.
pub const DEFAULT_SIPS_PORT: u16 = 5061;

// ============================================================================
// Network
// ============================================================================

/// Network substrate a protocol runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Stream-oriented TCP.
    Tcp,
    /// Datagram-oriented UDP.
    Udp,
    /// TCP with TLS.
    Tls,
}

impl Network {
    /// Lowercase network tag.
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Tls => "tls",
        }
    }

    /// Well-known port for SIP over this network.
    #[inline]
    #[must_use]
    pub const fn default_port(self) -> u16 {
        match self {
            Self::Tcp | Self::Udp => DEFAULT_SIP_PORT,
            Self::Tls => DEFAULT_SIPS_PORT,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Target
// ============================================================================

/// A desired endpoint, possibly incomplete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    /// Host name or IP literal; empty when unspecified.
    pub host: String,
    /// Port; `None` when unspecified.
    pub port: Option<u16>,
}

impl Target {
    /// Creates a fully specified target.
    #[inline]
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port: Some(port),
        }
    }

    /// Creates a target with only a host.
    #[inline]
    #[must_use]
    pub fn host(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
        }
    }

    /// Creates a target with only a port.
    #[inline]
    #[must_use]
    pub fn port(port: u16) -> Self {
        Self {
            host: String::new(),
            port: Some(port),
        }
    }

    /// Fills a missing port with the network's well-known port.
    #[must_use]
    pub fn with_default_port(mut self, network: Network) -> Self {
        if self.port.is_none() {
            self.port = Some(network.default_port());
        }
        self
    }

    /// Fills a blank host with `host`.
    #[must_use]
    pub fn with_default_host(mut self, host: &str) -> Self {
        if self.host.trim().is_empty() {
            self.host = host.to_string();
        }
        self
    }

    /// Returns `true` if the host is blank.
    #[inline]
    #[must_use]
    pub fn has_host(&self) -> bool {
        !self.host.trim().is_empty()
    }

    /// Renders `host:port` in a form the resolver accepts.
    ///
    /// IPv6 literals are bracketed. A missing port renders as `0`.
    #[must_use]
    pub fn addr(&self) -> String {
        let port = self.port.unwrap_or(0);
        let host = self.host.trim();
        if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{port}", self.host),
            None => f.write_str(&self.host),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
