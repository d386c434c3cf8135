//! SIP message framing for byte streams.
//!
//! TCP does not preserve message boundaries. [`StreamFramer`] is a
//! [`Decoder`] that cuts a connection's inbound bytes into complete
//! messages, for use with [`FramedRead`](tokio_util::codec::FramedRead):
//!
//! 1. Leading CRLFs are keep-alive pings and are skipped
//! 2. The header section ends at the first empty line (`CRLF CRLF`)
//! 3. The body is `Content-Length` bytes (compact form `l`), default 0

// ============================================================================
// Imports
// ============================================================================

use std::sync::LazyLock;

use bytes::{Buf, BytesMut};
use regex::Regex;
use tokio_util::codec::Decoder;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// End of the header section.
const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Keep-alive ping between messages.
const KEEP_ALIVE: &[u8] = b"\r\n";

/// Matches a `Content-Length` header line, long or compact form.
static CONTENT_LENGTH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^(?:content-length|l)[ \t]*:[ \t]*([^\r\n]*?)[ \t]*\r?$")
        .expect("content-length pattern is valid")
});

// ============================================================================
// StreamFramer
// ============================================================================

/// Incremental SIP decoder for one connection's inbound stream.
///
/// Any error leaves the decoder unusable; the caller drops the stream.
#[derive(Debug, Clone)]
pub struct StreamFramer {
    max_message_size: usize,
    /// Bytes of the current header section already searched for its end.
    scanned: usize,
    /// Full length of the current message once its headers are parsed.
    pending: Option<usize>,
}

impl StreamFramer {
    /// Creates a decoder rejecting messages above `max_message_size` bytes.
    #[must_use]
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            scanned: 0,
            pending: None,
        }
    }

    /// Returns the size limit.
    #[inline]
    #[must_use]
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Length of the message at the head of `src`, once its headers are complete.
    fn message_len(&mut self, src: &[u8]) -> Result<Option<usize>> {
        if let Some(total) = self.pending {
            return Ok(Some(total));
        }

        // Resume the search where the previous call stopped, minus a
        // partially received terminator.
        let from = self.scanned.saturating_sub(HEADER_TERMINATOR.len() - 1);
        let Some(found) = find(&src[from..], HEADER_TERMINATOR) else {
            self.scanned = src.len();
            if src.len() > self.max_message_size {
                return Err(Error::framing(format!(
                    "header section exceeds {} bytes",
                    self.max_message_size
                )));
            }
            return Ok(None);
        };

        let header_len = from + found;
        let headers = std::str::from_utf8(&src[..header_len])
            .map_err(|_| Error::framing("header section is not valid UTF-8"))?;
        let body_len = content_length(headers)?;

        let total = header_len
            .checked_add(HEADER_TERMINATOR.len() + body_len)
            .filter(|total| *total <= self.max_message_size)
            .ok_or_else(|| {
                Error::framing(format!(
                    "message of {header_len} header bytes and {body_len} body bytes exceeds {} bytes",
                    self.max_message_size
                ))
            })?;

        self.pending = Some(total);
        Ok(Some(total))
    }
}

impl Decoder for StreamFramer {
    type Item = String;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>> {
        if self.pending.is_none() {
            // A header section never starts with CRLF, so these are pings.
            while src.starts_with(KEEP_ALIVE) {
                src.advance(KEEP_ALIVE.len());
                self.scanned = self.scanned.saturating_sub(KEEP_ALIVE.len());
            }
        }
        if src.is_empty() {
            return Ok(None);
        }

        let Some(total) = self.message_len(src)? else {
            return Ok(None);
        };
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        self.scanned = 0;
        self.pending = None;

        let raw = src.split_to(total);
        String::from_utf8(raw.to_vec())
            .map(Some)
            .map_err(|_| Error::framing("message body is not valid UTF-8"))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>> {
        match self.decode(src)? {
            Some(message) => Ok(Some(message)),
            None if src.iter().all(|&byte| byte == b'\r' || byte == b'\n') => Ok(None),
            None => Err(Error::framing(format!(
                "stream ended inside a message ({} bytes buffered)",
                src.len()
            ))),
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn content_length(headers: &str) -> Result<usize> {
    match CONTENT_LENGTH.captures(headers) {
        Some(caps) => {
            let value = caps.get(1).map_or("", |m| m.as_str());
            value
                .parse()
                .map_err(|_| Error::framing(format!("invalid Content-Length: {value:?}")))
        }
        None => Ok(0),
    }
}

// ============================================================================
// Tests
// ============================================================================
