//! Codec error types.

use std::sync::Arc;

use thiserror::Error;

use tds_protocol::ProtocolError;

/// Errors that can occur in the framing layer.
#[derive(Debug, Clone, Error)]
pub enum CodecError {
    /// The packet header was malformed.
    #[error("invalid packet header")]
    InvalidHeader,

    /// The declared packet length exceeds the negotiated maximum.
    #[error("packet too large: {size} bytes (max {max})")]
    PacketTooLarge {
        /// Declared total size.
        size: usize,
        /// Negotiated maximum.
        max: usize,
    },

    /// The transport closed mid-packet.
    #[error("connection closed")]
    ConnectionClosed,

    /// A read deadline elapsed while waiting for a packet.
    ///
    /// This is the recoverable wait-timeout class: the session may send an
    /// attention and keep the connection, unlike other I/O failures.
    #[error("timed out waiting for packet")]
    WaitTimeout,

    /// Protocol-level decode failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Transport I/O error (wrapped in `Arc` for `Clone` support).
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for CodecError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl CodecError {
    /// Whether this error is recoverable via the attention dance.
    #[must_use]
    pub const fn is_wait_timeout(&self) -> bool {
        matches!(self, Self::WaitTimeout)
    }
}
