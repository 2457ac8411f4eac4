//! Session error types.

use std::sync::Arc;

use thiserror::Error;

use mssql_codec::CodecError;
use tds_protocol::{ProtocolError, ServerMessage};

/// Error number recorded when a command timeout expires, matching the
/// native wait-timeout constant.
pub const TIMEOUT_EXPIRED_NUMBER: i32 = -2;

/// Convenient result alias for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors surfaced by the session core.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// The response byte stream violates the protocol. Fatal to the session.
    #[error("corrupted TDS stream: {reason}")]
    CorruptedStream {
        /// What was malformed.
        reason: &'static str,
    },

    /// Transport I/O failure (wrapped in `Arc` for `Clone` support).
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    /// The command timeout expired.
    #[error("timeout expired")]
    Timeout,

    /// The operation was cancelled by the user.
    #[error("operation cancelled")]
    Cancelled,

    /// The server reported an error.
    #[error("server error {}: {}", .0.number, .0.message)]
    Server(ServerMessage),

    /// A result set was closed more times than it was opened.
    #[error("open result count underflow")]
    OpenResultCountExceeded,

    /// The requested packet size is outside the negotiable range.
    #[error("invalid packet size: {0}")]
    InvalidPacketSize(u32),

    /// A transaction or savepoint name was null or empty.
    #[error("transaction name must not be null or empty")]
    NullEmptyTransactionName,

    /// The transaction has completed; only the legacy partial-zombie
    /// rollback is permitted.
    #[error("transaction has completed and is no longer usable")]
    TransactionZombied,

    /// More secrets were staged than the write pipeline supports, or a
    /// secret does not fit in a single packet.
    #[error("secret staging limit exceeded")]
    SecretOverflow,

    /// The session is broken and must be discarded.
    #[error("session is broken")]
    Broken,

    /// The session has been closed.
    #[error("session is closed")]
    Closed,

    /// Framing-layer error.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Protocol decode error.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl SessionError {
    /// Whether this error breaks the session.
    ///
    /// Fatal errors set the session to Broken before surfacing; timeouts
    /// and cancellations leave the session recoverable (the attention dance
    /// decides whether a timed-out session survives).
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::CorruptedStream { .. } | Self::Io(_) | Self::Broken | Self::Closed => true,
            Self::Server(msg) => msg.is_fatal(),
            Self::Protocol(_) => true,
            Self::Codec(err) => !err.is_wait_timeout(),
            Self::Timeout
            | Self::Cancelled
            | Self::OpenResultCountExceeded
            | Self::InvalidPacketSize(_)
            | Self::NullEmptyTransactionName
            | Self::TransactionZombied
            | Self::SecretOverflow => false,
        }
    }
}

/// Build the synthetic error record enqueued when a timeout expires.
#[must_use]
pub fn timeout_expired_message() -> ServerMessage {
    ServerMessage {
        number: TIMEOUT_EXPIRED_NUMBER,
        state: 0,
        class: 11,
        message: "Timeout expired. The timeout period elapsed prior to completion of the \
                  operation or the server is not responding."
            .into(),
        server: String::new(),
        procedure: String::new(),
        line: 0,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality_classification() {
        assert!(
            SessionError::CorruptedStream {
                reason: "bad header"
            }
            .is_fatal()
        );
        assert!(SessionError::Broken.is_fatal());
        assert!(!SessionError::Timeout.is_fatal());
        assert!(!SessionError::Cancelled.is_fatal());
        assert!(!SessionError::TransactionZombied.is_fatal());

        // Wait-timeout is the one recoverable codec error class.
        assert!(!SessionError::Codec(CodecError::WaitTimeout).is_fatal());
        assert!(SessionError::Codec(CodecError::ConnectionClosed).is_fatal());
    }

    #[test]
    fn test_server_error_fatality_follows_class() {
        let mut msg = timeout_expired_message();
        assert!(!SessionError::Server(msg.clone()).is_fatal());
        msg.class = 20;
        assert!(SessionError::Server(msg).is_fatal());
    }

    #[test]
    fn test_timeout_message_carries_native_number() {
        let msg = timeout_expired_message();
        assert_eq!(msg.number, TIMEOUT_EXPIRED_NUMBER);
        assert!(msg.message.contains("Timeout expired"));
    }
}
