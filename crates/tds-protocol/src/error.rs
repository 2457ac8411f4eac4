//! Protocol error types.

use thiserror::Error;

/// Errors produced while encoding or decoding TDS wire structures.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    /// The byte stream violates the TDS framing rules and cannot be trusted.
    #[error("corrupted TDS stream: {reason}")]
    CorruptedStream {
        /// What was malformed.
        reason: &'static str,
    },

    /// Unknown packet type byte in a packet header.
    #[error("invalid packet type: 0x{0:02X}")]
    InvalidPacketType(u8),

    /// Unknown status bits in a packet header.
    #[error("invalid packet status: 0x{0:02X}")]
    InvalidPacketStatus(u8),

    /// Not enough bytes to decode the structure.
    #[error("incomplete data: expected {expected} bytes, got {actual}")]
    IncompletePacket {
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Unknown token type byte in a token stream.
    #[error("invalid token type: 0x{0:02X}")]
    InvalidToken(u8),

    /// A UTF-16 string field contained an unpaired surrogate.
    #[error("invalid UTF-16 data in {field}")]
    InvalidUtf16 {
        /// The field being decoded.
        field: &'static str,
    },
}
