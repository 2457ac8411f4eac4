//! TDS token stream definitions.
//!
//! Tokens are the fundamental units of TDS response data. This module
//! defines the subset the session core consumes directly: completion
//! tokens, environment changes, server errors and warnings, and the login
//! acknowledgment. Row-bearing tokens are identified by type so they can be
//! handed to the token parser layered above the session, but their payloads
//! are not decoded here.

use bytes::{Buf, BufMut, Bytes};

use crate::error::ProtocolError;

// Token string fields come in two shapes: B_VARCHAR (1-byte character
// count) and US_VARCHAR (2-byte count), both followed by UTF-16LE data.

fn read_b_varchar(src: &mut impl Buf) -> Option<String> {
    if !src.has_remaining() {
        return None;
    }
    let chars = src.get_u8() as usize;
    take_utf16(src, chars)
}

fn read_us_varchar(src: &mut impl Buf) -> Option<String> {
    if src.remaining() < 2 {
        return None;
    }
    let chars = src.get_u16_le() as usize;
    take_utf16(src, chars)
}

fn take_utf16(src: &mut impl Buf, chars: usize) -> Option<String> {
    if src.remaining() < chars * 2 {
        return None;
    }
    let units: Vec<u16> = (0..chars).map(|_| src.get_u16_le()).collect();
    char::decode_utf16(units).collect::<Result<String, _>>().ok()
}

fn write_b_varchar(dst: &mut impl BufMut, value: &str) {
    let chars = value.encode_utf16().count().min(255);
    dst.put_u8(chars as u8);
    for unit in value.encode_utf16().take(chars) {
        dst.put_u16_le(unit);
    }
}

fn write_us_varchar(dst: &mut impl BufMut, value: &str) {
    let chars = value.encode_utf16().count().min(65535);
    dst.put_u16_le(chars as u16);
    for unit in value.encode_utf16().take(chars) {
        dst.put_u16_le(unit);
    }
}

/// Token type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TokenType {
    /// Column metadata (COLMETADATA).
    ColMetaData = 0x81,
    /// Error message (ERROR).
    Error = 0xAA,
    /// Informational message (INFO).
    Info = 0xAB,
    /// Login acknowledgment (LOGINACK).
    LoginAck = 0xAD,
    /// Row data (ROW).
    Row = 0xD1,
    /// Null bitmap compressed row (NBCROW).
    NbcRow = 0xD2,
    /// Environment change (ENVCHANGE).
    EnvChange = 0xE3,
    /// Done (DONE).
    Done = 0xFD,
    /// Done in procedure (DONEINPROC).
    DoneInProc = 0xFF,
    /// Done procedure (DONEPROC).
    DoneProc = 0xFE,
    /// Return status (RETURNSTATUS).
    ReturnStatus = 0x79,
    /// Column ordering (ORDER).
    Order = 0xA9,
    /// Session state (SESSIONSTATE).
    SessionState = 0xE4,
}

impl TokenType {
    /// Create a token type from a raw byte.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x81 => Some(Self::ColMetaData),
            0xAA => Some(Self::Error),
            0xAB => Some(Self::Info),
            0xAD => Some(Self::LoginAck),
            0xD1 => Some(Self::Row),
            0xD2 => Some(Self::NbcRow),
            0xE3 => Some(Self::EnvChange),
            0xFD => Some(Self::Done),
            0xFF => Some(Self::DoneInProc),
            0xFE => Some(Self::DoneProc),
            0x79 => Some(Self::ReturnStatus),
            0xA9 => Some(Self::Order),
            0xE4 => Some(Self::SessionState),
            _ => None,
        }
    }

    /// Whether the token body is prefixed with a 2-byte little-endian length.
    #[must_use]
    pub const fn is_length_prefixed(self) -> bool {
        matches!(
            self,
            Self::Error
                | Self::Info
                | Self::LoginAck
                | Self::EnvChange
                | Self::Order
                | Self::SessionState
        )
    }
}

/// Done token status flags bit positions.
mod done_status_bits {
    pub const DONE_MORE: u16 = 0x0001;
    pub const DONE_ERROR: u16 = 0x0002;
    pub const DONE_INXACT: u16 = 0x0004;
    pub const DONE_COUNT: u16 = 0x0010;
    pub const DONE_ATTN: u16 = 0x0020;
    pub const DONE_SRVERROR: u16 = 0x0100;
}

/// Done status flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DoneStatus {
    /// More results follow.
    pub more: bool,
    /// Error occurred.
    pub error: bool,
    /// Transaction in progress.
    pub in_xact: bool,
    /// Row count is valid.
    pub count: bool,
    /// Attention acknowledgment.
    pub attn: bool,
    /// Server error caused statement termination.
    pub srverror: bool,
}

impl DoneStatus {
    /// Parse done status from raw bits.
    #[must_use]
    pub fn from_bits(bits: u16) -> Self {
        use done_status_bits::*;
        Self {
            more: (bits & DONE_MORE) != 0,
            error: (bits & DONE_ERROR) != 0,
            in_xact: (bits & DONE_INXACT) != 0,
            count: (bits & DONE_COUNT) != 0,
            attn: (bits & DONE_ATTN) != 0,
            srverror: (bits & DONE_SRVERROR) != 0,
        }
    }

    /// Convert to raw bits.
    #[must_use]
    pub fn to_bits(&self) -> u16 {
        use done_status_bits::*;
        let mut bits = 0u16;
        if self.more {
            bits |= DONE_MORE;
        }
        if self.error {
            bits |= DONE_ERROR;
        }
        if self.in_xact {
            bits |= DONE_INXACT;
        }
        if self.count {
            bits |= DONE_COUNT;
        }
        if self.attn {
            bits |= DONE_ATTN;
        }
        if self.srverror {
            bits |= DONE_SRVERROR;
        }
        bits
    }
}

/// Done token indicating statement completion.
///
/// DONEPROC and DONEINPROC share the same layout; the session treats all
/// three identically apart from the token type byte.
#[derive(Debug, Clone, Copy)]
pub struct Done {
    /// Status flags.
    pub status: DoneStatus,
    /// Current command.
    pub cur_cmd: u16,
    /// Row count (if `status.count`).
    pub row_count: u64,
}

impl Done {
    /// Size of the DONE token in bytes (excluding the token type byte).
    pub const SIZE: usize = 12; // 2 (status) + 2 (curcmd) + 8 (rowcount)

    /// Decode a DONE token from bytes.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        if src.remaining() < Self::SIZE {
            return Err(ProtocolError::IncompletePacket {
                expected: Self::SIZE,
                actual: src.remaining(),
            });
        }

        let status = DoneStatus::from_bits(src.get_u16_le());
        let cur_cmd = src.get_u16_le();
        let row_count = src.get_u64_le();

        Ok(Self {
            status,
            cur_cmd,
            row_count,
        })
    }

    /// Encode the DONE token, including the token type byte.
    pub fn encode(&self, token_type: TokenType, dst: &mut impl BufMut) {
        dst.put_u8(token_type as u8);
        dst.put_u16_le(self.status.to_bits());
        dst.put_u16_le(self.cur_cmd);
        dst.put_u64_le(self.row_count);
    }

    /// Check if more results follow this DONE token.
    #[must_use]
    pub const fn has_more(&self) -> bool {
        self.status.more
    }

    /// Check if this DONE acknowledges an attention request.
    #[must_use]
    pub const fn is_attention_ack(&self) -> bool {
        self.status.attn
    }
}

/// Environment change type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EnvChangeType {
    /// Database changed.
    Database = 1,
    /// Language changed.
    Language = 2,
    /// Character set changed.
    CharacterSet = 3,
    /// Packet size changed.
    PacketSize = 4,
    /// SQL collation.
    SqlCollation = 7,
    /// Begin transaction.
    BeginTransaction = 8,
    /// Commit transaction.
    CommitTransaction = 9,
    /// Rollback transaction.
    RollbackTransaction = 10,
    /// Enlist DTC transaction.
    EnlistDtcTransaction = 11,
    /// Defect DTC transaction.
    DefectTransaction = 12,
    /// Promote transaction.
    PromoteTransaction = 15,
    /// Transaction manager address.
    TransactionManagerAddress = 16,
    /// Transaction ended.
    TransactionEnded = 17,
    /// Reset connection completion acknowledgment.
    ResetConnectionCompletionAck = 18,
}

impl EnvChangeType {
    /// Create an environment change type from a raw byte.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Database),
            2 => Some(Self::Language),
            3 => Some(Self::CharacterSet),
            4 => Some(Self::PacketSize),
            7 => Some(Self::SqlCollation),
            8 => Some(Self::BeginTransaction),
            9 => Some(Self::CommitTransaction),
            10 => Some(Self::RollbackTransaction),
            11 => Some(Self::EnlistDtcTransaction),
            12 => Some(Self::DefectTransaction),
            15 => Some(Self::PromoteTransaction),
            16 => Some(Self::TransactionManagerAddress),
            17 => Some(Self::TransactionEnded),
            18 => Some(Self::ResetConnectionCompletionAck),
            _ => None,
        }
    }

    /// Whether the old/new values are binary (transaction descriptors)
    /// rather than strings.
    #[must_use]
    pub const fn has_binary_values(self) -> bool {
        matches!(
            self,
            Self::BeginTransaction
                | Self::CommitTransaction
                | Self::RollbackTransaction
                | Self::EnlistDtcTransaction
                | Self::DefectTransaction
                | Self::PromoteTransaction
                | Self::TransactionEnded
        )
    }

    /// Whether this change drives the transaction state machine.
    #[must_use]
    pub const fn is_transaction_change(self) -> bool {
        self.has_binary_values()
    }
}

/// Environment change value.
#[derive(Debug, Clone)]
pub enum EnvChangeValue {
    /// String value.
    String(String),
    /// Binary value (transaction descriptor bytes).
    Binary(Bytes),
}

impl EnvChangeValue {
    /// Interpret a binary value as a little-endian u64 transaction
    /// descriptor. Empty values decode as 0 (no transaction).
    #[must_use]
    pub fn as_descriptor(&self) -> Option<u64> {
        match self {
            Self::Binary(bytes) if bytes.is_empty() => Some(0),
            Self::Binary(bytes) if bytes.len() >= 8 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes[..8]);
                Some(u64::from_le_bytes(raw))
            }
            _ => None,
        }
    }
}

/// Environment change token.
#[derive(Debug, Clone)]
pub struct EnvChange {
    /// Type of environment change.
    pub env_type: EnvChangeType,
    /// New value.
    pub new_value: EnvChangeValue,
    /// Old value.
    pub old_value: EnvChangeValue,
}

impl EnvChange {
    /// Decode an environment change token body (after the 2-byte length).
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        if src.remaining() < 1 {
            return Err(ProtocolError::IncompletePacket {
                expected: 1,
                actual: 0,
            });
        }
        let env_type_byte = src.get_u8();
        let env_type = EnvChangeType::from_u8(env_type_byte)
            .ok_or(ProtocolError::InvalidToken(env_type_byte))?;

        let (new_value, old_value) = if env_type.has_binary_values() {
            (Self::decode_binary(src)?, Self::decode_binary(src)?)
        } else {
            let new_value = read_b_varchar(src)
                .map(EnvChangeValue::String)
                .unwrap_or(EnvChangeValue::String(String::new()));
            let old_value = read_b_varchar(src)
                .map(EnvChangeValue::String)
                .unwrap_or(EnvChangeValue::String(String::new()));
            (new_value, old_value)
        };

        Ok(Self {
            env_type,
            new_value,
            old_value,
        })
    }

    fn decode_binary(src: &mut impl Buf) -> Result<EnvChangeValue, ProtocolError> {
        if src.remaining() < 1 {
            return Ok(EnvChangeValue::Binary(Bytes::new()));
        }
        let len = src.get_u8() as usize;
        if src.remaining() < len {
            return Err(ProtocolError::IncompletePacket {
                expected: len,
                actual: src.remaining(),
            });
        }
        Ok(EnvChangeValue::Binary(src.copy_to_bytes(len)))
    }

    /// Encode the token including type byte and 2-byte length prefix.
    pub fn encode(&self, dst: &mut impl BufMut) {
        let mut body = bytes::BytesMut::new();
        body.put_u8(self.env_type as u8);
        for value in [&self.new_value, &self.old_value] {
            match value {
                EnvChangeValue::Binary(bytes) => {
                    body.put_u8(bytes.len() as u8);
                    body.put_slice(bytes);
                }
                EnvChangeValue::String(s) => write_b_varchar(&mut body, s),
            }
        }
        dst.put_u8(TokenType::EnvChange as u8);
        dst.put_u16_le(body.len() as u16);
        dst.put_slice(&body);
    }

    /// The transaction descriptor announced by this change, if any.
    #[must_use]
    pub fn transaction_descriptor(&self) -> Option<u64> {
        if self.env_type.is_transaction_change() {
            self.new_value.as_descriptor()
        } else {
            None
        }
    }

    /// The negotiated packet size, if this is a packet size change.
    #[must_use]
    pub fn packet_size(&self) -> Option<u32> {
        if self.env_type == EnvChangeType::PacketSize {
            if let EnvChangeValue::String(s) = &self.new_value {
                return s.parse().ok();
            }
        }
        None
    }
}

/// Server error token (ERROR, 0xAA) or info token (INFO, 0xAB) payload.
///
/// Both share the layout; only the severity interpretation differs.
#[derive(Debug, Clone)]
pub struct ServerMessage {
    /// Error number.
    pub number: i32,
    /// Error state.
    pub state: u8,
    /// Error class/severity (0-25; >= 20 breaks the session).
    pub class: u8,
    /// Error message text.
    pub message: String,
    /// Server name where the message originated.
    pub server: String,
    /// Stored procedure name (if applicable).
    pub procedure: String,
    /// Line number in the SQL batch or procedure.
    pub line: u32,
}

/// Server error class at or above which the session is considered broken.
pub const FATAL_ERROR_CLASS: u8 = 20;

impl ServerMessage {
    /// Decode an ERROR or INFO token body (after the 2-byte length).
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        if src.remaining() < 6 {
            return Err(ProtocolError::IncompletePacket {
                expected: 6,
                actual: src.remaining(),
            });
        }
        let number = src.get_i32_le();
        let state = src.get_u8();
        let class = src.get_u8();
        let message = read_us_varchar(src).ok_or(ProtocolError::InvalidUtf16 {
            field: "error message",
        })?;
        let server = read_b_varchar(src).ok_or(ProtocolError::InvalidUtf16 {
            field: "server name",
        })?;
        let procedure = read_b_varchar(src).ok_or(ProtocolError::InvalidUtf16 {
            field: "procedure name",
        })?;
        if src.remaining() < 4 {
            return Err(ProtocolError::IncompletePacket {
                expected: 4,
                actual: src.remaining(),
            });
        }
        let line = src.get_u32_le();

        Ok(Self {
            number,
            state,
            class,
            message,
            server,
            procedure,
            line,
        })
    }

    /// Encode the token including type byte and 2-byte length prefix.
    pub fn encode(&self, token_type: TokenType, dst: &mut impl BufMut) {
        let mut body = bytes::BytesMut::new();
        body.put_i32_le(self.number);
        body.put_u8(self.state);
        body.put_u8(self.class);
        write_us_varchar(&mut body, &self.message);
        write_b_varchar(&mut body, &self.server);
        write_b_varchar(&mut body, &self.procedure);
        body.put_u32_le(self.line);

        dst.put_u8(token_type as u8);
        dst.put_u16_le(body.len() as u16);
        dst.put_slice(&body);
    }

    /// Whether this message is severe enough to break the session.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        self.class >= FATAL_ERROR_CLASS
    }
}

/// Login acknowledgment token.
#[derive(Debug, Clone)]
pub struct LoginAck {
    /// Interface type.
    pub interface: u8,
    /// TDS version agreed by the server.
    pub tds_version: u32,
    /// Server program name.
    pub prog_name: String,
    /// Server program version.
    pub prog_version: u32,
}

impl LoginAck {
    /// Decode a LOGINACK token body (after the 2-byte length).
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        if src.remaining() < 5 {
            return Err(ProtocolError::IncompletePacket {
                expected: 5,
                actual: src.remaining(),
            });
        }
        let interface = src.get_u8();
        let tds_version = src.get_u32();
        let prog_name = read_b_varchar(src).ok_or(ProtocolError::InvalidUtf16 {
            field: "program name",
        })?;
        if src.remaining() < 4 {
            return Err(ProtocolError::IncompletePacket {
                expected: 4,
                actual: src.remaining(),
            });
        }
        let prog_version = src.get_u32();

        Ok(Self {
            interface,
            tds_version,
            prog_name,
            prog_version,
        })
    }

    /// Encode the token including type byte and 2-byte length prefix.
    pub fn encode(&self, dst: &mut impl BufMut) {
        let mut body = bytes::BytesMut::new();
        body.put_u8(self.interface);
        body.put_u32(self.tds_version);
        write_b_varchar(&mut body, &self.prog_name);
        body.put_u32(self.prog_version);

        dst.put_u8(TokenType::LoginAck as u8);
        dst.put_u16_le(body.len() as u16);
        dst.put_slice(&body);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_done_roundtrip() {
        let done = Done {
            status: DoneStatus {
                count: true,
                attn: true,
                ..DoneStatus::default()
            },
            cur_cmd: 0xC1,
            row_count: 1_000_000,
        };

        let mut buf = BytesMut::new();
        done.encode(TokenType::Done, &mut buf);
        assert_eq!(buf[0], 0xFD);

        let mut cursor = &buf[1..];
        let decoded = Done::decode(&mut cursor).unwrap();
        assert_eq!(decoded.status, done.status);
        assert_eq!(decoded.cur_cmd, 0xC1);
        assert_eq!(decoded.row_count, 1_000_000);
        assert!(decoded.is_attention_ack());
    }

    #[test]
    fn test_env_change_begin_transaction() {
        let env = EnvChange {
            env_type: EnvChangeType::BeginTransaction,
            new_value: EnvChangeValue::Binary(Bytes::from_static(&[
                0xAB, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            ])),
            old_value: EnvChangeValue::Binary(Bytes::new()),
        };

        let mut buf = BytesMut::new();
        env.encode(&mut buf);
        assert_eq!(buf[0], TokenType::EnvChange as u8);

        let len = u16::from_le_bytes([buf[1], buf[2]]) as usize;
        let mut cursor = &buf[3..3 + len];
        let decoded = EnvChange::decode(&mut cursor).unwrap();
        assert_eq!(decoded.env_type, EnvChangeType::BeginTransaction);
        assert_eq!(decoded.transaction_descriptor(), Some(0xAB));
    }

    #[test]
    fn test_env_change_packet_size() {
        let env = EnvChange {
            env_type: EnvChangeType::PacketSize,
            new_value: EnvChangeValue::String("4096".into()),
            old_value: EnvChangeValue::String("4096".into()),
        };
        assert_eq!(env.packet_size(), Some(4096));
        assert_eq!(env.transaction_descriptor(), None);
    }

    #[test]
    fn test_server_message_roundtrip() {
        let msg = ServerMessage {
            number: 1205,
            state: 51,
            class: 13,
            message: "Transaction was deadlocked".into(),
            server: "testserver".into(),
            procedure: String::new(),
            line: 4,
        };

        let mut buf = BytesMut::new();
        msg.encode(TokenType::Error, &mut buf);
        let len = u16::from_le_bytes([buf[1], buf[2]]) as usize;
        let mut cursor = &buf[3..3 + len];
        let decoded = ServerMessage::decode(&mut cursor).unwrap();
        assert_eq!(decoded.number, 1205);
        assert_eq!(decoded.class, 13);
        assert!(!decoded.is_fatal());
        assert_eq!(decoded.message, "Transaction was deadlocked");
    }

    #[test]
    fn test_fatal_class_threshold() {
        let mut msg = ServerMessage {
            number: 0,
            state: 0,
            class: 19,
            message: String::new(),
            server: String::new(),
            procedure: String::new(),
            line: 0,
        };
        assert!(!msg.is_fatal());
        msg.class = 20;
        assert!(msg.is_fatal());
    }

    #[test]
    fn test_login_ack_roundtrip() {
        let ack = LoginAck {
            interface: 1,
            tds_version: 0x7400_0004,
            prog_name: "Microsoft SQL Server".into(),
            prog_version: 0x1000_0000,
        };

        let mut buf = BytesMut::new();
        ack.encode(&mut buf);
        let len = u16::from_le_bytes([buf[1], buf[2]]) as usize;
        let mut cursor = &buf[3..3 + len];
        let decoded = LoginAck::decode(&mut cursor).unwrap();
        assert_eq!(decoded.prog_name, "Microsoft SQL Server");
        assert_eq!(decoded.tds_version, 0x7400_0004);
    }

    #[test]
    fn test_varchar_fields_roundtrip_unicode() {
        let mut buf = BytesMut::new();
        write_b_varchar(&mut buf, "sp_执行");
        write_us_varchar(&mut buf, "Die Transaktion wurde zurückgesetzt");

        let mut cursor = &buf[..];
        assert_eq!(read_b_varchar(&mut cursor).unwrap(), "sp_执行");
        assert_eq!(
            read_us_varchar(&mut cursor).unwrap(),
            "Die Transaktion wurde zurückgesetzt"
        );
        assert!(!cursor.has_remaining());
    }

    #[test]
    fn test_varchar_short_input_is_none() {
        // Declared five characters, only two units of data present.
        let mut buf = BytesMut::new();
        buf.put_u8(5);
        buf.put_u16_le(b'a'.into());
        buf.put_u16_le(b'b'.into());

        let mut cursor = &buf[..];
        assert!(read_b_varchar(&mut cursor).is_none());
    }

    #[test]
    fn test_token_type_from_u8() {
        assert_eq!(TokenType::from_u8(0xFD), Some(TokenType::Done));
        assert_eq!(TokenType::from_u8(0xE3), Some(TokenType::EnvChange));
        assert_eq!(TokenType::from_u8(0x00), None);
        assert!(TokenType::EnvChange.is_length_prefixed());
        assert!(!TokenType::Done.is_length_prefixed());
    }
}
