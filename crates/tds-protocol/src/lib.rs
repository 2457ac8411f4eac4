//! # tds-protocol
//!
//! Pure wire definitions for the MS-TDS (Tabular Data Stream) protocol
//! spoken to Microsoft SQL Server.
//!
//! This crate is intentionally IO-agnostic. It contains no networking logic
//! and makes no assumptions about the async runtime: packet headers, the
//! token subset consumed by the session core, PLP stream constants, and
//! request payload encoding are all pure functions over byte buffers.
//! Higher-level crates build upon this foundation to provide framing and
//! session state.
//!
//! ## Example
//!
//! ```rust
//! use tds_protocol::{PacketHeader, PacketStatus, PacketType};
//!
//! let header = PacketHeader::new(
//!     PacketType::SqlBatch,
//!     PacketStatus::END_OF_MESSAGE,
//!     100,
//! );
//! assert_eq!(header.payload_length(), 92);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod error;
pub mod packet;
pub mod plp;
pub mod request;
pub mod token;

pub use error::ProtocolError;
pub use packet::{
    DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader, PacketStatus,
    PacketType, next_packet_id,
};
pub use plp::{PLP_NULL, PLP_TERMINATOR, PLP_UNKNOWN_LEN, PlpLength};
pub use request::{ALL_HEADERS_LEN, AllHeaders, encode_sql_batch};
pub use token::{
    Done, DoneStatus, EnvChange, EnvChangeType, EnvChangeValue, FATAL_ERROR_CLASS, LoginAck,
    ServerMessage, TokenType,
};
