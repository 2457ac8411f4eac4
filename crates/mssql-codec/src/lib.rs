//! # mssql-codec
//!
//! Async framing layer for TDS packet handling.
//!
//! This crate transforms raw byte streams into framed TDS packets, handling
//! packet reassembly across TCP segment boundaries (including headers that
//! arrive split across reads), and provides the split-I/O transport the
//! session core builds on.
//!
//! ## Architecture
//!
//! ```text
//! TCP Stream → TdsCodec (packet framing) → Transport → Session
//! ```
//!
//! ### Cancellation safety
//!
//! The transport splits the stream into read and write halves. This allows
//! sending attention packets for query cancellation even while blocked
//! reading a large result set:
//!
//! ```rust,ignore
//! use mssql_codec::Transport;
//!
//! let mut transport = Transport::new(tcp_stream, 4096);
//! let attention = transport.attention_sender();
//!
//! // Cancel from another task
//! tokio::spawn(async move {
//!     attention.send_attention().await?;
//! });
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod error;
pub mod packet_codec;
pub mod transport;

pub use error::CodecError;
pub use packet_codec::{Packet, TdsCodec};
pub use transport::{AttentionSender, Transport};
