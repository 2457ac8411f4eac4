//! # mssql-session
//!
//! The per-session protocol state object of a TDS (SQL Server) client
//! driver: packetised I/O over a single transport, a replayable read
//! pipeline, attention-based cancellation, timeout supervision, and the
//! client-side transaction lifecycle.
//!
//! This crate deliberately stops below the public command/reader surface:
//! it hands primitive values and token boundaries to the token parser
//! layered above it, and hands transaction state changes down from that
//! parser into the session's transaction registry.
//!
//! ## Architecture
//!
//! ```text
//! token parser (collaborator)
//!        ↑ primitives, Unhandled tokens
//! Session ── read pipeline ── snapshot/replay
//!    │            │
//!    │     timeout supervisor ── attention interlock
//!    │            │
//!    └── write pipeline ──→ Transport (mssql-codec)
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use mssql_session::{Session, SessionConfig, IsolationLevel};
//!
//! let mut session = Session::new(tcp_stream, SessionConfig::new())?;
//! let mut tx = session.begin_transaction(IsolationLevel::ReadCommitted).await?;
//! tx.commit().await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod buffer;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod read;
pub mod secret;
pub mod session;
pub mod snapshot;
pub mod timeout;
pub mod transaction;
pub mod write;

pub use buffer::{ReadBuffer, WriteBuffer};
pub use config::{DEFAULT_ATTENTION_GRACE, DEFAULT_CANCEL_POLL, MIN_PACKET_SIZE, SessionConfig};
pub use diagnostics::{Diagnostics, DiagnosticsSnapshot};
pub use error::{Result, SessionError, TIMEOUT_EXPIRED_NUMBER};
pub use read::{NullBitmap, Pipeline, ReadResult, ReadStatus};
pub use secret::{MAX_SECRETS_IN_FLIGHT, SecretHandle};
pub use session::{
    CancelHandle, HandledToken, OperationOwner, Session, SessionState, SkimOutcome,
    UNASSOCIATED_OPERATION,
};
pub use snapshot::Snapshot;
pub use timeout::{TimeoutSupervisor, TimerState};
pub use transaction::{
    InternalTransaction, IsolationLevel, Transaction, TransactionState, TransactionType,
};
pub use write::FlushMode;
