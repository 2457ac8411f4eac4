//! Request payload encoding.
//!
//! Per MS-TDS, every SQL batch, RPC, transaction manager, or bulk load
//! request begins with an ALL_HEADERS section (TDS 7.2+). The session core
//! stamps the current transaction descriptor and its outstanding request
//! count into that section on every request it sends, which is how a MARS
//! session rides its transaction over each packet.

use bytes::{BufMut, Bytes, BytesMut};

/// The ALL_HEADERS prefix carried on request payloads.
///
/// Per MS-TDS 2.2.5.3 the transaction descriptor header (type 0x0002) is:
/// HeaderLength (4) + HeaderType (2) + TransactionDescriptor (8) +
/// OutstandingRequestCount (4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllHeaders {
    /// Transaction descriptor from the BeginTransaction EnvChange,
    /// 0 for auto-commit mode.
    pub transaction_descriptor: u64,
    /// Number of requests outstanding on the session (1 for non-MARS).
    pub outstanding_requests: u32,
}

/// Encoded size of the ALL_HEADERS section.
pub const ALL_HEADERS_LEN: usize = 22;

impl AllHeaders {
    /// ALL_HEADERS for auto-commit mode with a single outstanding request.
    #[must_use]
    pub const fn auto_commit() -> Self {
        Self {
            transaction_descriptor: 0,
            outstanding_requests: 1,
        }
    }

    /// Encode the ALL_HEADERS section.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u32_le(ALL_HEADERS_LEN as u32); // Total length
        dst.put_u32_le(18); // Header length
        dst.put_u16_le(0x0002); // Header type: transaction descriptor
        dst.put_u64_le(self.transaction_descriptor);
        dst.put_u32_le(self.outstanding_requests);
    }
}

impl Default for AllHeaders {
    fn default() -> Self {
        Self::auto_commit()
    }
}

/// Encode a SQL batch request payload: ALL_HEADERS followed by the SQL text
/// as UTF-16LE.
#[must_use]
pub fn encode_sql_batch(sql: &str, headers: &AllHeaders) -> Bytes {
    let mut buf = BytesMut::with_capacity(ALL_HEADERS_LEN + sql.len() * 2);
    headers.encode(&mut buf);
    // SQL text as bare UTF-16LE; the packet framing bounds it.
    for unit in sql.encode_utf16() {
        buf.put_u16_le(unit);
    }
    buf.freeze()
}
