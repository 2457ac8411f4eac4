//! The replayable read pipeline.
//!
//! Produces primitive values lazily out of the staged response bytes. Every
//! operation is a tristate: ready with a value, suspended (more network
//! data needed), or failed. A suspended operation consumes nothing the
//! caller can observe; resuming simply means appending the next packet and
//! retrying, so values that straddle a packet boundary assemble from the
//! contiguous staging buffer.

use std::sync::Arc;

use tds_protocol::packet::{PacketHeader, PacketStatus};
use tds_protocol::plp::{PLP_TERMINATOR, PlpLength};

use crate::buffer::ReadBuffer;
use crate::error::{Result, SessionError};

/// Outcome of a pipeline read that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus<T> {
    /// The value is complete.
    Ready(T),
    /// More network data is needed; retry after the next packet arrives.
    Suspended,
}

impl<T> ReadStatus<T> {
    /// Whether the read suspended.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        matches!(self, Self::Suspended)
    }

    /// The value, if ready.
    pub fn ready(self) -> Option<T> {
        match self {
            Self::Ready(value) => Some(value),
            Self::Suspended => None,
        }
    }

    /// Map the ready value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ReadStatus<U> {
        match self {
            Self::Ready(value) => ReadStatus::Ready(f(value)),
            Self::Suspended => ReadStatus::Suspended,
        }
    }
}

/// Result alias for pipeline reads.
pub type ReadResult<T> = Result<ReadStatus<T>>;

/// A null bitmap cached from an NBC row, shared with snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NullBitmap {
    bits: Vec<u8>,
    columns: usize,
}

impl NullBitmap {
    /// Number of columns covered.
    #[must_use]
    pub fn columns(&self) -> usize {
        self.columns
    }

    /// Whether the given column is null.
    #[must_use]
    pub fn is_null(&self, column: usize) -> bool {
        debug_assert!(column < self.columns);
        self.bits
            .get(column / 8)
            .is_some_and(|byte| byte & (1u8 << (column % 8)) != 0)
    }
}

/// Parser position fields that ride alongside the staged bytes.
///
/// Everything here is captured by a snapshot and restored on replay.
#[derive(Debug, Clone, Default)]
pub(crate) struct ParserState {
    /// A response is outstanding and not yet fully consumed.
    pub pending_data: bool,
    /// An error token was observed in the current response.
    pub error_token_received: bool,
    /// Column metadata was observed in the current response.
    pub col_metadata_received: bool,
    /// A result set is currently open.
    pub open_result: bool,
    /// The attention acknowledgment was observed.
    pub attention_received: bool,
    /// Declared PLP total for the value being read, if one is in progress.
    pub long_len: Option<PlpLength>,
    /// Bytes remaining in the current PLP chunk.
    pub long_len_left: u64,
    /// Bytes of the PLP value consumed so far.
    pub plp_consumed: u64,
    /// Remaining length of an in-progress bulk copy or skip.
    pub skip_remaining: u64,
    /// Accumulator for fixed-length values read across packet boundaries.
    pub scratch: Vec<u8>,
    /// Target length of the scratch accumulator; 0 when idle.
    pub scratch_goal: usize,
    /// Null bitmap of the row being decoded, shared copy-on-write with
    /// snapshots.
    pub null_bitmap: Option<Arc<NullBitmap>>,
}

/// The read pipeline: staged input bytes plus parser position.
#[derive(Debug)]
pub struct Pipeline {
    pub(crate) input: ReadBuffer,
    pub(crate) state: ParserState,
}

impl Pipeline {
    /// Create a pipeline with the given negotiated packet size.
    #[must_use]
    pub fn new(packet_size: usize) -> Self {
        Self {
            input: ReadBuffer::new(packet_size),
            state: ParserState::default(),
        }
    }

    /// Append a received packet and update message tracking.
    pub fn append_packet(&mut self, header: &PacketHeader, payload: &[u8]) -> Result<()> {
        self.input.append_packet(header, payload)
    }

    /// Reset for a new response.
    pub fn begin_response(&mut self) {
        self.input.begin_response();
        self.state = ParserState {
            pending_data: true,
            ..ParserState::default()
        };
    }

    /// Whether a response is outstanding.
    #[must_use]
    pub fn pending_data(&self) -> bool {
        self.state.pending_data
    }

    /// Whether the end-of-message packet has arrived.
    #[must_use]
    pub fn message_complete(&self) -> bool {
        self.input.message_complete()
    }

    /// Status bits of the most recent packet.
    #[must_use]
    pub fn message_status(&self) -> PacketStatus {
        self.input.message_status()
    }

    /// Unconsumed byte count.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.input.bytes_in_packet()
    }

    /// The cached null bitmap, if an NBC row is being decoded.
    #[must_use]
    pub fn null_bitmap(&self) -> Option<&NullBitmap> {
        self.state.null_bitmap.as_deref()
    }

    fn try_take<const N: usize>(&mut self) -> ReadResult<[u8; N]> {
        if self.input.bytes_in_packet() < N {
            return Ok(ReadStatus::Suspended);
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.input.peek()[..N]);
        self.input.advance(N);
        Ok(ReadStatus::Ready(out))
    }

    /// Read a single byte.
    pub fn try_read_u8(&mut self) -> ReadResult<u8> {
        Ok(self.try_take::<1>()?.map(|raw| raw[0]))
    }

    /// Read a little-endian u16.
    pub fn try_read_u16(&mut self) -> ReadResult<u16> {
        Ok(self.try_take::<2>()?.map(u16::from_le_bytes))
    }

    /// Read a little-endian i16.
    pub fn try_read_i16(&mut self) -> ReadResult<i16> {
        Ok(self.try_take::<2>()?.map(i16::from_le_bytes))
    }

    /// Read a little-endian u32.
    pub fn try_read_u32(&mut self) -> ReadResult<u32> {
        Ok(self.try_take::<4>()?.map(u32::from_le_bytes))
    }

    /// Read a little-endian i32.
    pub fn try_read_i32(&mut self) -> ReadResult<i32> {
        Ok(self.try_take::<4>()?.map(i32::from_le_bytes))
    }

    /// Read a little-endian u64.
    pub fn try_read_u64(&mut self) -> ReadResult<u64> {
        Ok(self.try_take::<8>()?.map(u64::from_le_bytes))
    }

    /// Read a little-endian i64.
    pub fn try_read_i64(&mut self) -> ReadResult<i64> {
        Ok(self.try_take::<8>()?.map(i64::from_le_bytes))
    }

    /// Read a little-endian f32.
    pub fn try_read_f32(&mut self) -> ReadResult<f32> {
        Ok(self.try_take::<4>()?.map(f32::from_le_bytes))
    }

    /// Read a little-endian f64.
    pub fn try_read_f64(&mut self) -> ReadResult<f64> {
        Ok(self.try_take::<8>()?.map(f64::from_le_bytes))
    }

    /// Read `len` bytes into `dest`, or skip them when `dest` is `None`.
    ///
    /// Consumes incrementally across suspensions; the remaining length
    /// rides in the parser state, so resume with the same arguments.
    pub fn try_read_bytes(&mut self, mut dest: Option<&mut Vec<u8>>, len: u64) -> ReadResult<()> {
        if self.state.skip_remaining == 0 {
            if len == 0 {
                return Ok(ReadStatus::Ready(()));
            }
            self.state.skip_remaining = len;
        }

        while self.state.skip_remaining > 0 {
            let avail = self.input.bytes_in_packet();
            if avail == 0 {
                return Ok(ReadStatus::Suspended);
            }
            let take = avail.min(usize::try_from(self.state.skip_remaining).unwrap_or(usize::MAX));
            if let Some(dest) = dest.as_mut() {
                dest.extend_from_slice(&self.input.peek()[..take]);
            }
            self.input.advance(take);
            self.state.skip_remaining -= take as u64;
        }
        Ok(ReadStatus::Ready(()))
    }

    /// Accumulate exactly `len` bytes into the scratch buffer.
    fn try_fill_scratch(&mut self, len: usize) -> ReadResult<()> {
        if self.state.scratch_goal == 0 {
            self.state.scratch.clear();
            if len == 0 {
                return Ok(ReadStatus::Ready(()));
            }
            self.state.scratch_goal = len;
        }

        while self.state.scratch.len() < self.state.scratch_goal {
            let needed = self.state.scratch_goal - self.state.scratch.len();
            let avail = self.input.bytes_in_packet();
            if avail == 0 {
                return Ok(ReadStatus::Suspended);
            }
            let take = avail.min(needed);
            let peeked = &self.input.peek()[..take];
            self.state.scratch.extend_from_slice(peeked);
            self.input.advance(take);
        }
        self.state.scratch_goal = 0;
        Ok(ReadStatus::Ready(()))
    }

    /// Read a UTF-16LE string of `char_count` characters.
    pub fn try_read_utf16_string(&mut self, char_count: usize) -> ReadResult<String> {
        match self.try_fill_scratch(char_count * 2)? {
            ReadStatus::Suspended => Ok(ReadStatus::Suspended),
            ReadStatus::Ready(()) => {
                let units: Vec<u16> = self
                    .state
                    .scratch
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                    .collect();
                self.state.scratch.clear();
                let value = String::from_utf16(&units).map_err(|_| {
                    SessionError::Protocol(tds_protocol::ProtocolError::InvalidUtf16 {
                        field: "string value",
                    })
                })?;
                Ok(ReadStatus::Ready(value))
            }
        }
    }

    /// Read a string in the given encoding.
    ///
    /// For PLP values `len` is ignored and the chunked stream is consumed
    /// to its terminator; `Ready(None)` means the value was NULL.
    pub fn try_read_string(
        &mut self,
        encoding: &'static encoding_rs::Encoding,
        len: u64,
        is_plp: bool,
    ) -> ReadResult<Option<String>> {
        if is_plp {
            let mut collected = std::mem::take(&mut self.state.scratch);
            let result = self.try_read_plp_bytes(&mut collected);
            match result {
                Ok(ReadStatus::Ready(present)) => {
                    let value = if present {
                        let (decoded, _, _) = encoding.decode(&collected);
                        Some(decoded.into_owned())
                    } else {
                        None
                    };
                    collected.clear();
                    self.state.scratch = collected;
                    Ok(ReadStatus::Ready(value))
                }
                other => {
                    self.state.scratch = collected;
                    other.map(|status| status.map(|_| None))
                }
            }
        } else {
            match self.try_fill_scratch(usize::try_from(len).unwrap_or(usize::MAX))? {
                ReadStatus::Suspended => Ok(ReadStatus::Suspended),
                ReadStatus::Ready(()) => {
                    let (decoded, _, _) = encoding.decode(&self.state.scratch);
                    let value = decoded.into_owned();
                    self.state.scratch.clear();
                    Ok(ReadStatus::Ready(Some(value)))
                }
            }
        }
    }

    /// Read the 8-byte PLP total length field.
    pub fn try_read_plp_length(&mut self) -> ReadResult<PlpLength> {
        match self.try_take::<8>()? {
            ReadStatus::Suspended => Ok(ReadStatus::Suspended),
            ReadStatus::Ready(raw) => {
                let length = PlpLength::from_raw(u64::from_le_bytes(raw));
                self.state.long_len = if length.is_null() { None } else { Some(length) };
                self.state.long_len_left = 0;
                self.state.plp_consumed = 0;
                Ok(ReadStatus::Ready(length))
            }
        }
    }

    /// Read a whole PLP stream into `dest`.
    ///
    /// Reads the length field first if it has not been read yet.
    /// `Ready(false)` means the value was NULL. The declared total and the
    /// remaining chunk length stay consistent across suspensions.
    pub fn try_read_plp_bytes(&mut self, dest: &mut Vec<u8>) -> ReadResult<bool> {
        loop {
            let Some(declared) = self.state.long_len else {
                match self.try_read_plp_length()? {
                    ReadStatus::Suspended => return Ok(ReadStatus::Suspended),
                    ReadStatus::Ready(PlpLength::Null) => return Ok(ReadStatus::Ready(false)),
                    ReadStatus::Ready(_) => continue,
                }
            };

            if self.state.long_len_left == 0 {
                match self.try_take::<4>()? {
                    ReadStatus::Suspended => return Ok(ReadStatus::Suspended),
                    ReadStatus::Ready(raw) => {
                        let chunk = u32::from_le_bytes(raw);
                        if chunk == PLP_TERMINATOR {
                            if let Some(total) = declared.known() {
                                if self.state.plp_consumed != total {
                                    return Err(SessionError::CorruptedStream {
                                        reason: "PLP stream ended short of declared total",
                                    });
                                }
                            }
                            self.state.long_len = None;
                            return Ok(ReadStatus::Ready(true));
                        }
                        if let Some(total) = declared.known() {
                            if self.state.plp_consumed + u64::from(chunk) > total {
                                return Err(SessionError::CorruptedStream {
                                    reason: "PLP chunk past declared total",
                                });
                            }
                        }
                        self.state.long_len_left = u64::from(chunk);
                        continue;
                    }
                }
            }

            let avail = self.input.bytes_in_packet();
            if avail == 0 {
                return Ok(ReadStatus::Suspended);
            }
            let take = avail.min(usize::try_from(self.state.long_len_left).unwrap_or(usize::MAX));
            dest.extend_from_slice(&self.input.peek()[..take]);
            self.input.advance(take);
            self.state.long_len_left -= take as u64;
            self.state.plp_consumed += take as u64;
        }
    }

    /// Read and cache the null bitmap for an NBC row of `columns` columns.
    pub fn try_read_null_bitmap(&mut self, columns: usize) -> ReadResult<()> {
        match self.try_fill_scratch(columns.div_ceil(8))? {
            ReadStatus::Suspended => Ok(ReadStatus::Suspended),
            ReadStatus::Ready(()) => {
                self.state.null_bitmap = Some(Arc::new(NullBitmap {
                    bits: std::mem::take(&mut self.state.scratch),
                    columns,
                }));
                Ok(ReadStatus::Ready(()))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tds_protocol::packet::{PACKET_HEADER_SIZE, PacketType};
    use tds_protocol::plp::PLP_UNKNOWN_LEN;

    fn feed(pipeline: &mut Pipeline, payload: &[u8], eom: bool) {
        let status = if eom {
            PacketStatus::END_OF_MESSAGE
        } else {
            PacketStatus::BATCH
        };
        let header = PacketHeader::new(
            PacketType::TabularResult,
            status,
            (PACKET_HEADER_SIZE + payload.len()) as u16,
        );
        pipeline.append_packet(&header, payload).unwrap();
    }

    #[test]
    fn test_suspension_consumes_nothing() {
        let mut pipeline = Pipeline::new(4096);
        pipeline.begin_response();
        feed(&mut pipeline, &[0x01, 0x02], false);

        // Only 2 of 4 bytes are buffered
        assert!(pipeline.try_read_u32().unwrap().is_suspended());
        assert_eq!(pipeline.input.bytes_used(), 0);
        assert_eq!(pipeline.remaining(), 2);
    }

    #[test]
    fn test_value_straddling_packet_boundary() {
        let mut pipeline = Pipeline::new(4096);
        pipeline.begin_response();
        feed(&mut pipeline, &[0x78, 0x56], false);
        assert!(pipeline.try_read_u32().unwrap().is_suspended());

        feed(&mut pipeline, &[0x34, 0x12], true);
        let value = pipeline.try_read_u32().unwrap().ready().unwrap();
        assert_eq!(value, 0x1234_5678);
    }

    #[test]
    fn test_primitive_widths() {
        let mut pipeline = Pipeline::new(4096);
        pipeline.begin_response();
        let mut payload = Vec::new();
        payload.push(0xAB);
        payload.extend_from_slice(&0x1234u16.to_le_bytes());
        payload.extend_from_slice(&(-7i32).to_le_bytes());
        payload.extend_from_slice(&0xDEAD_BEEF_u64.to_le_bytes());
        payload.extend_from_slice(&2.5f64.to_le_bytes());
        feed(&mut pipeline, &payload, true);

        assert_eq!(pipeline.try_read_u8().unwrap().ready(), Some(0xAB));
        assert_eq!(pipeline.try_read_u16().unwrap().ready(), Some(0x1234));
        assert_eq!(pipeline.try_read_i32().unwrap().ready(), Some(-7));
        assert_eq!(pipeline.try_read_u64().unwrap().ready(), Some(0xDEAD_BEEF));
        assert_eq!(pipeline.try_read_f64().unwrap().ready(), Some(2.5));
    }

    #[test]
    fn test_read_bytes_with_skip() {
        let mut pipeline = Pipeline::new(4096);
        pipeline.begin_response();
        feed(&mut pipeline, b"skipped!kept", true);

        // None destination means skip
        assert!(!pipeline.try_read_bytes(None, 8).unwrap().is_suspended());

        let mut dest = Vec::new();
        assert!(
            !pipeline
                .try_read_bytes(Some(&mut dest), 4)
                .unwrap()
                .is_suspended()
        );
        assert_eq!(dest, b"kept");
    }

    #[test]
    fn test_read_bytes_resumes_across_packets() {
        let mut pipeline = Pipeline::new(4096);
        pipeline.begin_response();
        feed(&mut pipeline, b"abc", false);

        let mut dest = Vec::new();
        assert!(
            pipeline
                .try_read_bytes(Some(&mut dest), 6)
                .unwrap()
                .is_suspended()
        );
        assert_eq!(dest, b"abc");

        feed(&mut pipeline, b"def", true);
        assert!(
            !pipeline
                .try_read_bytes(Some(&mut dest), 6)
                .unwrap()
                .is_suspended()
        );
        assert_eq!(dest, b"abcdef");
    }

    #[test]
    fn test_utf16_string() {
        let mut pipeline = Pipeline::new(4096);
        pipeline.begin_response();
        let payload: Vec<u8> = "SELECT 1"
            .encode_utf16()
            .flat_map(|unit| unit.to_le_bytes())
            .collect();
        feed(&mut pipeline, &payload[..6], false);

        assert!(pipeline.try_read_utf16_string(8).unwrap().is_suspended());
        feed(&mut pipeline, &payload[6..], true);
        let value = pipeline.try_read_utf16_string(8).unwrap().ready().unwrap();
        assert_eq!(value, "SELECT 1");
    }

    #[test]
    fn test_string_with_encoding() {
        let mut pipeline = Pipeline::new(4096);
        pipeline.begin_response();
        feed(&mut pipeline, b"hello", true);

        let value = pipeline
            .try_read_string(encoding_rs::WINDOWS_1252, 5, false)
            .unwrap()
            .ready()
            .unwrap();
        assert_eq!(value.as_deref(), Some("hello"));
    }

    #[test]
    fn test_plp_null() {
        let mut pipeline = Pipeline::new(4096);
        pipeline.begin_response();
        feed(&mut pipeline, &tds_protocol::PLP_NULL.to_le_bytes(), true);

        let mut dest = Vec::new();
        let present = pipeline
            .try_read_plp_bytes(&mut dest)
            .unwrap()
            .ready()
            .unwrap();
        assert!(!present);
        assert!(dest.is_empty());
    }

    #[test]
    fn test_plp_unknown_length_chunks() {
        let mut pipeline = Pipeline::new(4096);
        pipeline.begin_response();

        let mut payload = Vec::new();
        payload.extend_from_slice(&PLP_UNKNOWN_LEN.to_le_bytes());
        payload.extend_from_slice(&5u32.to_le_bytes());
        payload.extend_from_slice(b"hello");
        payload.extend_from_slice(&3u32.to_le_bytes());
        payload.extend_from_slice(b"plp");
        payload.extend_from_slice(&0u32.to_le_bytes());
        feed(&mut pipeline, &payload, true);

        let mut dest = Vec::new();
        let present = pipeline
            .try_read_plp_bytes(&mut dest)
            .unwrap()
            .ready()
            .unwrap();
        assert!(present);
        assert_eq!(dest, b"helloplp");
    }

    #[test]
    fn test_plp_suspends_mid_chunk_and_resumes() {
        let mut pipeline = Pipeline::new(4096);
        pipeline.begin_response();

        let mut first = Vec::new();
        first.extend_from_slice(&8u64.to_le_bytes()); // known total
        first.extend_from_slice(&8u32.to_le_bytes()); // one chunk of 8
        first.extend_from_slice(b"half");
        feed(&mut pipeline, &first, false);

        let mut dest = Vec::new();
        assert!(pipeline.try_read_plp_bytes(&mut dest).unwrap().is_suspended());
        assert_eq!(dest, b"half");

        let mut second = Vec::new();
        second.extend_from_slice(b"done");
        second.extend_from_slice(&0u32.to_le_bytes());
        feed(&mut pipeline, &second, true);

        let present = pipeline
            .try_read_plp_bytes(&mut dest)
            .unwrap()
            .ready()
            .unwrap();
        assert!(present);
        assert_eq!(dest, b"halfdone");
    }

    #[test]
    fn test_plp_chunk_past_declared_total() {
        let mut pipeline = Pipeline::new(4096);
        pipeline.begin_response();

        let mut payload = Vec::new();
        payload.extend_from_slice(&4u64.to_le_bytes()); // declares 4 bytes
        payload.extend_from_slice(&9u32.to_le_bytes()); // chunk of 9
        payload.extend_from_slice(b"oversized");
        feed(&mut pipeline, &payload, true);

        let mut dest = Vec::new();
        let err = pipeline.try_read_plp_bytes(&mut dest).unwrap_err();
        assert!(matches!(err, SessionError::CorruptedStream { .. }));
    }

    #[test]
    fn test_null_bitmap() {
        let mut pipeline = Pipeline::new(4096);
        pipeline.begin_response();
        // 10 columns -> 2 bitmap bytes; columns 0 and 9 null
        feed(&mut pipeline, &[0b0000_0001, 0b0000_0010], true);

        assert!(!pipeline.try_read_null_bitmap(10).unwrap().is_suspended());
        let bitmap = pipeline.null_bitmap().unwrap();
        assert!(bitmap.is_null(0));
        assert!(!bitmap.is_null(1));
        assert!(bitmap.is_null(9));
    }
}
