//! Read snapshot and replay.
//!
//! A retryable read takes a snapshot before it begins. Every packet
//! received afterwards is recorded; when the operation must restart (a
//! cooperative suspension resumed, or a transient failure retried), the
//! captured parser position is restored wholesale and the recorded packets
//! are delivered again from position zero before the transport is asked
//! for anything new.

use bytes::Bytes;
use tds_protocol::packet::{PacketHeader, PacketStatus};

use crate::read::{ParserState, Pipeline};

/// Parser position fields captured when the snapshot was taken.
#[derive(Debug, Clone)]
struct CapturedState {
    unread: Bytes,
    bytes_used: usize,
    bytes_read: usize,
    message_status: PacketStatus,
    message_complete: bool,
    parser: ParserState,
}

/// A recorded sequence of packets plus the parser position to restart from.
///
/// The null-bitmap cache inside the parser state is shared by reference
/// (`Arc`); the pipeline installs a fresh allocation whenever a new bitmap
/// is decoded, so the shared copy is never mutated in place.
#[derive(Debug)]
pub struct Snapshot {
    packets: Vec<(PacketHeader, Bytes)>,
    replay_cursor: usize,
    captured: CapturedState,
}

impl Snapshot {
    /// Capture the pipeline's current position.
    #[must_use]
    pub fn capture(pipeline: &Pipeline) -> Self {
        Self {
            packets: Vec::new(),
            replay_cursor: 0,
            captured: CapturedState {
                unread: Bytes::copy_from_slice(pipeline.input.peek()),
                bytes_used: pipeline.input.bytes_used(),
                bytes_read: pipeline.input.bytes_read(),
                message_status: pipeline.input.message_status(),
                message_complete: pipeline.input.message_complete(),
                parser: pipeline.state.clone(),
            },
        }
    }

    /// Record a packet received after the snapshot was taken.
    pub fn record_packet(&mut self, header: PacketHeader, payload: Bytes) {
        self.packets.push((header, payload));
    }

    /// Number of packets buffered for replay.
    #[must_use]
    pub fn packet_count(&self) -> usize {
        self.packets.len()
    }

    /// Whether buffered packets remain to be replayed.
    #[must_use]
    pub fn replaying(&self) -> bool {
        self.replay_cursor < self.packets.len()
    }

    /// Restore the captured parser position and rewind replay to packet
    /// zero.
    ///
    /// With zero buffered packets and no reads performed this is a no-op:
    /// the restored state equals the current one.
    pub fn begin_replay(&mut self, pipeline: &mut Pipeline) {
        tracing::trace!(
            buffered_packets = self.packets.len(),
            "restarting read from snapshot"
        );
        pipeline.input.restore(
            &self.captured.unread,
            self.captured.bytes_used,
            self.captured.bytes_read,
            self.captured.message_status,
            self.captured.message_complete,
        );
        pipeline.state = self.captured.parser.clone();
        self.replay_cursor = 0;
    }

    /// The next buffered packet to deliver, if any.
    ///
    /// A packet handed out here is never re-requested from the transport.
    pub fn next_replay(&mut self) -> Option<(PacketHeader, Bytes)> {
        let entry = self.packets.get(self.replay_cursor).cloned();
        if entry.is_some() {
            self.replay_cursor += 1;
        }
        entry
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tds_protocol::packet::{PACKET_HEADER_SIZE, PacketType};

    fn header(payload_len: usize, eom: bool) -> PacketHeader {
        let status = if eom {
            PacketStatus::END_OF_MESSAGE
        } else {
            PacketStatus::BATCH
        };
        PacketHeader::new(
            PacketType::TabularResult,
            status,
            (PACKET_HEADER_SIZE + payload_len) as u16,
        )
    }

    /// Deliver a packet the way the session does: record, then append.
    fn deliver(pipeline: &mut Pipeline, snapshot: &mut Snapshot, payload: &[u8], eom: bool) {
        let h = header(payload.len(), eom);
        snapshot.record_packet(h, Bytes::copy_from_slice(payload));
        pipeline.append_packet(&h, payload).unwrap();
    }

    fn replay_all(pipeline: &mut Pipeline, snapshot: &mut Snapshot) {
        snapshot.begin_replay(pipeline);
        while let Some((h, payload)) = snapshot.next_replay() {
            pipeline.append_packet(&h, &payload).unwrap();
        }
    }

    #[test]
    fn test_replay_reproduces_values_bit_identically() {
        let mut pipeline = Pipeline::new(4096);
        pipeline.begin_response();

        let mut snapshot = Snapshot::capture(&pipeline);
        deliver(&mut pipeline, &mut snapshot, &0xAABB_CCDDu32.to_le_bytes(), false);
        deliver(&mut pipeline, &mut snapshot, &0x11u8.to_le_bytes(), true);

        let first = pipeline.try_read_u32().unwrap().ready().unwrap();
        let second = pipeline.try_read_u8().unwrap().ready().unwrap();

        replay_all(&mut pipeline, &mut snapshot);

        assert_eq!(pipeline.try_read_u32().unwrap().ready().unwrap(), first);
        assert_eq!(pipeline.try_read_u8().unwrap().ready().unwrap(), second);
        assert_eq!(pipeline.input.bytes_used(), 5);
    }

    #[test]
    fn test_replay_restores_mid_value_position() {
        let mut pipeline = Pipeline::new(4096);
        pipeline.begin_response();

        // Two bytes consumed before the snapshot
        let pre = header(2, false);
        pipeline.append_packet(&pre, &[0xFF, 0xEE]).unwrap();
        pipeline.try_read_u16().unwrap().ready().unwrap();

        let mut snapshot = Snapshot::capture(&pipeline);
        deliver(&mut pipeline, &mut snapshot, b"abcd", true);

        let mut dest = Vec::new();
        pipeline.try_read_bytes(Some(&mut dest), 4).unwrap();
        assert_eq!(dest, b"abcd");

        replay_all(&mut pipeline, &mut snapshot);
        assert_eq!(pipeline.input.bytes_used(), 2);

        let mut again = Vec::new();
        pipeline.try_read_bytes(Some(&mut again), 4).unwrap();
        assert_eq!(again, b"abcd");
    }

    #[test]
    fn test_empty_snapshot_replay_is_noop() {
        let mut pipeline = Pipeline::new(4096);
        pipeline.begin_response();

        let mut snapshot = Snapshot::capture(&pipeline);
        assert_eq!(snapshot.packet_count(), 0);

        snapshot.begin_replay(&mut pipeline);
        assert!(snapshot.next_replay().is_none());
        assert_eq!(pipeline.input.bytes_used(), 0);
        assert_eq!(pipeline.remaining(), 0);
        assert!(!pipeline.message_complete());
    }

    #[test]
    fn test_replayed_packets_consumed_once_per_replay() {
        let mut pipeline = Pipeline::new(4096);
        pipeline.begin_response();

        let mut snapshot = Snapshot::capture(&pipeline);
        deliver(&mut pipeline, &mut snapshot, &[1, 2, 3], true);

        snapshot.begin_replay(&mut pipeline);
        assert!(snapshot.replaying());
        assert!(snapshot.next_replay().is_some());
        assert!(!snapshot.replaying());
        assert!(snapshot.next_replay().is_none());
    }

    #[test]
    fn test_parser_plp_state_restored() {
        let mut pipeline = Pipeline::new(4096);
        pipeline.begin_response();

        let mut snapshot = Snapshot::capture(&pipeline);

        // PLP value: unknown length, one chunk, then stalls mid-chunk
        let mut payload = Vec::new();
        payload.extend_from_slice(&tds_protocol::PLP_UNKNOWN_LEN.to_le_bytes());
        payload.extend_from_slice(&6u32.to_le_bytes());
        payload.extend_from_slice(b"abc");
        deliver(&mut pipeline, &mut snapshot, &payload, false);

        let mut dest = Vec::new();
        assert!(pipeline.try_read_plp_bytes(&mut dest).unwrap().is_suspended());
        assert_eq!(dest, b"abc");

        // Restart: the PLP cursor must rewind with everything else
        replay_all(&mut pipeline, &mut snapshot);
        let mut dest2 = Vec::new();
        assert!(pipeline.try_read_plp_bytes(&mut dest2).unwrap().is_suspended());
        assert_eq!(dest2, b"abc");
    }
}
