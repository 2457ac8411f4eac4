//! Paired input and output packet buffers.
//!
//! The session owns one input and one output buffer of identical,
//! negotiated size. The input buffer stages received payload bytes for the
//! read pipeline; the output buffer stages outbound bytes with an 8-byte
//! header prefix so the header can be stamped in place at flush time.

use bytes::{Buf, BytesMut};
use smallvec::SmallVec;
use tds_protocol::packet::{
    PACKET_HEADER_SIZE, PacketHeader, PacketStatus, PacketType, next_packet_id,
};

use crate::error::{Result, SessionError};
use crate::secret::{MAX_SECRETS_IN_FLIGHT, SecretHandle};

/// Input staging buffer for response payload bytes.
///
/// Counters maintained per response:
/// `bytes_used` (consumed) never exceeds `bytes_read` (received), and
/// `bytes_in_packet` — the received-but-unconsumed remainder — is
/// non-negative by construction.
#[derive(Debug)]
pub struct ReadBuffer {
    buf: BytesMut,
    capacity: usize,
    bytes_used: usize,
    bytes_read: usize,
    message_status: PacketStatus,
    message_complete: bool,
}

impl ReadBuffer {
    /// Create an input buffer for the given negotiated packet size.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
            bytes_used: 0,
            bytes_read: 0,
            message_status: PacketStatus::empty(),
            message_complete: false,
        }
    }

    /// The negotiated buffer size.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes consumed from the current response.
    #[must_use]
    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    /// Bytes received for the current response.
    #[must_use]
    pub fn bytes_read(&self) -> usize {
        self.bytes_read
    }

    /// Received bytes not yet consumed.
    #[must_use]
    pub fn bytes_in_packet(&self) -> usize {
        self.buf.len()
    }

    /// Whether all received bytes have been consumed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Status bits of the most recently appended packet.
    #[must_use]
    pub fn message_status(&self) -> PacketStatus {
        self.message_status
    }

    /// Whether the end-of-message packet for this response has arrived.
    #[must_use]
    pub fn message_complete(&self) -> bool {
        self.message_complete
    }

    /// Reset the buffer for a new response.
    pub fn begin_response(&mut self) {
        self.buf.clear();
        self.bytes_used = 0;
        self.bytes_read = 0;
        self.message_status = PacketStatus::empty();
        self.message_complete = false;
    }

    /// Append a received packet's payload.
    ///
    /// # Errors
    ///
    /// A packet arriving after the end-of-message packet of the current
    /// response corrupts the stream.
    pub fn append_packet(&mut self, header: &PacketHeader, payload: &[u8]) -> Result<()> {
        if self.message_complete {
            return Err(SessionError::CorruptedStream {
                reason: "packet received after end of message",
            });
        }

        self.message_status = header.status;
        if header.is_end_of_message() {
            self.message_complete = true;
        }
        // A cancelled message's tail carries no usable payload.
        if !header.is_ignored() {
            self.buf.extend_from_slice(payload);
            self.bytes_read += payload.len();
        }
        Ok(())
    }

    /// The unconsumed bytes.
    #[must_use]
    pub fn peek(&self) -> &[u8] {
        &self.buf
    }

    /// Consume `n` bytes.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.buf.len());
        self.buf.advance(n);
        self.bytes_used += n;
    }

    /// Restore the buffer to a snapshot's captured position.
    pub(crate) fn restore(
        &mut self,
        unread: &[u8],
        bytes_used: usize,
        bytes_read: usize,
        message_status: PacketStatus,
        message_complete: bool,
    ) {
        self.buf.clear();
        self.buf.extend_from_slice(unread);
        self.bytes_used = bytes_used;
        self.bytes_read = bytes_read;
        self.message_status = message_status;
        self.message_complete = message_complete;
    }

    /// Change the buffer size. Only permitted while empty.
    pub fn set_capacity(&mut self, capacity: usize) -> Result<()> {
        if !self.is_empty() {
            return Err(SessionError::CorruptedStream {
                reason: "buffer resize with unconsumed data",
            });
        }
        self.capacity = capacity;
        Ok(())
    }
}

/// A secret staged in the output buffer: the handle plus the offset of its
/// zeroed placeholder.
#[derive(Debug)]
struct SecretSlot {
    handle: SecretHandle,
    offset: usize,
}

/// Output staging buffer.
///
/// The buffer always begins with [`PACKET_HEADER_SIZE`] reserved bytes; the
/// real header is stamped into that prefix when a packet is taken at flush
/// time.
#[derive(Debug)]
pub struct WriteBuffer {
    buf: BytesMut,
    capacity: usize,
    packet_id: u8,
    packets_sent: u32,
    secrets: SmallVec<[SecretSlot; MAX_SECRETS_IN_FLIGHT]>,
}

impl WriteBuffer {
    /// Create an output buffer for the given negotiated packet size.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let mut buf = BytesMut::with_capacity(capacity);
        buf.resize(PACKET_HEADER_SIZE, 0);
        Self {
            buf,
            capacity,
            packet_id: 1,
            packets_sent: 0,
            secrets: SmallVec::new(),
        }
    }

    /// The negotiated buffer size.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Payload bytes staged so far (excluding the header prefix).
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.buf.len() - PACKET_HEADER_SIZE
    }

    /// Whether any payload is staged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload_len() == 0
    }

    /// Remaining space before the packet is full.
    #[must_use]
    pub fn space_left(&self) -> usize {
        self.capacity - self.buf.len()
    }

    /// Whether the staged packet has reached the negotiated size.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.space_left() == 0
    }

    /// Packets already emitted for the current message.
    #[must_use]
    pub fn packets_sent(&self) -> u32 {
        self.packets_sent
    }

    /// The packet number the next emitted packet will carry.
    #[must_use]
    pub fn next_packet_number(&self) -> u8 {
        self.packet_id
    }

    /// Stage a single byte. The caller flushes first when full.
    pub fn push_u8(&mut self, value: u8) {
        debug_assert!(!self.is_full());
        self.buf.extend_from_slice(&[value]);
    }

    /// Stage as many bytes as fit; returns how many were taken.
    pub fn push_slice(&mut self, data: &[u8]) -> usize {
        let take = data.len().min(self.space_left());
        self.buf.extend_from_slice(&data[..take]);
        take
    }

    /// Stage a secret: a zeroed placeholder now, plaintext at flush time.
    ///
    /// # Errors
    ///
    /// At most [`MAX_SECRETS_IN_FLIGHT`] secrets may be staged, and a
    /// secret must fit in the current packet's remaining space.
    pub fn push_secret(&mut self, handle: SecretHandle) -> Result<()> {
        if self.secrets.len() >= MAX_SECRETS_IN_FLIGHT || handle.len() > self.space_left() {
            return Err(SessionError::SecretOverflow);
        }
        let offset = self.buf.len();
        self.buf.resize(offset + handle.len(), 0);
        self.secrets.push(SecretSlot { handle, offset });
        Ok(())
    }

    /// Stamp the header in place, materialise staged secrets, and take the
    /// completed packet.
    ///
    /// Soft flushes carry `BATCH` and bump the packet number; the
    /// end-of-message packet resets the number to 1 for the next message.
    pub fn take_packet(
        &mut self,
        packet_type: PacketType,
        status: PacketStatus,
        spid: u16,
    ) -> bytes::Bytes {
        // Secrets are written into the already-staged buffer immediately
        // before the bytes leave for the transport.
        for slot in self.secrets.drain(..) {
            let end = slot.offset + slot.handle.len();
            self.buf[slot.offset..end].copy_from_slice(slot.handle.expose());
        }

        let total = self.buf.len() as u16;
        self.buf[0] = packet_type as u8;
        self.buf[1] = status.bits();
        self.buf[2..4].copy_from_slice(&total.to_be_bytes());
        self.buf[4..6].copy_from_slice(&spid.to_be_bytes());
        self.buf[6] = self.packet_id;
        self.buf[7] = 0;

        self.packets_sent += 1;
        if status.contains(PacketStatus::END_OF_MESSAGE) {
            self.packet_id = 1;
        } else {
            self.packet_id = next_packet_id(self.packet_id);
        }

        let packet = self.buf.split().freeze();
        self.buf.resize(PACKET_HEADER_SIZE, 0);
        packet
    }

    /// Reset the message: the staged payload and secrets are discarded and
    /// the packet number starts over.
    pub fn discard_message(&mut self) {
        self.buf.clear();
        self.buf.resize(PACKET_HEADER_SIZE, 0);
        self.secrets.clear();
        self.packet_id = 1;
        self.packets_sent = 0;
    }

    /// Begin a new message (same as a discard, but named for intent).
    pub fn begin_message(&mut self) {
        self.discard_message();
    }

    /// Change the buffer size. Only permitted while empty.
    pub fn set_capacity(&mut self, capacity: usize) -> Result<()> {
        if !self.is_empty() {
            return Err(SessionError::CorruptedStream {
                reason: "buffer resize with staged data",
            });
        }
        self.capacity = capacity;
        Ok(())
    }
}
