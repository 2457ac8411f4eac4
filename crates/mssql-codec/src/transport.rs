//! Split I/O transport adapter.
//!
//! The transport is the only component that touches the operating system's
//! networking primitives; everything above it is pure state manipulation.
//! The underlying stream is split into a framed read half and a framed,
//! shared write half so that attention packets can be sent out of band
//! while the read side is blocked awaiting results.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use tds_protocol::packet::PacketHeader;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, Notify};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::error::CodecError;
use crate::packet_codec::{Packet, TdsCodec};

type Reader<T> = FramedRead<ReadHalf<T>, TdsCodec>;
type Writer<T> = FramedWrite<WriteHalf<T>, TdsCodec>;
type SharedWriter<T> = Arc<Mutex<Writer<T>>>;

/// Shared write-side accounting: outstanding queued packets and a stashed
/// completion error for waiters that have not arrived yet.
#[derive(Debug, Default)]
struct WriteState {
    pending: AtomicUsize,
    stashed: parking_lot::Mutex<Option<CodecError>>,
}

/// Shared attention interlock state.
#[derive(Debug, Default)]
struct AttentionState {
    sending: AtomicBool,
    sent: AtomicBool,
    received: AtomicBool,
    ack: Notify,
    alive: AtomicBool,
}

/// A framed TDS transport with split I/O.
///
/// Reads are exclusive (`&mut self`): at most one consumer parses response
/// bytes at any time. Writes go through a shared, locked sink so a cancel
/// path on another task can deliver an attention packet.
pub struct Transport<T>
where
    T: AsyncRead + AsyncWrite,
{
    reader: Reader<T>,
    writer: SharedWriter<T>,
    write_state: Arc<WriteState>,
    attention: Arc<AttentionState>,
}

impl<T> Transport<T>
where
    T: AsyncRead + AsyncWrite,
{
    /// Create a new transport over the given stream.
    ///
    /// The stream is immediately split into read and write halves.
    pub fn new(stream: T, max_packet_size: usize) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let codec = || TdsCodec::new().with_max_packet_size(max_packet_size);

        let attention = Arc::new(AttentionState::default());
        attention.alive.store(true, Ordering::Release);

        Self {
            reader: FramedRead::new(read_half, codec()),
            writer: Arc::new(Mutex::new(FramedWrite::new(write_half, codec()))),
            write_state: Arc::new(WriteState::default()),
            attention,
        }
    }
}

impl<T> Transport<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Read the next packet, waiting as long as it takes.
    ///
    /// Returns `Ok(None)` on orderly transport close. The delivered packet
    /// owns its payload buffer; dropping it releases the buffer on every
    /// exit path.
    pub async fn read_packet(&mut self) -> Result<Option<Packet>, CodecError> {
        match self.reader.next().await {
            Some(Ok(packet)) => Ok(Some(packet)),
            Some(Err(err)) => {
                self.attention.alive.store(false, Ordering::Release);
                Err(err)
            }
            None => {
                self.attention.alive.store(false, Ordering::Release);
                Ok(None)
            }
        }
    }

    /// Read the next packet with a deadline.
    ///
    /// Elapsing yields [`CodecError::WaitTimeout`], the recoverable
    /// wait-timeout class: the connection itself is still usable for the
    /// attention dance.
    pub async fn read_packet_timeout(
        &mut self,
        limit: Duration,
    ) -> Result<Option<Packet>, CodecError> {
        match tokio::time::timeout(limit, self.read_packet()).await {
            Ok(result) => result,
            Err(_elapsed) => Err(CodecError::WaitTimeout),
        }
    }

    /// Queue a packet on the write side without driving the sink.
    ///
    /// The packet is accounted as an outstanding write until the next
    /// [`flush`](Self::flush) completes.
    pub async fn feed(&self, packet: Packet) -> Result<(), CodecError> {
        let mut writer = self.writer.lock().await;
        match writer.feed(packet).await {
            Ok(()) => {
                self.write_state.pending.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
            Err(err) => {
                self.stash_write_error(err.clone());
                Err(err)
            }
        }
    }

    /// Flush all queued packets to the wire.
    pub async fn flush(&self) -> Result<(), CodecError> {
        let mut writer = self.writer.lock().await;
        match SinkExt::<Packet>::flush(&mut *writer).await {
            Ok(()) => {
                self.write_state.pending.store(0, Ordering::Release);
                Ok(())
            }
            Err(err) => {
                self.attention.alive.store(false, Ordering::Release);
                self.stash_write_error(err.clone());
                Err(err)
            }
        }
    }

    /// Send a single packet and flush it.
    pub async fn send(&self, packet: Packet) -> Result<(), CodecError> {
        self.feed(packet).await?;
        self.flush().await
    }

    /// Queue a pre-framed packet (header already stamped) without driving
    /// the sink.
    pub async fn feed_raw(&self, frame: bytes::Bytes) -> Result<(), CodecError> {
        let mut writer = self.writer.lock().await;
        match writer.feed(frame).await {
            Ok(()) => {
                self.write_state.pending.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
            Err(err) => {
                self.stash_write_error(err.clone());
                Err(err)
            }
        }
    }

    /// Send a pre-framed packet (header already stamped) and flush it.
    pub async fn send_raw(&self, frame: bytes::Bytes) -> Result<(), CodecError> {
        self.feed_raw(frame).await?;
        self.flush().await
    }

    /// Wait until every queued write has reached the wire.
    ///
    /// Surfaces a stashed completion error recorded before any waiter was
    /// registered.
    pub async fn wait_for_accumulated_writes(&self) -> Result<(), CodecError> {
        if let Some(err) = self.take_write_error() {
            return Err(err);
        }
        if self.pending_writes() > 0 {
            self.flush().await?;
        }
        match self.take_write_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Number of packets queued but not yet confirmed on the wire.
    #[must_use]
    pub fn pending_writes(&self) -> usize {
        self.write_state.pending.load(Ordering::Acquire)
    }

    /// Take a write error recorded while no waiter was registered.
    #[must_use]
    pub fn take_write_error(&self) -> Option<CodecError> {
        self.write_state.stashed.lock().take()
    }

    fn stash_write_error(&self, err: CodecError) {
        let mut stashed = self.write_state.stashed.lock();
        if stashed.is_none() {
            *stashed = Some(err);
        }
    }

    /// Best-effort liveness check: false once the transport has closed or
    /// failed.
    #[must_use]
    pub fn check_alive(&self) -> bool {
        self.attention.alive.load(Ordering::Acquire)
    }

    /// Drop any bytes buffered on the read side.
    pub fn cancel_outstanding(&mut self) {
        self.reader.read_buffer_mut().clear();
    }

    /// Update the negotiated packet size on both halves.
    pub async fn set_max_packet_size(&mut self, size: usize) {
        self.reader.decoder_mut().set_max_packet_size(size);
        self.writer
            .lock()
            .await
            .encoder_mut()
            .set_max_packet_size(size);
    }

    /// Get a handle for sending attention packets on this transport.
    ///
    /// The handle can be cloned and sent to other tasks.
    #[must_use]
    pub fn attention_sender(&self) -> AttentionSender<T> {
        AttentionSender {
            writer: Arc::clone(&self.writer),
            state: Arc::clone(&self.attention),
        }
    }
}

impl<T> std::fmt::Debug for Transport<T>
where
    T: AsyncRead + AsyncWrite,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("alive", &self.attention.alive.load(Ordering::Acquire))
            .field(
                "pending_writes",
                &self.write_state.pending.load(Ordering::Acquire),
            )
            .finish_non_exhaustive()
    }
}

/// Handle for the out-of-band attention signal.
///
/// Attention is how the client asks the server to abandon the current
/// request. The handle shares the transport's write half, so it works even
/// while the owning task is blocked reading results.
pub struct AttentionSender<T>
where
    T: AsyncRead + AsyncWrite,
{
    writer: SharedWriter<T>,
    state: Arc<AttentionState>,
}

impl<T> AttentionSender<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Send an attention packet.
    ///
    /// Idempotent: returns `Ok(false)` when an attention is already on the
    /// wire or in flight from another task.
    pub async fn send_attention(&self) -> Result<bool, CodecError> {
        if self.state.sent.load(Ordering::Acquire) {
            return Ok(false);
        }
        let mut writer = self.writer.lock().await;
        self.send_attention_locked(&mut writer).await
    }

    /// Send an attention packet with a bounded wait on the writer lock.
    ///
    /// The cancel path polls in `poll` steps rather than parking forever,
    /// so a concurrent close cannot deadlock it. Gives up once the
    /// transport has died. The interlock flags flip only while the lock is
    /// held, so abandoning a poll round leaves no half-sent state behind.
    pub async fn send_attention_bounded(&self, poll: Duration) -> Result<bool, CodecError> {
        loop {
            if self.state.sent.load(Ordering::Acquire) {
                return Ok(false);
            }
            if !self.state.alive.load(Ordering::Acquire) {
                return Err(CodecError::ConnectionClosed);
            }
            match tokio::time::timeout(poll, self.writer.lock()).await {
                Ok(mut writer) => return self.send_attention_locked(&mut writer).await,
                Err(_elapsed) => continue,
            }
        }
    }

    async fn send_attention_locked(&self, writer: &mut Writer<T>) -> Result<bool, CodecError> {
        if self.state.sent.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        self.state.sending.store(true, Ordering::Release);
        tracing::debug!("sending attention packet");

        let result = writer
            .send(Packet::new(PacketHeader::attention(), BytesMut::new()))
            .await;
        self.state.sending.store(false, Ordering::Release);

        match result {
            Ok(()) => Ok(true),
            Err(err) => {
                self.state.alive.store(false, Ordering::Release);
                Err(err)
            }
        }
    }

    /// Whether an attention send is in progress right now.
    #[must_use]
    pub fn attention_sending(&self) -> bool {
        self.state.sending.load(Ordering::Acquire)
    }

    /// Whether an attention is on the wire, awaiting its acknowledgment.
    #[must_use]
    pub fn attention_sent(&self) -> bool {
        self.state.sent.load(Ordering::Acquire)
    }

    /// Whether the server's attention acknowledgment has been consumed.
    #[must_use]
    pub fn attention_received(&self) -> bool {
        self.state.received.load(Ordering::Acquire)
    }

    /// Record the attention acknowledgment and wake waiters.
    pub fn ack_received(&self) {
        self.state.received.store(true, Ordering::Release);
        self.state.ack.notify_waiters();
    }

    /// Clear the attention interlock once the session is clean again.
    pub fn reset(&self) {
        self.state.sent.store(false, Ordering::Release);
        self.state.received.store(false, Ordering::Release);
    }

    /// Wait for the attention acknowledgment.
    pub async fn wait_ack(&self) {
        let notified = self.state.ack.notified();
        if self.state.received.load(Ordering::Acquire) {
            return;
        }
        notified.await;
    }

    /// Whether the underlying transport is still usable.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.state.alive.load(Ordering::Acquire)
    }

    /// Mark the transport dead (published before waiters are inspected).
    pub fn mark_dead(&self) {
        self.state.alive.store(false, Ordering::SeqCst);
        self.state.ack.notify_waiters();
    }
}

impl<T> Clone for AttentionSender<T>
where
    T: AsyncRead + AsyncWrite,
{
    fn clone(&self) -> Self {
        Self {
            writer: Arc::clone(&self.writer),
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> std::fmt::Debug for AttentionSender<T>
where
    T: AsyncRead + AsyncWrite,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttentionSender")
            .field("sent", &self.state.sent.load(Ordering::Acquire))
            .field("received", &self.state.received.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tds_protocol::packet::{PACKET_HEADER_SIZE, PacketStatus, PacketType};

    #[tokio::test]
    async fn test_attention_is_header_only() {
        let (client, mut server) = tokio::io::duplex(4096);
        let transport = Transport::new(client, 4096);
        let attention = transport.attention_sender();

        assert!(attention.send_attention().await.unwrap());
        assert!(attention.attention_sent());

        // Second send is a no-op
        assert!(!attention.send_attention().await.unwrap());

        let mut raw = [0u8; PACKET_HEADER_SIZE];
        tokio::io::AsyncReadExt::read_exact(&mut server, &mut raw)
            .await
            .unwrap();
        assert_eq!(raw[0], PacketType::Attention as u8);
        assert_eq!(raw[1], PacketStatus::END_OF_MESSAGE.bits());
        assert_eq!(u16::from_be_bytes([raw[2], raw[3]]), 8);
    }

    #[tokio::test]
    async fn test_read_packet_timeout_elapses() {
        let (client, _server) = tokio::io::duplex(4096);
        let mut transport = Transport::new(client, 4096);

        let err = transport
            .read_packet_timeout(Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(err.is_wait_timeout());
        assert!(transport.check_alive());
    }

    #[tokio::test]
    async fn test_roundtrip_over_duplex() {
        let (client, server) = tokio::io::duplex(4096);
        let transport = Transport::new(client, 4096);
        let mut peer = Transport::new(server, 4096);

        let header = PacketHeader::new(PacketType::SqlBatch, PacketStatus::END_OF_MESSAGE, 0);
        transport
            .send(Packet::new(header, BytesMut::from(&b"hello"[..])))
            .await
            .unwrap();

        let packet = peer.read_packet().await.unwrap().unwrap();
        assert_eq!(packet.header.packet_type, PacketType::SqlBatch);
        assert_eq!(&packet.payload[..], b"hello");
    }

    #[tokio::test]
    async fn test_pending_writes_accounting() {
        let (client, _server) = tokio::io::duplex(65536);
        let transport = Transport::new(client, 4096);

        let header = PacketHeader::new(PacketType::SqlBatch, PacketStatus::BATCH, 0);
        transport
            .feed(Packet::new(header, BytesMut::from(&b"a"[..])))
            .await
            .unwrap();
        transport
            .feed(Packet::new(header, BytesMut::from(&b"b"[..])))
            .await
            .unwrap();
        assert_eq!(transport.pending_writes(), 2);

        transport.wait_for_accumulated_writes().await.unwrap();
        assert_eq!(transport.pending_writes(), 0);
    }

    #[tokio::test]
    async fn test_raw_frames_pass_through_unchanged() {
        let (client, server) = tokio::io::duplex(4096);
        let transport = Transport::new(client, 4096);
        let mut peer = Transport::new(server, 4096);

        // A pre-framed packet with its header already stamped in place.
        let mut frame = BytesMut::new();
        PacketHeader::new(PacketType::SqlBatch, PacketStatus::END_OF_MESSAGE, 12)
            .encode(&mut frame);
        frame.extend_from_slice(b"tail");
        transport.send_raw(frame.freeze()).await.unwrap();

        let packet = peer.read_packet().await.unwrap().unwrap();
        assert_eq!(packet.header.length, 12);
        assert_eq!(&packet.payload[..], b"tail");
    }

    #[tokio::test]
    async fn test_ack_wakeup() {
        let (client, _server) = tokio::io::duplex(4096);
        let transport = Transport::new(client, 4096);
        let attention = transport.attention_sender();

        attention.ack_received();
        // Already-received ack returns immediately.
        attention.wait_ack().await;
        assert!(attention.attention_received());

        attention.reset();
        assert!(!attention.attention_received());
        assert!(!attention.attention_sent());
    }
}
