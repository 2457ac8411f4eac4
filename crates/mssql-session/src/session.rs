//! The per-session protocol state object.
//!
//! A [`Session`] owns the framed transport, the paired packet buffers, the
//! replayable read pipeline, the timeout supervisor, and the transaction
//! registry. It is the unit of MARS multiplexing: one session per logical
//! request/response stream.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;
use tokio::time::Instant;

use mssql_codec::{AttentionSender, CodecError, Transport};
use tds_protocol::packet::PacketType;
use tds_protocol::token::{Done, EnvChange, LoginAck, ServerMessage, TokenType};

use crate::buffer::WriteBuffer;
use crate::config::SessionConfig;
use crate::diagnostics::{Diagnostics, DiagnosticsSnapshot};
use crate::error::{Result, SessionError, timeout_expired_message};
use crate::read::{Pipeline, ReadResult, ReadStatus};
use crate::snapshot::Snapshot;
use crate::timeout::TimeoutSupervisor;
use crate::transaction::TransactionRegistry;

/// Operation id meaning "not associated with any command"; never matched
/// by a cancel request.
pub const UNASSOCIATED_OPERATION: i64 = -1;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Marker object whose liveness identifies the current operation owner.
///
/// A command holds an `Arc<OperationOwner>` while it owns the session; the
/// session tracks only a weak reference, so an owner dropped without
/// closing is detectable as an orphan.
#[derive(Debug, Default)]
pub struct OperationOwner;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, login not yet acknowledged.
    PendingLogin,
    /// Login acknowledged; requests may be sent.
    LoggedIn,
    /// A fatal error occurred; the session must be discarded.
    Broken,
    /// Closed by the user.
    Closed,
}

/// State shared with cancel handles and the timeout watchdog.
#[derive(Debug)]
pub(crate) struct SessionShared {
    /// The session lock: diagnostics plus the cancel/close interlock.
    pub(crate) diagnostics: parking_lot::Mutex<Diagnostics>,
    pub(crate) cancelled: AtomicBool,
    pub(crate) pending_data: AtomicBool,
    pub(crate) broken: AtomicBool,
    pub(crate) closed: AtomicBool,
    pub(crate) in_pool: AtomicBool,
    pub(crate) force_sync: AtomicBool,
    pub(crate) activation_count: AtomicU32,
    pub(crate) owner: parking_lot::Mutex<Weak<OperationOwner>>,
    pub(crate) current_operation: AtomicI64,
    pub(crate) wake: Notify,
    pub(crate) session_id: u64,
}

impl SessionShared {
    fn new(session_id: u64) -> Self {
        Self {
            diagnostics: parking_lot::Mutex::new(Diagnostics::new()),
            cancelled: AtomicBool::new(false),
            pending_data: AtomicBool::new(false),
            broken: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            in_pool: AtomicBool::new(false),
            force_sync: AtomicBool::new(false),
            activation_count: AtomicU32::new(0),
            owner: parking_lot::Mutex::new(Weak::new()),
            current_operation: AtomicI64::new(UNASSOCIATED_OPERATION),
            wake: Notify::new(),
            session_id,
        }
    }
}

/// Publish the broken state before anyone inspects pending completions.
pub(crate) fn publish_broken(shared: &SessionShared) {
    shared.broken.store(true, Ordering::SeqCst);
    shared.diagnostics.lock().mark_broken();
    shared.wake.notify_waiters();
}

/// A token the session core decoded and handled itself.
#[derive(Debug, Clone)]
pub enum HandledToken {
    /// A completion token (DONE, DONEPROC, or DONEINPROC) with more to
    /// follow.
    Done(Done),
    /// An environment change was applied.
    EnvChange(tds_protocol::EnvChangeType),
    /// A server error was recorded in the diagnostics (by number).
    ServerError(i32),
    /// A server warning was recorded in the diagnostics (by number).
    ServerInfo(i32),
    /// Login acknowledged; the session is now logged in.
    LoginAck(LoginAck),
    /// A stored procedure return status.
    ReturnStatus(i32),
    /// A token type skimmed over without interpretation.
    Skipped(TokenType),
}

/// Outcome of skimming one token from the response stream.
#[derive(Debug, Clone)]
pub enum SkimOutcome {
    /// The core handled the token.
    Token(HandledToken),
    /// The response is fully consumed.
    Complete(Done),
    /// A data-bearing token (column metadata, row) the core does not
    /// decode. The type byte has been consumed; the caller decodes the
    /// body through the read pipeline.
    Unhandled(u8),
}

/// The per-session protocol state object.
pub struct Session<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    transport: Transport<T>,
    attention: AttentionSender<T>,
    pub(crate) pipeline: Pipeline,
    pub(crate) output: WriteBuffer,
    snapshot: Option<Snapshot>,
    shared: Arc<SessionShared>,
    timer: TimeoutSupervisor,
    registry: TransactionRegistry,
    pub(crate) config: SessionConfig,
    state: SessionState,
    spid: u16,
    pub(crate) pending_reset: bool,
    pub(crate) current_request_type: PacketType,
    watchdog_armed: bool,
}

impl<T> Session<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Create a session over an established transport stream.
    ///
    /// # Errors
    ///
    /// Fails when the configuration is invalid.
    pub fn new(stream: T, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let packet_size = config.packet_size_value();
        let session_id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let transport = Transport::new(stream, packet_size);
        let attention = transport.attention_sender();

        tracing::debug!(session_id, packet_size, "session created");

        Ok(Self {
            transport,
            attention,
            pipeline: Pipeline::new(packet_size),
            output: WriteBuffer::new(packet_size),
            snapshot: None,
            shared: Arc::new(SessionShared::new(session_id)),
            timer: TimeoutSupervisor::new(),
            registry: TransactionRegistry::new(),
            config,
            state: SessionState::PendingLogin,
            spid: 0,
            pending_reset: false,
            current_request_type: PacketType::SqlBatch,
            watchdog_armed: false,
        })
    }

    /// The session's diagnostic object id.
    #[must_use]
    pub fn session_id(&self) -> u64 {
        self.shared.session_id
    }

    /// The server process id echoed in response headers.
    #[must_use]
    pub fn spid(&self) -> u16 {
        self.spid
    }

    /// Lifecycle state; Broken and Closed take precedence.
    #[must_use]
    pub fn state(&self) -> SessionState {
        if self.shared.closed.load(Ordering::SeqCst) {
            SessionState::Closed
        } else if self.shared.broken.load(Ordering::SeqCst) {
            SessionState::Broken
        } else {
            self.state
        }
    }

    /// Whether a response is outstanding.
    #[must_use]
    pub fn pending_data(&self) -> bool {
        self.pipeline.pending_data()
    }

    /// Whether an attention is on the wire awaiting acknowledgment.
    #[must_use]
    pub fn attention_sent(&self) -> bool {
        self.attention.attention_sent()
    }

    /// The timeout supervisor (shared with the watchdog task).
    #[must_use]
    pub fn timer(&self) -> &TimeoutSupervisor {
        &self.timer
    }

    /// Access the read pipeline for token-parser collaborators.
    pub fn pipeline_mut(&mut self) -> &mut Pipeline {
        &mut self.pipeline
    }

    pub(crate) fn registry(&self) -> &TransactionRegistry {
        &self.registry
    }

    pub(crate) fn registry_mut(&mut self) -> &mut TransactionRegistry {
        &mut self.registry
    }

    pub(crate) fn transport(&self) -> &Transport<T> {
        &self.transport
    }

    /// Mark the session broken and wake anything blocked on it.
    pub(crate) fn mark_broken(&mut self) {
        publish_broken(&self.shared);
        self.attention.mark_dead();
    }

    pub(crate) fn ensure_usable(&self) -> Result<()> {
        match self.state() {
            SessionState::Closed => Err(SessionError::Closed),
            SessionState::Broken => Err(SessionError::Broken),
            _ => Ok(()),
        }
    }

    /// Close the session. Further operations fail with `Closed`.
    pub fn close(&mut self) {
        tracing::debug!(session_id = self.session_id(), "session closed");
        self.shared.closed.store(true, Ordering::SeqCst);
        self.state = SessionState::Closed;
        self.attention.mark_dead();
        self.shared.wake.notify_waiters();
        self.transport.cancel_outstanding();
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Record a server error. Flips the session into synchronous mode for
    /// the remainder of the current operation.
    pub fn add_error(&self, message: ServerMessage) {
        self.shared.diagnostics.lock().add_error(message);
        self.shared.force_sync.store(true, Ordering::Release);
    }

    /// Record a server warning. Also flips into synchronous mode.
    pub fn add_warning(&self, message: ServerMessage) {
        self.shared.diagnostics.lock().add_warning(message);
        self.shared.force_sync.store(true, Ordering::Release);
    }

    /// Drain all accumulated errors and warnings plus the broken bit.
    pub fn take_diagnostics(&self) -> DiagnosticsSnapshot {
        self.shared.diagnostics.lock().take_full_and_clear()
    }

    pub(crate) fn store_attention_diagnostics(&self) {
        self.shared.diagnostics.lock().store_for_attention();
    }

    pub(crate) fn restore_attention_diagnostics(&self) {
        self.shared.diagnostics.lock().restore_after_attention();
    }

    // =========================================================================
    // Ownership, activation, orphan detection
    // =========================================================================

    /// Activate the session for an owner (one MARS logical session use).
    pub fn activate(&self, owner: &Arc<OperationOwner>) {
        self.shared
            .activation_count
            .fetch_add(1, Ordering::AcqRel);
        *self.shared.owner.lock() = Arc::downgrade(owner);
        self.shared.in_pool.store(false, Ordering::Release);
    }

    /// Release one activation.
    pub fn deactivate(&self) {
        let previous = self.shared.activation_count.load(Ordering::Acquire);
        if previous > 0 {
            self.shared
                .activation_count
                .store(previous - 1, Ordering::Release);
        }
        if previous <= 1 {
            *self.shared.owner.lock() = Weak::new();
        }
    }

    /// Current activation count.
    #[must_use]
    pub fn activation_count(&self) -> u32 {
        self.shared.activation_count.load(Ordering::Acquire)
    }

    /// Whether the session is activated but its owner has been dropped
    /// without closing it.
    #[must_use]
    pub fn is_orphaned(&self) -> bool {
        self.shared.activation_count.load(Ordering::Acquire) > 0
            && self.shared.owner.lock().strong_count() == 0
    }

    /// Reclaim an orphaned session: drain any pending data and return it
    /// to the pool.
    pub async fn reclaim(&mut self) -> Result<()> {
        tracing::debug!(session_id = self.session_id(), "reclaiming orphaned session");
        if self.pipeline.pending_data() && !self.pipeline.message_complete() {
            self.drain_pending_data().await?;
        }
        *self.shared.owner.lock() = Weak::new();
        self.shared.activation_count.store(0, Ordering::Release);
        self.make_ready_for_reuse().await?;
        self.shared.in_pool.store(true, Ordering::Release);
        Ok(())
    }

    /// Whether the session is currently parked in the pool.
    #[must_use]
    pub fn in_pool(&self) -> bool {
        self.shared.in_pool.load(Ordering::Acquire)
    }

    /// Park the session in the pool. Requires a clean state.
    pub fn return_to_pool(&mut self) -> Result<()> {
        self.ensure_usable()?;
        if self.pipeline.pending_data() || self.attention.attention_sent() {
            return Err(SessionError::CorruptedStream {
                reason: "session returned to pool with work outstanding",
            });
        }
        self.shared.in_pool.store(true, Ordering::Release);
        Ok(())
    }

    /// Take the session out of the pool for use.
    pub fn take_from_pool(&self) {
        self.shared.in_pool.store(false, Ordering::Release);
    }

    /// Associate the in-flight operation with an id cancel can target.
    pub fn associate_operation(&self, operation_id: i64) {
        self.shared
            .current_operation
            .store(operation_id, Ordering::Release);
    }

    /// Count a result set opened (routed to the current transaction).
    pub fn open_result(&mut self) {
        self.pipeline.state.open_result = true;
        self.registry.open_result();
    }

    /// Count a result set closed.
    pub fn close_result(&mut self) -> Result<()> {
        self.pipeline.state.open_result = false;
        self.registry.close_result()
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    /// Get a handle for cancelling this session's in-flight operation from
    /// another task.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle<T> {
        CancelHandle {
            shared: Arc::clone(&self.shared),
            attention: self.attention.clone(),
            poll: self.config.cancel_poll_value(),
        }
    }

    // =========================================================================
    // Snapshot & replay
    // =========================================================================

    /// Begin recording packets so the current read can be replayed.
    pub fn snapshot(&mut self) {
        self.snapshot = Some(Snapshot::capture(&self.pipeline));
    }

    /// Restore the snapshot position; buffered packets will be delivered
    /// before the transport is asked for more.
    ///
    /// Returns false when no snapshot is active.
    pub fn replay(&mut self) -> bool {
        match self.snapshot.as_mut() {
            Some(snapshot) => {
                snapshot.begin_replay(&mut self.pipeline);
                true
            }
            None => false,
        }
    }

    /// Discard the snapshot; progress up to here is committed.
    pub fn commit_snapshot(&mut self) {
        self.snapshot = None;
    }

    /// Packets currently buffered for replay.
    #[must_use]
    pub fn snapshot_packet_count(&self) -> Option<usize> {
        self.snapshot.as_ref().map(Snapshot::packet_count)
    }

    // =========================================================================
    // Packet fetch (suspension resume)
    // =========================================================================

    /// Start a response: reset the pipeline and arm the operation timer.
    pub(crate) fn begin_response(&mut self) {
        self.pipeline.begin_response();
        self.shared.pending_data.store(true, Ordering::Release);
        let identity = self.timer.start(self.config.command_timeout_value());
        self.watchdog_armed = false;
        if !self.shared.force_sync.load(Ordering::Acquire) {
            if let Some(deadline) = self.timer.deadline() {
                self.arm_watchdog(identity, deadline);
            }
        }
    }

    fn arm_watchdog(&mut self, identity: u64, deadline: Instant) {
        self.watchdog_armed = true;
        let timer = self.timer.clone();
        let shared = Arc::clone(&self.shared);
        let attention = self.attention.clone();
        let grace = self.config.attention_grace_value();
        let poll = self.config.cancel_poll_value();

        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if !timer.expire_async(identity) {
                return;
            }
            tracing::debug!(
                session_id = shared.session_id,
                identity,
                "command timeout expired"
            );
            {
                let mut diagnostics = shared.diagnostics.lock();
                diagnostics.add_error(timeout_expired_message());
            }
            shared.force_sync.store(true, Ordering::Release);

            // A pool-member session must not emit attention: break it.
            if shared.in_pool.load(Ordering::Acquire) || shared.closed.load(Ordering::SeqCst) {
                publish_broken(&shared);
                attention.mark_dead();
                return;
            }

            shared.diagnostics.lock().store_for_attention();
            if attention.send_attention_bounded(poll).await.is_err() {
                publish_broken(&shared);
                attention.mark_dead();
                return;
            }
            if tokio::time::timeout(grace, attention.wait_ack()).await.is_err() {
                tracing::warn!(
                    session_id = shared.session_id,
                    "no attention acknowledgment within grace period"
                );
                publish_broken(&shared);
                attention.mark_dead();
            }
        });
    }

    /// Fetch the next packet into the pipeline: replayed packets first,
    /// then the live transport.
    pub(crate) async fn fetch_packet(&mut self) -> Result<()> {
        if let Some(snapshot) = self.snapshot.as_mut() {
            if let Some((header, payload)) = snapshot.next_replay() {
                self.pipeline.append_packet(&header, &payload)?;
                return Ok(());
            }
        }

        if self.pipeline.message_complete() {
            return Err(SessionError::CorruptedStream {
                reason: "read past end of response",
            });
        }
        self.ensure_usable()?;

        let packet = if self.watchdog_armed {
            // Asynchronous wait: the watchdog owns expiration; a broken
            // publication wakes us out of the read. The waiter registers
            // before the broken flag is re-checked, so the publication
            // cannot slip between check and wait.
            let wake = Arc::clone(&self.shared);
            let notified = wake.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shared.broken.load(Ordering::SeqCst)
                || self.shared.closed.load(Ordering::SeqCst)
            {
                return Err(match self.state() {
                    SessionState::Closed => SessionError::Closed,
                    _ => SessionError::Broken,
                });
            }
            let outcome = tokio::select! {
                biased;
                _ = &mut notified => None,
                result = self.transport.read_packet() => Some(result),
            };
            match outcome {
                None => {
                    return Err(match self.state() {
                        SessionState::Closed => SessionError::Closed,
                        _ => SessionError::Broken,
                    });
                }
                Some(Ok(packet)) => packet,
                Some(Err(err)) => {
                    self.mark_broken();
                    return Err(err.into());
                }
            }
        } else {
            match self.timer.remaining() {
                Some(remaining) if remaining.is_zero() => {
                    return self.observe_sync_timeout().await;
                }
                Some(remaining) => match self.transport.read_packet_timeout(remaining).await {
                    Ok(packet) => packet,
                    Err(CodecError::WaitTimeout) => {
                        return self.observe_sync_timeout().await;
                    }
                    Err(err) => {
                        self.mark_broken();
                        return Err(err.into());
                    }
                },
                None => match self.transport.read_packet().await {
                    Ok(packet) => packet,
                    Err(err) => {
                        self.mark_broken();
                        return Err(err.into());
                    }
                },
            }
        };

        let Some(packet) = packet else {
            self.mark_broken();
            return Err(SessionError::Codec(CodecError::ConnectionClosed));
        };

        self.spid = packet.header.spid;
        let header = packet.header;
        let payload: Bytes = packet.payload.freeze();
        if let Some(snapshot) = self.snapshot.as_mut() {
            snapshot.record_packet(header, payload.clone());
        }
        self.pipeline.append_packet(&header, &payload)?;
        Ok(())
    }

    /// Expiration observed on the synchronous wait path.
    async fn observe_sync_timeout(&mut self) -> Result<()> {
        let identity = self.timer.identity();
        self.timer.expire_sync(identity);
        self.add_error(timeout_expired_message());

        if self.shared.in_pool.load(Ordering::Acquire) {
            // Pool invariants forbid attention from a pooled session.
            self.mark_broken();
            return Err(SessionError::Timeout);
        }
        if self.state != SessionState::LoggedIn {
            self.mark_broken();
            return Err(SessionError::Timeout);
        }

        self.store_attention_diagnostics();
        if self.attention.send_attention().await.is_err() {
            self.mark_broken();
            return Err(SessionError::Timeout);
        }
        self.drain_to_attention_ack().await?;
        Err(SessionError::Timeout)
    }

    /// Observed cancellation or expiration between reads: finish the
    /// attention cycle and surface the right error.
    async fn check_interrupts(&mut self) -> Result<()> {
        if self.shared.cancelled.load(Ordering::Acquire) {
            if self.attention.attention_sent() {
                self.drain_to_attention_ack().await?;
            }
            self.conclude_interrupted_operation();
            return Err(SessionError::Cancelled);
        }
        if self.timer.state().is_expired() {
            if self.attention.attention_sent() {
                self.drain_to_attention_ack().await?;
            }
            self.conclude_interrupted_operation();
            return Err(SessionError::Timeout);
        }
        Ok(())
    }

    fn conclude_interrupted_operation(&mut self) {
        self.shared.cancelled.store(false, Ordering::Release);
        self.attention.reset();
        self.shared.pending_data.store(false, Ordering::Release);
        self.pipeline.state.pending_data = false;
        self.snapshot = None;
        self.watchdog_armed = false;
        self.shared
            .current_operation
            .store(UNASSOCIATED_OPERATION, Ordering::Release);
    }

    /// Drive a pipeline read to completion, fetching packets as needed.
    pub(crate) async fn resume<V>(
        &mut self,
        mut op: impl FnMut(&mut Pipeline) -> ReadResult<V>,
    ) -> Result<V> {
        loop {
            self.check_interrupts().await?;
            match op(&mut self.pipeline)? {
                ReadStatus::Ready(value) => return Ok(value),
                ReadStatus::Suspended => self.fetch_packet().await?,
            }
        }
    }

    // =========================================================================
    // Awaitable reads
    // =========================================================================

    /// Read one byte, waiting for packets as needed.
    pub async fn read_u8(&mut self) -> Result<u8> {
        self.resume(Pipeline::try_read_u8).await
    }

    /// Read a little-endian u16.
    pub async fn read_u16(&mut self) -> Result<u16> {
        self.resume(Pipeline::try_read_u16).await
    }

    /// Read a little-endian i16.
    pub async fn read_i16(&mut self) -> Result<i16> {
        self.resume(Pipeline::try_read_i16).await
    }

    /// Read a little-endian u32.
    pub async fn read_u32(&mut self) -> Result<u32> {
        self.resume(Pipeline::try_read_u32).await
    }

    /// Read a little-endian i32.
    pub async fn read_i32(&mut self) -> Result<i32> {
        self.resume(Pipeline::try_read_i32).await
    }

    /// Read a little-endian u64.
    pub async fn read_u64(&mut self) -> Result<u64> {
        self.resume(Pipeline::try_read_u64).await
    }

    /// Read a little-endian i64.
    pub async fn read_i64(&mut self) -> Result<i64> {
        self.resume(Pipeline::try_read_i64).await
    }

    /// Read a little-endian f32.
    pub async fn read_f32(&mut self) -> Result<f32> {
        self.resume(Pipeline::try_read_f32).await
    }

    /// Read a little-endian f64.
    pub async fn read_f64(&mut self) -> Result<f64> {
        self.resume(Pipeline::try_read_f64).await
    }

    /// Read `len` bytes into `dest`, or skip them when `dest` is `None`.
    pub async fn read_bytes(&mut self, dest: Option<&mut Vec<u8>>, len: u64) -> Result<()> {
        let mut dest = dest;
        self.resume(move |pipeline| {
            pipeline.try_read_bytes(dest.as_mut().map(|d| &mut **d), len)
        })
        .await
    }

    /// Read a UTF-16LE string of `char_count` characters.
    pub async fn read_utf16_string(&mut self, char_count: usize) -> Result<String> {
        self.resume(move |pipeline| pipeline.try_read_utf16_string(char_count))
            .await
    }

    /// Read a string in the given encoding; `Ok(None)` means NULL.
    pub async fn read_string(
        &mut self,
        encoding: &'static encoding_rs::Encoding,
        len: u64,
        is_plp: bool,
    ) -> Result<Option<String>> {
        self.resume(move |pipeline| pipeline.try_read_string(encoding, len, is_plp))
            .await
    }

    /// Read the 8-byte PLP length field.
    pub async fn read_plp_length(&mut self) -> Result<tds_protocol::PlpLength> {
        self.resume(Pipeline::try_read_plp_length).await
    }

    /// Read a whole PLP stream into `dest`; false means NULL.
    pub async fn read_plp_bytes(&mut self, dest: &mut Vec<u8>) -> Result<bool> {
        self.resume(|pipeline| pipeline.try_read_plp_bytes(dest))
            .await
    }

    /// Read and cache the null bitmap for an NBC row.
    pub async fn read_null_bitmap(&mut self, columns: usize) -> Result<()> {
        self.resume(move |pipeline| pipeline.try_read_null_bitmap(columns))
            .await
    }

    // =========================================================================
    // Token skimming
    // =========================================================================

    /// Read and handle one token from the response stream.
    ///
    /// Core tokens (completion, environment changes, errors, login-ack) are
    /// decoded and applied here; data-bearing tokens are surfaced as
    /// [`SkimOutcome::Unhandled`] for the token parser layered above.
    pub async fn skim_token(&mut self) -> Result<SkimOutcome> {
        let byte = self.read_u8().await?;
        let Some(token_type) = TokenType::from_u8(byte) else {
            self.mark_broken();
            return Err(SessionError::CorruptedStream {
                reason: "unrecognized token type",
            });
        };

        match token_type {
            TokenType::Done | TokenType::DoneProc | TokenType::DoneInProc => {
                let mut raw = Vec::with_capacity(Done::SIZE);
                self.read_bytes(Some(&mut raw), Done::SIZE as u64).await?;
                let done = Done::decode(&mut raw.as_slice())?;
                self.on_done(done)
            }
            TokenType::EnvChange => {
                let body = self.read_token_body().await?;
                let env = EnvChange::decode(&mut body.as_slice())?;
                self.apply_env_change(&env).await;
                Ok(SkimOutcome::Token(HandledToken::EnvChange(env.env_type)))
            }
            TokenType::Error => {
                let body = self.read_token_body().await?;
                let message = ServerMessage::decode(&mut body.as_slice())?;
                let number = message.number;
                self.pipeline.state.error_token_received = true;
                let fatal = message.is_fatal();
                self.add_error(message);
                if fatal {
                    self.mark_broken();
                }
                Ok(SkimOutcome::Token(HandledToken::ServerError(number)))
            }
            TokenType::Info => {
                let body = self.read_token_body().await?;
                let message = ServerMessage::decode(&mut body.as_slice())?;
                let number = message.number;
                self.add_warning(message);
                Ok(SkimOutcome::Token(HandledToken::ServerInfo(number)))
            }
            TokenType::LoginAck => {
                let body = self.read_token_body().await?;
                let ack = LoginAck::decode(&mut body.as_slice())?;
                tracing::debug!(
                    session_id = self.session_id(),
                    server = %ack.prog_name,
                    "login acknowledged"
                );
                self.state = SessionState::LoggedIn;
                Ok(SkimOutcome::Token(HandledToken::LoginAck(ack)))
            }
            TokenType::ReturnStatus => {
                let status = self.read_i32().await?;
                Ok(SkimOutcome::Token(HandledToken::ReturnStatus(status)))
            }
            TokenType::Order | TokenType::SessionState => {
                let len = self.read_u16().await?;
                self.read_bytes(None, u64::from(len)).await?;
                Ok(SkimOutcome::Token(HandledToken::Skipped(token_type)))
            }
            TokenType::ColMetaData => {
                self.pipeline.state.col_metadata_received = true;
                Ok(SkimOutcome::Unhandled(byte))
            }
            TokenType::Row | TokenType::NbcRow => Ok(SkimOutcome::Unhandled(byte)),
        }
    }

    async fn read_token_body(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u16().await?;
        let mut body = Vec::with_capacity(usize::from(len));
        self.read_bytes(Some(&mut body), u64::from(len)).await?;
        Ok(body)
    }

    fn on_done(&mut self, done: Done) -> Result<SkimOutcome> {
        if done.is_attention_ack() {
            tracing::debug!(session_id = self.session_id(), "attention acknowledged");
            self.attention.ack_received();
            self.pipeline.state.attention_received = true;
            self.restore_attention_diagnostics();
        }
        if !done.status.more {
            self.pipeline.state.pending_data = false;
            self.shared.pending_data.store(false, Ordering::Release);
            let identity = self.timer.identity();
            self.timer.stop(identity);
            if self.pipeline.message_complete() && self.pipeline.remaining() == 0 {
                return Ok(SkimOutcome::Complete(done));
            }
        }
        Ok(SkimOutcome::Token(HandledToken::Done(done)))
    }

    async fn apply_env_change(&mut self, env: &EnvChange) {
        tracing::trace!(env_type = ?env.env_type, "environment change");
        if env.env_type.is_transaction_change() {
            self.registry.apply_env_change(env);
        } else if let Some(size) = env.packet_size() {
            if let Err(err) = self.set_packet_size(size as usize).await {
                tracing::warn!(%err, size, "could not apply negotiated packet size");
            }
        }
    }

    /// Consume tokens until the response completes; server errors recorded
    /// along the way surface here.
    pub async fn run_to_completion(&mut self) -> Result<Done> {
        loop {
            match self.skim_token().await? {
                SkimOutcome::Complete(done) => {
                    let diagnostics = self.take_diagnostics();
                    if let Some(error) = diagnostics.errors.into_iter().next() {
                        return Err(SessionError::Server(error));
                    }
                    return Ok(done);
                }
                SkimOutcome::Token(_) => {}
                SkimOutcome::Unhandled(_) => {
                    return Err(SessionError::CorruptedStream {
                        reason: "data token in a control response",
                    });
                }
            }
        }
    }

    // =========================================================================
    // Attention drain
    // =========================================================================

    /// Discard response bytes until the server's attention-ack DONE token.
    ///
    /// Attention may be acknowledged only after previously enqueued output,
    /// so whole packets are tossed (keeping a tail window for a completion
    /// token split across packets) until the end-of-message packet whose
    /// final token carries the attention bit.
    pub(crate) async fn drain_to_attention_ack(&mut self) -> Result<()> {
        if self.attention.attention_received() {
            return Ok(());
        }
        tracing::debug!(session_id = self.session_id(), "draining to attention ack");
        let grace = self.config.attention_grace_value();

        loop {
            if self.pipeline.message_complete() {
                let tail = self.pipeline.input.peek();
                let acked = contains_attention_ack(tail);
                let len = tail.len();
                self.pipeline.input.advance(len);
                if acked {
                    self.finish_attention_ack();
                    return Ok(());
                }
                self.mark_broken();
                return Err(SessionError::Broken);
            }

            // Toss all but a tail window wide enough to hold a DONE token.
            let buffered = self.pipeline.input.bytes_in_packet();
            let toss = buffered.saturating_sub(Done::SIZE + 1);
            if toss > 0 {
                self.pipeline.input.advance(toss);
            }

            match self.transport.read_packet_timeout(grace).await {
                Ok(Some(packet)) => {
                    let payload = packet.payload.freeze();
                    self.pipeline.append_packet(&packet.header, &payload)?;
                }
                Ok(None) => {
                    self.mark_broken();
                    return Err(SessionError::Codec(CodecError::ConnectionClosed));
                }
                Err(CodecError::WaitTimeout) => {
                    tracing::warn!(
                        session_id = self.session_id(),
                        "attention acknowledgment did not arrive within grace period"
                    );
                    self.mark_broken();
                    return Err(SessionError::Broken);
                }
                Err(err) => {
                    self.mark_broken();
                    return Err(err.into());
                }
            }
        }
    }

    fn finish_attention_ack(&mut self) {
        self.attention.ack_received();
        self.pipeline.state.attention_received = true;
        self.pipeline.state.pending_data = false;
        self.shared.pending_data.store(false, Ordering::Release);
        self.restore_attention_diagnostics();
    }

    /// Read and discard the rest of the current response.
    pub(crate) async fn drain_pending_data(&mut self) -> Result<()> {
        while !self.pipeline.message_complete() {
            self.fetch_packet().await?;
        }
        let len = self.pipeline.input.bytes_in_packet();
        self.pipeline.input.advance(len);
        self.pipeline.state.pending_data = false;
        self.shared.pending_data.store(false, Ordering::Release);
        Ok(())
    }

    /// Reset per-operation state so the session can run another request.
    ///
    /// An attention on the wire must be acknowledged before reuse; the
    /// drain happens here if it has not happened yet.
    pub async fn make_ready_for_reuse(&mut self) -> Result<()> {
        self.ensure_usable()?;
        if self.attention.attention_sent() && !self.attention.attention_received() {
            self.drain_to_attention_ack().await?;
        }
        self.conclude_interrupted_operation();
        self.shared.force_sync.store(false, Ordering::Release);
        self.pipeline.begin_response();
        self.pipeline.state.pending_data = false;
        self.shared.pending_data.store(false, Ordering::Release);
        self.output.discard_message();
        let identity = self.timer.identity();
        self.timer.stop(identity);
        Ok(())
    }

    /// Change the negotiated packet size. Both buffers must be empty.
    pub async fn set_packet_size(&mut self, size: usize) -> Result<()> {
        if size < crate::config::MIN_PACKET_SIZE || size > tds_protocol::MAX_PACKET_SIZE {
            return Err(SessionError::InvalidPacketSize(size as u32));
        }
        self.pipeline.input.set_capacity(size)?;
        self.output.set_capacity(size)?;
        self.transport.set_max_packet_size(size).await;
        tracing::debug!(session_id = self.session_id(), size, "packet size changed");
        Ok(())
    }

    /// Request a server-side state reset on the next message.
    pub fn reset_connection(&mut self) {
        self.pending_reset = true;
    }

    pub(crate) fn attention_sender(&self) -> &AttentionSender<T> {
        &self.attention
    }

    pub(crate) fn cancelled_flag(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn clear_cancelled(&self) {
        self.shared.cancelled.store(false, Ordering::Release);
        self.attention.reset();
    }
}

impl<T> std::fmt::Debug for Session<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id())
            .field("state", &self.state())
            .field("spid", &self.spid)
            .field("pending_data", &self.pipeline.pending_data())
            .finish_non_exhaustive()
    }
}

/// Scan a payload tail for a DONE token with the attention bit.
fn contains_attention_ack(payload: &[u8]) -> bool {
    if payload.len() >= Done::SIZE + 1 {
        // The acknowledgment is normally the final token of the message.
        let at = payload.len() - (Done::SIZE + 1);
        if payload[at] == TokenType::Done as u8 {
            let status = u16::from_le_bytes([payload[at + 1], payload[at + 2]]);
            if status & 0x0020 != 0 {
                return true;
            }
        }
    }
    // Fall back to scanning for a DONE with the attention bit anywhere.
    for i in 0..payload.len().saturating_sub(2) {
        if payload[i] == TokenType::Done as u8 {
            let status = u16::from_le_bytes([payload[i + 1], payload[i + 2]]);
            if status & 0x0020 != 0 {
                return true;
            }
        }
    }
    false
}

/// Handle for cancelling a session's in-flight operation.
///
/// Cloneable and sendable to other tasks. Cancel is idempotent and a no-op
/// once the session is broken or closed.
pub struct CancelHandle<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    shared: Arc<SessionShared>,
    attention: AttentionSender<T>,
    poll: Duration,
}

impl<T> CancelHandle<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Cancel the operation identified by `operation_id`.
    ///
    /// The sentinel [`UNASSOCIATED_OPERATION`] is never matched. If
    /// response data is pending and no attention has been sent yet, an
    /// attention packet goes out under a bounded writer-lock wait.
    pub async fn cancel(&self, operation_id: i64) -> Result<()> {
        if operation_id == UNASSOCIATED_OPERATION {
            return Ok(());
        }

        // Bounded acquisition of the session lock: poll rather than park,
        // re-checking for a concurrent close.
        let needs_attention = loop {
            if self.shared.closed.load(Ordering::SeqCst)
                || self.shared.broken.load(Ordering::SeqCst)
            {
                return Ok(());
            }
            let Some(mut diagnostics) = self.shared.diagnostics.try_lock_for(self.poll) else {
                continue;
            };
            if self.shared.current_operation.load(Ordering::Acquire) != operation_id {
                return Ok(());
            }
            self.shared.cancelled.store(true, Ordering::SeqCst);
            tracing::debug!(
                session_id = self.shared.session_id,
                operation_id,
                "operation cancelled"
            );
            let needs_attention =
                self.shared.pending_data.load(Ordering::Acquire) && !self.attention.attention_sent();
            if needs_attention {
                diagnostics.store_for_attention();
            }
            break needs_attention;
        };

        if needs_attention {
            self.attention.send_attention_bounded(self.poll).await?;
        }
        Ok(())
    }

    /// Whether a cancellation is in progress.
    #[must_use]
    pub fn is_cancelling(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }
}

impl<T> Clone for CancelHandle<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            attention: self.attention.clone(),
            poll: self.poll,
        }
    }
}

impl<T> std::fmt::Debug for CancelHandle<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelling", &self.is_cancelling())
            .finish_non_exhaustive()
    }
}
