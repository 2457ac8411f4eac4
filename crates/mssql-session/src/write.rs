//! The write pipeline.
//!
//! Outbound bytes accumulate in the session's output buffer and leave as
//! packets on soft (more to follow) or hard (end of message) flushes. The
//! pipeline honours cancellation mid-request: nothing sent yet means the
//! message is simply discarded; once packets are on the wire the message
//! is terminated with EOM|IGNORE and the attention dance runs.

use tokio::io::{AsyncRead, AsyncWrite};

use tds_protocol::packet::{PacketStatus, PacketType};
use tds_protocol::request::{AllHeaders, encode_sql_batch};

use crate::error::{Result, SessionError};
use crate::secret::SecretHandle;
use crate::session::Session;

/// How a flush terminates the staged packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// More packets of this message follow: status `BATCH`, packet number
    /// advances.
    Soft,
    /// Last packet of the message: status `EOM`, packet number resets to 1.
    Hard,
}

impl<T> Session<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Begin staging a request message of the given packet type.
    pub fn begin_request(&mut self, packet_type: PacketType) {
        self.current_request_type = packet_type;
        self.output.begin_message();
    }

    /// Stage one byte, flushing a full buffer as a soft packet first.
    pub async fn write_u8(&mut self, value: u8) -> Result<()> {
        if self.output.is_full() {
            self.flush(FlushMode::Soft).await?;
        }
        self.output.push_u8(value);
        Ok(())
    }

    /// Stage a byte slice, spilling into soft packets as the buffer fills.
    pub async fn write_bytes(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            if self.output.is_full() {
                self.flush(FlushMode::Soft).await?;
            }
            let taken = self.output.push_slice(data);
            data = &data[taken..];
        }
        Ok(())
    }

    /// Stage a secret. The plaintext is materialised into the staged
    /// buffer only when the packet is handed to the transport.
    pub async fn write_secret(&mut self, handle: SecretHandle) -> Result<()> {
        if handle.len() > self.output.space_left() && !self.output.is_empty() {
            self.flush(FlushMode::Soft).await?;
        }
        self.output.push_secret(handle)
    }

    /// Emit the staged packet.
    ///
    /// # Errors
    ///
    /// [`SessionError::Cancelled`] when the request was cancelled: before
    /// any packet went out the message is discarded; afterwards the
    /// message is terminated with `EOM|IGNORE` and the attention
    /// acknowledgment is awaited.
    pub async fn flush(&mut self, mode: FlushMode) -> Result<()> {
        if self.cancelled_flag() {
            return self.flush_cancelled().await;
        }

        let mut status = match mode {
            FlushMode::Soft => PacketStatus::BATCH,
            FlushMode::Hard => PacketStatus::END_OF_MESSAGE,
        };
        // The reset flag rides only on the first packet of a message.
        if self.output.packets_sent() == 0 && self.pending_reset {
            status |= PacketStatus::RESET_CONNECTION;
            self.pending_reset = false;
        }

        let frame = self
            .output
            .take_packet(self.current_request_type, status, 0);

        match mode {
            FlushMode::Soft => {
                // Queued but not necessarily on the wire yet; accounted as
                // an outstanding write until the hard flush.
                self.transport().feed_raw(frame).await?;
            }
            FlushMode::Hard => {
                self.transport().send_raw(frame).await?;
                self.transport().wait_for_accumulated_writes().await?;
            }
        }
        Ok(())
    }

    async fn flush_cancelled(&mut self) -> Result<()> {
        if self.output.packets_sent() == 0 {
            // Nothing on the wire: the message simply never happened.
            tracing::debug!(
                session_id = self.session_id(),
                "request cancelled before first packet; discarding buffer"
            );
            self.output.discard_message();
            self.clear_cancelled();
            return Err(SessionError::Cancelled);
        }

        // Packets already sent: terminate the message so the server sees a
        // complete (ignored) request, then run the attention dance.
        let status = PacketStatus::END_OF_MESSAGE | PacketStatus::IGNORE;
        let frame = self
            .output
            .take_packet(self.current_request_type, status, 0);
        self.transport().send_raw(frame).await?;

        self.store_attention_diagnostics();
        self.attention_sender().send_attention().await?;
        self.pipeline.begin_response();
        self.drain_to_attention_ack().await?;
        self.clear_cancelled();
        Err(SessionError::Cancelled)
    }

    /// Wait until every queued packet has reached the wire.
    pub async fn wait_for_accumulated_writes(&mut self) -> Result<()> {
        self.transport().wait_for_accumulated_writes().await?;
        Ok(())
    }

    /// Finish the request: hard-flush the staged bytes and start the
    /// response clock.
    pub async fn finish_request(&mut self) -> Result<()> {
        self.flush(FlushMode::Hard).await?;
        self.begin_response();
        Ok(())
    }

    /// Send a complete request message and start the response clock.
    pub async fn send_request(&mut self, packet_type: PacketType, payload: &[u8]) -> Result<()> {
        self.ensure_usable()?;
        self.flush_deferred_rollback().await?;
        self.begin_request(packet_type);
        self.write_bytes(payload).await?;
        self.finish_request().await
    }

    /// Send a T-SQL batch with the session's transaction descriptor and
    /// outstanding-request count stamped in the ALL_HEADERS prefix.
    pub async fn send_sql_batch(&mut self, sql: &str) -> Result<()> {
        let headers = AllHeaders {
            transaction_descriptor: self.registry().current_descriptor(),
            outstanding_requests: 1,
        };
        let payload = encode_sql_batch(sql, &headers);
        self.send_request(PacketType::SqlBatch, &payload).await
    }

    /// Emit a rollback deferred by a dropped transaction handle.
    ///
    /// Disposal swallows non-fatal errors; fatal ones break the session.
    async fn flush_deferred_rollback(&mut self) -> Result<()> {
        if !self.registry_mut().take_deferred_rollback() {
            return Ok(());
        }
        tracing::debug!(
            session_id = self.session_id(),
            "rolling back abandoned transaction"
        );
        let headers = AllHeaders {
            transaction_descriptor: self.registry().current_descriptor(),
            outstanding_requests: 1,
        };
        let payload = encode_sql_batch("IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION", &headers);

        let result = async {
            self.begin_request(PacketType::SqlBatch);
            self.write_bytes(&payload).await?;
            self.finish_request().await?;
            self.run_to_completion().await.map(|_| ())
        }
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(err) if err.is_fatal() => {
                self.mark_broken();
                Err(err)
            }
            Err(err) => {
                tracing::warn!(%err, "implicit rollback failed; continuing");
                Ok(())
            }
        }
    }
}
