//! Per-session error and warning collections.
//!
//! Server errors and warnings accumulate here and are surfaced at the next
//! API boundary. While an attention is outstanding, the collections are
//! moved aside so that errors caused by the attention itself do not mask
//! the original failure.

use tds_protocol::ServerMessage;

/// Everything drained from the session diagnostics in one call.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticsSnapshot {
    /// Accumulated server errors, in arrival order.
    pub errors: Vec<ServerMessage>,
    /// Accumulated server warnings, in arrival order.
    pub warnings: Vec<ServerMessage>,
    /// Whether the session broke while these accumulated.
    pub broken: bool,
}

/// The session's synchronised error and warning collections.
///
/// Guarded by the session lock; adding an error flips the session into
/// synchronous mode for the remainder of the current operation (the caller
/// observes that through [`Diagnostics::has_messages`]).
#[derive(Debug, Default)]
pub struct Diagnostics {
    errors: Vec<ServerMessage>,
    warnings: Vec<ServerMessage>,
    broken: bool,
    stored: Option<Stored>,
}

#[derive(Debug, Default)]
struct Stored {
    errors: Vec<ServerMessage>,
    warnings: Vec<ServerMessage>,
}

impl Diagnostics {
    /// Create empty collections.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a server error.
    pub fn add_error(&mut self, message: ServerMessage) {
        tracing::debug!(
            number = message.number,
            class = message.class,
            "recording server error"
        );
        self.errors.push(message);
    }

    /// Record a server warning (informational message).
    pub fn add_warning(&mut self, message: ServerMessage) {
        tracing::trace!(number = message.number, "recording server warning");
        self.warnings.push(message);
    }

    /// Mark the session broken; published with the next drain.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Whether any error has been recorded.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Whether any error or warning has been recorded.
    #[must_use]
    pub fn has_messages(&self) -> bool {
        !self.errors.is_empty() || !self.warnings.is_empty()
    }

    /// Number of recorded errors.
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Number of recorded warnings.
    #[must_use]
    pub fn warning_count(&self) -> usize {
        self.warnings.len()
    }

    /// Drain everything accumulated so far, together with the broken bit.
    pub fn take_full_and_clear(&mut self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            errors: std::mem::take(&mut self.errors),
            warnings: std::mem::take(&mut self.warnings),
            broken: self.broken,
        }
    }

    /// Move the current collections aside while an attention is
    /// outstanding.
    ///
    /// Anything recorded between store and restore was caused by the
    /// attention, not by the operation being cancelled.
    pub fn store_for_attention(&mut self) {
        if self.stored.is_some() {
            return;
        }
        self.stored = Some(Stored {
            errors: std::mem::take(&mut self.errors),
            warnings: std::mem::take(&mut self.warnings),
        });
    }

    /// Restore the collections moved aside by
    /// [`store_for_attention`](Self::store_for_attention).
    ///
    /// The original messages come back in front of anything recorded while
    /// the attention was outstanding.
    pub fn restore_after_attention(&mut self) {
        if let Some(stored) = self.stored.take() {
            let during_attention = std::mem::replace(&mut self.errors, stored.errors);
            self.errors.extend(during_attention);
            let during_attention = std::mem::replace(&mut self.warnings, stored.warnings);
            self.warnings.extend(during_attention);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn msg(number: i32) -> ServerMessage {
        ServerMessage {
            number,
            state: 1,
            class: 16,
            message: format!("error {number}"),
            server: String::new(),
            procedure: String::new(),
            line: 1,
        }
    }

    #[test]
    fn test_take_full_and_clear() {
        let mut diag = Diagnostics::new();
        diag.add_error(msg(1));
        diag.add_warning(msg(2));
        diag.mark_broken();

        let snapshot = diag.take_full_and_clear();
        assert_eq!(snapshot.errors.len(), 1);
        assert_eq!(snapshot.warnings.len(), 1);
        assert!(snapshot.broken);
        assert!(!diag.has_messages());
    }

    #[test]
    fn test_store_restore_preserves_original_order() {
        let mut diag = Diagnostics::new();
        diag.add_error(msg(100));

        diag.store_for_attention();
        assert!(!diag.has_errors());

        // Error caused by the attention itself
        diag.add_error(msg(200));

        diag.restore_after_attention();
        let snapshot = diag.take_full_and_clear();
        assert_eq!(snapshot.errors[0].number, 100);
        assert_eq!(snapshot.errors[1].number, 200);
    }

    #[test]
    fn test_store_is_idempotent() {
        let mut diag = Diagnostics::new();
        diag.add_error(msg(1));
        diag.store_for_attention();
        diag.store_for_attention();
        diag.restore_after_attention();
        assert_eq!(diag.error_count(), 1);
    }

    #[test]
    fn test_restore_without_store_is_noop() {
        let mut diag = Diagnostics::new();
        diag.add_error(msg(1));
        diag.restore_after_attention();
        assert_eq!(diag.error_count(), 1);
    }
}
