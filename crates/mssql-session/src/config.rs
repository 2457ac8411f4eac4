//! Session configuration.

use std::time::Duration;

use tds_protocol::{DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE};

use crate::error::{Result, SessionError};

/// Smallest packet size a server will accept.
pub const MIN_PACKET_SIZE: usize = 512;

/// Default grace period for the server's attention acknowledgment.
pub const DEFAULT_ATTENTION_GRACE: Duration = Duration::from_secs(5);

/// Default poll interval for bounded lock acquisition on the cancel path.
pub const DEFAULT_CANCEL_POLL: Duration = Duration::from_millis(100);

/// Configuration for a session.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use mssql_session::SessionConfig;
///
/// let config = SessionConfig::new()
///     .packet_size(8192)
///     .command_timeout(Some(Duration::from_secs(30)));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct SessionConfig {
    packet_size: usize,
    command_timeout: Option<Duration>,
    attention_grace: Duration,
    cancel_poll: Duration,
}

impl SessionConfig {
    /// Create a configuration with defaults: 4096-byte packets, no command
    /// timeout, 5-second attention grace, 100-millisecond cancel polls.
    #[must_use]
    pub fn new() -> Self {
        Self {
            packet_size: DEFAULT_PACKET_SIZE,
            command_timeout: None,
            attention_grace: DEFAULT_ATTENTION_GRACE,
            cancel_poll: DEFAULT_CANCEL_POLL,
        }
    }

    /// Set the negotiated packet size. Input and output buffers share it.
    #[must_use]
    pub fn packet_size(mut self, size: usize) -> Self {
        self.packet_size = size;
        self
    }

    /// Set the per-command timeout. `None` or a zero duration means wait
    /// forever.
    #[must_use]
    pub fn command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = match timeout {
            Some(t) if t.is_zero() => None,
            other => other,
        };
        self
    }

    /// Set the grace period to wait for an attention acknowledgment before
    /// declaring the session broken.
    #[must_use]
    pub fn attention_grace(mut self, grace: Duration) -> Self {
        self.attention_grace = grace;
        self
    }

    /// Set the poll interval used when the cancel path competes for the
    /// session and writer locks.
    #[must_use]
    pub fn cancel_poll(mut self, poll: Duration) -> Self {
        self.cancel_poll = poll;
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidPacketSize`] when the packet size is
    /// outside `512..=32767`.
    pub fn validate(&self) -> Result<()> {
        if self.packet_size < MIN_PACKET_SIZE || self.packet_size > MAX_PACKET_SIZE {
            return Err(SessionError::InvalidPacketSize(self.packet_size as u32));
        }
        Ok(())
    }

    /// The configured packet size.
    #[must_use]
    pub fn packet_size_value(&self) -> usize {
        self.packet_size
    }

    /// The configured command timeout, if any.
    #[must_use]
    pub fn command_timeout_value(&self) -> Option<Duration> {
        self.command_timeout
    }

    /// The attention acknowledgment grace period.
    #[must_use]
    pub fn attention_grace_value(&self) -> Duration {
        self.attention_grace
    }

    /// The cancel-path lock poll interval.
    #[must_use]
    pub fn cancel_poll_value(&self) -> Duration {
        self.cancel_poll
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.packet_size_value(), 4096);
        assert_eq!(config.command_timeout_value(), None);
        assert_eq!(config.attention_grace_value(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_packet_size_bounds() {
        assert!(SessionConfig::new().packet_size(511).validate().is_err());
        assert!(SessionConfig::new().packet_size(512).validate().is_ok());
        assert!(SessionConfig::new().packet_size(32767).validate().is_ok());
        assert!(SessionConfig::new().packet_size(32768).validate().is_err());
    }

    #[test]
    fn test_zero_timeout_means_infinite() {
        let config = SessionConfig::new().command_timeout(Some(Duration::ZERO));
        assert_eq!(config.command_timeout_value(), None);
    }
}
