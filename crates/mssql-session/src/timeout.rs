//! Timeout supervision for the in-flight operation.
//!
//! One single-shot timer per session. Every timed operation gets a fresh,
//! monotonically increasing identity; a timer firing with a stale identity
//! is dropped silently. Expiration is observed either on the synchronous
//! wait path (the packet read's deadline elapses) or asynchronously by the
//! armed watchdog task.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

/// State of the operation timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// No timed operation in flight.
    Stopped,
    /// A timed operation is running.
    Running,
    /// The watchdog observed expiration.
    ExpiredAsync,
    /// The synchronous wait path observed expiration.
    ExpiredSync,
}

impl TimerState {
    /// Whether expiration has been observed on either path.
    #[must_use]
    pub const fn is_expired(self) -> bool {
        matches!(self, Self::ExpiredAsync | Self::ExpiredSync)
    }
}

#[derive(Debug)]
struct TimerShared {
    state: parking_lot::Mutex<TimerState>,
    identity: AtomicU64,
    deadline: parking_lot::Mutex<Option<Instant>>,
}

/// The session's expiration clock.
#[derive(Debug, Clone)]
pub struct TimeoutSupervisor {
    shared: Arc<TimerShared>,
}

impl TimeoutSupervisor {
    /// Create a stopped supervisor.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(TimerShared {
                state: parking_lot::Mutex::new(TimerState::Stopped),
                identity: AtomicU64::new(0),
                deadline: parking_lot::Mutex::new(None),
            }),
        }
    }

    /// Start timing a new operation; returns the operation's timer
    /// identity.
    ///
    /// `None` (or an effective zero elsewhere) means wait forever: the
    /// timer runs with no deadline and can only be stopped.
    pub fn start(&self, timeout: Option<Duration>) -> u64 {
        let identity = self.shared.identity.fetch_add(1, Ordering::AcqRel) + 1;
        *self.shared.deadline.lock() = timeout.map(|t| Instant::now() + t);
        *self.shared.state.lock() = TimerState::Running;
        identity
    }

    /// Stop the timer if `identity` is still the current operation.
    pub fn stop(&self, identity: u64) -> bool {
        if self.shared.identity.load(Ordering::Acquire) != identity {
            return false;
        }
        let mut state = self.shared.state.lock();
        if *state == TimerState::Running {
            *state = TimerState::Stopped;
            *self.shared.deadline.lock() = None;
            true
        } else {
            false
        }
    }

    /// The current timer identity.
    #[must_use]
    pub fn identity(&self) -> u64 {
        self.shared.identity.load(Ordering::Acquire)
    }

    /// The current state.
    #[must_use]
    pub fn state(&self) -> TimerState {
        *self.shared.state.lock()
    }

    /// The current deadline, if a finite timeout is running.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        *self.shared.deadline.lock()
    }

    /// Time left before expiration. `None` means no deadline.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Record expiration observed on the synchronous wait path.
    ///
    /// Returns false (and changes nothing) for a stale identity or a timer
    /// that is not running.
    pub fn expire_sync(&self, identity: u64) -> bool {
        self.expire(identity, TimerState::ExpiredSync)
    }

    /// Record expiration observed by the watchdog.
    pub fn expire_async(&self, identity: u64) -> bool {
        self.expire(identity, TimerState::ExpiredAsync)
    }

    fn expire(&self, identity: u64, to: TimerState) -> bool {
        if self.shared.identity.load(Ordering::Acquire) != identity {
            tracing::trace!(identity, "dropping stale timer fire");
            return false;
        }
        let mut state = self.shared.state.lock();
        if *state == TimerState::Running {
            *state = to;
            true
        } else {
            false
        }
    }
}

impl Default for TimeoutSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
