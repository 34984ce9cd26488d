//! # Reconnect State Machine
//!
//! The transport-free core of the resilient WebSocket client. It owns the
//! connection state, the reconnect attempt counter and the disposed flag, and
//! turns every [`StreamEvent`] into a list of [`Effect`]s for the driver in
//! `resilient_wss` to carry out. Nothing here touches a socket or a timer, so
//! every transition is testable on its own.
//!
//! ```text
//! Idle -> Connecting -> Open -> (drop) Reconnecting -> Connecting -> ...
//!                                      close() from anywhere -> Closed
//! ```
//!
//! Two rules keep reconnects from being scheduled twice:
//! - only [`StreamEvent::Dropped`] schedules a reconnect; an error merely
//!   asks the driver to close the connection, which then reports the drop.
//! - once disposed, every event is ignored.

use std::time::Duration;

/// Default first reconnect delay.
pub const BASE_DELAY: Duration = Duration::from_millis(1_000);
/// Ceiling for the reconnect delay.
pub const MAX_BACKOFF: Duration = Duration::from_millis(30_000);

/// Lifecycle of one streaming handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, nothing attempted yet.
    Idle,
    /// A connection attempt is pending.
    Connecting,
    /// The connection is established and delivering messages.
    Open,
    /// The connection dropped and a reconnect timer is armed.
    Reconnecting,
    /// Disposed by the owner. Terminal.
    Closed,
}

/// Exponential reconnect schedule: `min(base_delay * 2^attempt, max_delay)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: BASE_DELAY,
            max_delay: MAX_BACKOFF,
        }
    }
}

impl ReconnectPolicy {
    /// Delay to wait before reconnect number `attempt` (0-based).
    ///
    /// The exponent grows without bound; overflow saturates and is clamped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Something that happened to the connection or its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent<M> {
    /// The owner (or the reconnect timer) wants a connection.
    ConnectRequested,
    /// The pending connection is established.
    Opened,
    /// An inbound message arrived.
    Message(M),
    /// The transport reported an error.
    Errored,
    /// The connection closed, remotely or after an error.
    Dropped,
    /// The reconnect delay elapsed.
    ReconnectTimerFired,
    /// The owner called `close()`.
    Disposed,
}

/// Work the driver must perform in response to an event.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect<M> {
    /// Start a new connection attempt.
    OpenConnection,
    /// Close the active connection, if any.
    CloseConnection,
    /// Invoke the owner's `on_open` hook.
    NotifyOpen,
    /// Invoke the owner's `on_close` hook.
    NotifyClose,
    /// Hand a message to the owner's `on_message` hook.
    Deliver(M),
    /// Arm the reconnect timer.
    ScheduleReconnect(Duration),
    /// Disarm the reconnect timer.
    CancelReconnect,
}

/// Explicit state for one streaming handle.
#[derive(Debug, Clone)]
pub struct ReconnectMachine {
    state: ConnectionState,
    attempt: u32,
    disposed: bool,
    policy: ReconnectPolicy,
}

impl ReconnectMachine {
    /// A fresh, idle machine.
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Idle,
            attempt: 0,
            disposed: false,
            policy,
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Reconnects scheduled since the last successful open.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether `close()` has been observed.
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Applies one event and returns the effects to perform, in order.
    pub fn handle<M>(&mut self, event: StreamEvent<M>) -> Vec<Effect<M>> {
        if self.disposed {
            return Vec::new();
        }

        match event {
            StreamEvent::ConnectRequested | StreamEvent::ReconnectTimerFired => {
                // At most one connection active or pending.
                if matches!(self.state, ConnectionState::Connecting | ConnectionState::Open) {
                    return Vec::new();
                }
                self.state = ConnectionState::Connecting;
                vec![Effect::OpenConnection]
            }
            StreamEvent::Opened => {
                self.state = ConnectionState::Open;
                self.attempt = 0;
                vec![Effect::NotifyOpen]
            }
            StreamEvent::Message(message) => {
                if self.state == ConnectionState::Open {
                    vec![Effect::Deliver(message)]
                } else {
                    Vec::new()
                }
            }
            StreamEvent::Errored => vec![Effect::CloseConnection],
            StreamEvent::Dropped => {
                if !matches!(self.state, ConnectionState::Connecting | ConnectionState::Open) {
                    return Vec::new();
                }
                let delay = self.policy.delay_for(self.attempt);
                self.attempt = self.attempt.saturating_add(1);
                self.state = ConnectionState::Reconnecting;
                vec![Effect::NotifyClose, Effect::ScheduleReconnect(delay)]
            }
            StreamEvent::Disposed => {
                self.disposed = true;
                self.state = ConnectionState::Closed;
                vec![Effect::CancelReconnect, Effect::CloseConnection]
            }
        }
    }
}
