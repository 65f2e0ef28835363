//! Reconnection state machine for outbound sessions.
//!
//! The machine is pure: it never touches sockets or timers. The engine
//! feeds it connect outcomes and acts on the returned [`Transition`].
//!
//! ```text
//! Disconnected --start--> Connecting --ok--> Connected
//!                            |                   |
//!                          fail                lost
//!                            v                   v
//!                    ReconnectPending <----------+   (attempts left)
//!                            |
//!                        retry due --> Connecting
//!
//! any failure with no attempts left --> Failed
//! ```

use std::fmt;
use std::time::Duration;

use crate::error::{Result, SessionError};
use crate::traits::{ReconnectPolicy, UNLIMITED_RECONNECTS};

/// Connection state of an outbound session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    /// Not connected and no attempt in flight
    Disconnected,
    /// Connect attempt in flight
    Connecting,
    /// Stream established
    Connected,
    /// Waiting for the reconnection interval to elapse
    ReconnectPending,
    /// Retries exhausted or disabled
    Failed,
}

impl fmt::Display for ConnectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectState::Disconnected => "Disconnected",
            ConnectState::Connecting => "Connecting",
            ConnectState::Connected => "Connected",
            ConnectState::ReconnectPending => "ReconnectPending",
            ConnectState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// What the engine must do after a failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Schedule a retry after `delay`
    Retry {
        /// Time to wait before the next attempt
        delay: Duration,
        /// Drop queued outbound data before retrying
        discard_send_queue: bool,
    },
    /// Give up; the session is terminal
    Failed,
}

/// Per-connector reconnection bookkeeping
#[derive(Debug, Clone)]
pub struct ReconnectMachine {
    policy: ReconnectPolicy,
    state: ConnectState,
    total_connect_count: u64,
    cur_reconnect_count: u32,
}

impl ReconnectMachine {
    /// New machine in `Disconnected`
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: ConnectState::Disconnected,
            total_connect_count: 0,
            cur_reconnect_count: 0,
        }
    }

    /// Current state
    pub fn state(&self) -> ConnectState {
        self.state
    }

    /// Successful connections over the machine's lifetime
    pub fn total_connect_count(&self) -> u64 {
        self.total_connect_count
    }

    /// Consecutive retries since the last success
    pub fn cur_reconnect_count(&self) -> u32 {
        self.cur_reconnect_count
    }

    /// Policy this machine follows
    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// First connect attempt
    pub fn start(&mut self) -> Result<()> {
        self.expect(ConnectState::Disconnected, "start")?;
        self.state = ConnectState::Connecting;
        Ok(())
    }

    /// Attempt succeeded
    pub fn on_connected(&mut self) -> Result<()> {
        self.expect(ConnectState::Connecting, "connected")?;
        self.state = ConnectState::Connected;
        self.total_connect_count += 1;
        self.cur_reconnect_count = 0;
        Ok(())
    }

    /// Attempt failed before a stream was established
    pub fn on_connect_failed(&mut self) -> Result<Transition> {
        self.expect(ConnectState::Connecting, "connect_failed")?;
        Ok(self.after_failure(false))
    }

    /// Established stream was lost
    pub fn on_disconnected(&mut self) -> Result<Transition> {
        self.expect(ConnectState::Connected, "disconnected")?;
        Ok(self.after_failure(self.policy.clean_all_data))
    }

    /// Reconnection interval elapsed
    pub fn on_retry_due(&mut self) -> Result<()> {
        self.expect(ConnectState::ReconnectPending, "retry_due")?;
        self.state = ConnectState::Connecting;
        Ok(())
    }

    /// Session closed on purpose; no further attempts
    pub fn shutdown(&mut self) {
        if self.state != ConnectState::Failed {
            self.state = ConnectState::Disconnected;
        }
    }

    fn after_failure(&mut self, discard_send_queue: bool) -> Transition {
        let max = self.policy.max_attempts;
        let allowed = max == UNLIMITED_RECONNECTS || self.cur_reconnect_count < max;

        if max == 0 || !allowed {
            self.state = ConnectState::Failed;
            return Transition::Failed;
        }

        self.cur_reconnect_count += 1;
        self.state = ConnectState::ReconnectPending;
        Transition::Retry {
            delay: self.policy.interval(),
            discard_send_queue,
        }
    }

    fn expect(&self, state: ConnectState, event: &'static str) -> Result<()> {
        if self.state != state {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                event,
            });
        }
        Ok(())
    }
}

impl fmt::Display for ReconnectMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ state={}, total_connect_count={}, cur_reconnect_count={} }}",
            self.state, self.total_connect_count, self.cur_reconnect_count
        )
    }
}
