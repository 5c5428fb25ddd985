//! Connection lifecycle state machine and reconnect backoff.
//!
//! The state machine is pure: it never touches sockets or timers. The manager
//! feeds it transport outcomes and acts on the transitions and reconnect
//! decisions it returns.
//!
//! ```text
//!   start() ──► Connecting ──open──► Connected
//!                  ▲   │                 │ close/error
//!     backoff fires│   │ open failed     ▼
//!                  └── Reconnecting ◄────┘
//!                          │ attempts > max (give_up)
//!                          ▼
//!   stop() ──────────► Disconnected
//! ```

use std::fmt;
use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// Exponential reconnect backoff: `min(base * 1.5^(attempt-1), cap)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Maximum reconnect attempts; 0 means unlimited.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(3000),
            cap: Duration::from_millis(30_000),
            max_attempts: 0,
        }
    }
}

impl BackoffPolicy {
    const FACTOR: f64 = 1.5;

    /// Delay before reconnect attempt `attempt` (1-based), truncated to whole ms.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(128) as i32;
        let base_ms = self.base.as_millis() as f64;
        let cap_ms = self.cap.as_millis() as f64;
        let delay_ms = (base_ms * Self::FACTOR.powi(exponent)).min(cap_ms);
        Duration::from_millis(delay_ms as u64)
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts > 0 && attempts > self.max_attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Retry { attempt: u32, delay: Duration },
    Exhausted { attempts: u32 },
}

/// Lifecycle bookkeeping for one connection.
#[derive(Debug)]
pub struct Lifecycle {
    state: ConnectionState,
    attempts: u32,
    stopped: bool,
    policy: BackoffPolicy,
}

impl Lifecycle {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempts: 0,
            stopped: true,
            policy,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Allow the connection to run again after a stop.
    pub fn start(&mut self) {
        self.stopped = false;
        self.attempts = 0;
    }

    /// Disconnected (after start) or Reconnecting -> Connecting.
    pub fn begin_connect(&mut self) -> Option<Transition> {
        if self.stopped {
            return None;
        }
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Reconnecting => {
                self.move_to(ConnectionState::Connecting)
            }
            _ => None,
        }
    }

    /// Connecting -> Connected. Resets the attempt counter.
    pub fn on_open(&mut self) -> Option<Transition> {
        if self.stopped || self.state != ConnectionState::Connecting {
            return None;
        }
        self.attempts = 0;
        self.move_to(ConnectionState::Connected)
    }

    /// The link failed to open or dropped. Returns `None` once stopped.
    ///
    /// Always moves to Reconnecting. Past the attempt ceiling the decision is
    /// `Exhausted`, the lifecycle counts as stopped, and the caller finishes
    /// with [`give_up`](Self::give_up).
    pub fn on_connection_lost(&mut self) -> Option<(Option<Transition>, ReconnectDecision)> {
        if self.stopped || self.state == ConnectionState::Disconnected {
            return None;
        }

        self.attempts = self.attempts.saturating_add(1);
        let transition = self.move_to(ConnectionState::Reconnecting);
        if self.policy.exhausted(self.attempts) {
            self.stopped = true;
            return Some((
                transition,
                ReconnectDecision::Exhausted {
                    attempts: self.attempts,
                },
            ));
        }

        Some((
            transition,
            ReconnectDecision::Retry {
                attempt: self.attempts,
                delay: self.policy.delay_for(self.attempts),
            },
        ))
    }

    /// Reconnecting -> Disconnected after exhaustion.
    pub fn give_up(&mut self) -> Option<Transition> {
        if self.state != ConnectionState::Reconnecting {
            return None;
        }
        self.stopped = true;
        self.move_to(ConnectionState::Disconnected)
    }

    /// Any state -> Disconnected. Suppresses further reconnects until `start`.
    pub fn stop(&mut self) -> Option<Transition> {
        self.stopped = true;
        self.move_to(ConnectionState::Disconnected)
    }

    fn move_to(&mut self, to: ConnectionState) -> Option<Transition> {
        if self.state == to {
            return None;
        }
        let from = self.state;
        self.state = to;
        Some(Transition { from, to })
    }
}
