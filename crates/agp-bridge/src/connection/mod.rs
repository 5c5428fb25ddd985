//! Duplex connection to the AGP peer.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      ConnectionManager                           │
//! │  - Lifecycle state machine (Disconnected/Connecting/...)         │
//! │  - Reconnect backoff, heartbeat, dedup sweep                     │
//! │  - Decode -> dedup -> dispatch by method                         │
//! └───────────────┬──────────────────────────────────▲───────────────┘
//!                 │ Frame (Text/Ping/Close)          │ TransportEvent
//! ┌───────────────▼──────────────────────────────────┴───────────────┐
//! │                     Transport (trait)                            │
//! │  WsTransport: tokio-tungstenite pump task                        │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only the manager holds a transport link; everything else sends through
//! [`ConnectionManager::send`].

mod lifecycle;
mod manager;
mod transport;

use std::time::Duration;

use thiserror::Error;

pub use lifecycle::{BackoffPolicy, ConnectionState, Lifecycle, ReconnectDecision, Transition};
pub use manager::{ConnectionConfig, ConnectionManager, EnvelopeHandler};
pub use transport::{ConnectTarget, Frame, Transport, TransportEvent, TransportLink, WsTransport};

/// Errors raised by the connection layer.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Connecting or talking to the transport failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The transport link is gone.
    #[error("connection closed")]
    Closed,

    /// Reconnect ceiling reached; the manager gave up.
    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// Outbound send attempted while not connected.
    #[error("not connected")]
    NotConnected,

    #[error(transparent)]
    Codec(#[from] agp_protocol::EncodeError),
}

/// Lifecycle notifications for the owning process.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    ReconnectScheduled {
        attempt: u32,
        delay: Duration,
    },
    /// A recoverable error (decode failure, transport error).
    Error(String),
    /// Reconnect ceiling reached; the connection is now Disconnected.
    Exhausted {
        attempts: u32,
    },
}
