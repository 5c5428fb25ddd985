//! AGP bridge.
//!
//! Connects a local agent runtime to a remote AGP peer over a persistent
//! duplex connection.
//!
//! ```text
//! frames ─► codec ─► dedup ─► ConnectionManager ─► SessionEngine
//!                                  ▲                    │ prompt / cancel
//!                                  │                    ▼
//!                    update /      │              TurnRegistry ─► AgentRuntime
//!                    promptResponse└──── TurnDriver ◄── events, deliveries
//! ```

pub mod agent;
pub mod config;
pub mod connection;
pub mod dedup;
pub mod engine;
pub mod turn;

pub use agent::{AgentError, AgentRuntime, DefaultRouter, PromptRouter, SubprocessRuntime};
pub use config::AppConfig;
pub use connection::{ConnectionError, ConnectionManager, ConnectionState, WsTransport};
pub use dedup::DedupCache;
pub use engine::SessionEngine;
pub use turn::{TurnKey, TurnRegistry};
