//! Agent runtime collaborator.
//!
//! The bridge never decides how a prompt is answered. It hands a
//! [`DispatchContext`] to an [`AgentRuntime`] and consumes two things back:
//! the runtime's broadcast event stream (text deltas, tool phases) and the
//! replies pushed through the [`Deliverer`] passed to `dispatch`.

mod router;
mod subprocess;

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

pub use router::{DefaultRouter, PromptRouter};
pub use subprocess::{SubprocessConfig, SubprocessRuntime};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum AgentError {
    /// The runtime ran and reported a failure.
    #[error("dispatch failed: {0}")]
    Dispatch(String),

    #[error("failed to spawn agent command '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("agent I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The runtime produced output the bridge could not understand.
    #[error("agent protocol error: {0}")]
    Protocol(String),
}

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStream {
    Assistant,
    Tool,
    Lifecycle,
}

/// One event from the runtime's event stream.
///
/// `data` is stream-specific; use [`assistant`](Self::assistant) and
/// [`tool`](Self::tool) to read it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEvent {
    pub run_id: String,
    pub seq: u64,
    pub stream: AgentStream,
    /// Milliseconds since the Unix epoch.
    pub ts: i64,
    #[serde(default)]
    pub data: Value,
}

impl AgentEvent {
    pub fn assistant(&self) -> Option<AssistantData> {
        match self.stream {
            AgentStream::Assistant => serde_json::from_value(self.data.clone()).ok(),
            _ => None,
        }
    }

    pub fn tool(&self) -> Option<ToolData> {
        match self.stream {
            AgentStream::Tool => serde_json::from_value(self.data.clone()).ok(),
            _ => None,
        }
    }
}

/// Assistant text. Runtimes send an incremental `delta`, a cumulative
/// `text`, or both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssistantData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolPhase {
    Start,
    Update,
    Result,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolData {
    pub phase: ToolPhase,
    pub name: String,
    #[serde(default, alias = "tool_call_id", skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    #[serde(default, alias = "partial_result", skip_serializing_if = "Option::is_none")]
    pub partial_result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, alias = "is_error", skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

// ============================================================================
// Deliveries
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryKind {
    Block,
    Tool,
    Final,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl ReplyPayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub kind: DeliveryKind,
    pub payload: ReplyPayload,
}

/// Reply callback handed to [`AgentRuntime::dispatch`].
#[derive(Debug, Clone)]
pub struct Deliverer {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl Deliverer {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn deliver(&self, payload: ReplyPayload, kind: DeliveryKind) {
        if self.tx.send(Delivery { kind, payload }).is_err() {
            debug!("Dropping {:?} delivery: turn no longer listening", kind);
        }
    }
}

// ============================================================================
// Runtime seam
// ============================================================================

/// Normalized context passed to the runtime for one prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchContext {
    /// Stamped on every event the runtime emits for this dispatch.
    pub run_id: String,
    pub session_key: String,
    pub session_id: String,
    pub prompt_id: String,
    pub agent_app: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
}

/// The agent runtime collaborator.
///
/// Events for every run go to every subscriber; consumers filter by
/// `run_id`. Dropping the receiver unsubscribes.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<AgentEvent>;

    /// Run one prompt to completion. May take arbitrarily long.
    async fn dispatch(&self, context: DispatchContext, deliver: Deliverer) -> Result<(), AgentError>;
}
