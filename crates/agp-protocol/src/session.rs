//! Session payload types.
//!
//! Inbound payloads (`session.prompt`, `session.cancel`) are produced by the
//! peer; outbound payloads (`session.update`, `session.promptResponse`) are
//! produced by the bridge. Every payload is keyed by `(session_id, prompt_id)`.

use serde::{Deserialize, Serialize};

// ============================================================================
// Content
// ============================================================================

/// A content block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    /// Any block type this bridge does not understand (images, files, ...).
    #[serde(other)]
    Unsupported,
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text { text } => Some(text),
            ContentBlock::Unsupported => None,
        }
    }
}

// ============================================================================
// Inbound
// ============================================================================

/// `session.prompt` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptPayload {
    pub session_id: String,
    pub prompt_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_app: Option<String>,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

impl PromptPayload {
    /// Text blocks of the prompt joined with newlines.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// `session.cancel` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelPayload {
    pub session_id: String,
    pub prompt_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_app: Option<String>,
}

// ============================================================================
// Outbound: session.update
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateType {
    MessageChunk,
    ToolCall,
    ToolCallUpdate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Display hint for a tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Read,
    Edit,
    Delete,
    Search,
    Fetch,
    Think,
    Execute,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub path: String,
}

/// A tool invocation as reported to the peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_call_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ToolKind>,
    pub status: ToolCallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<ContentBlock>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locations: Option<Vec<Location>>,
}

/// `session.update` payload.
///
/// Unlike the prompt response, `content` here is a single block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatePayload {
    pub session_id: String,
    pub prompt_id: String,
    pub update_type: UpdateType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCall>,
}

impl UpdatePayload {
    pub fn message_chunk(
        session_id: impl Into<String>,
        prompt_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            prompt_id: prompt_id.into(),
            update_type: UpdateType::MessageChunk,
            content: Some(ContentBlock::text(text)),
            tool_call: None,
        }
    }

    pub fn tool_call(
        session_id: impl Into<String>,
        prompt_id: impl Into<String>,
        tool_call: ToolCall,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            prompt_id: prompt_id.into(),
            update_type: UpdateType::ToolCall,
            content: None,
            tool_call: Some(tool_call),
        }
    }

    pub fn tool_call_update(
        session_id: impl Into<String>,
        prompt_id: impl Into<String>,
        tool_call: ToolCall,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            prompt_id: prompt_id.into(),
            update_type: UpdateType::ToolCallUpdate,
            content: None,
            tool_call: Some(tool_call),
        }
    }

    /// Text of a `message_chunk` update.
    pub fn chunk_text(&self) -> Option<&str> {
        match self.update_type {
            UpdateType::MessageChunk => self.content.as_ref().and_then(ContentBlock::as_text),
            _ => None,
        }
    }
}

// ============================================================================
// Outbound: session.promptResponse
// ============================================================================

/// Terminal classification of a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    Cancelled,
    Refusal,
    Error,
}

/// `session.promptResponse` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptResponsePayload {
    pub session_id: String,
    pub prompt_id: String,
    pub stop_reason: StopReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<ContentBlock>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PromptResponsePayload {
    pub fn end_turn(
        session_id: impl Into<String>,
        prompt_id: impl Into<String>,
        text: Option<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            prompt_id: prompt_id.into(),
            stop_reason: StopReason::EndTurn,
            content: text.map(|t| vec![ContentBlock::text(t)]),
            error: None,
        }
    }

    pub fn cancelled(session_id: impl Into<String>, prompt_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            prompt_id: prompt_id.into(),
            stop_reason: StopReason::Cancelled,
            content: None,
            error: None,
        }
    }

    pub fn error(
        session_id: impl Into<String>,
        prompt_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            prompt_id: prompt_id.into(),
            stop_reason: StopReason::Error,
            content: None,
            error: Some(message.into()),
        }
    }
}
