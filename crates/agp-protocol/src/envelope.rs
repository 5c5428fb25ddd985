//! Envelope, method and correlation types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;
use crate::session::{CancelPayload, PromptPayload, PromptResponsePayload, UpdatePayload};

// ============================================================================
// Method
// ============================================================================

/// Closed set of envelope methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Peer asks the agent to answer a prompt.
    SessionPrompt,
    /// Peer cancels an in-flight prompt.
    SessionCancel,
    /// Streamed progress for a prompt.
    SessionUpdate,
    /// Terminal response for a prompt.
    SessionPromptResponse,
}

impl Method {
    pub const ALL: [Method; 4] = [
        Method::SessionPrompt,
        Method::SessionCancel,
        Method::SessionUpdate,
        Method::SessionPromptResponse,
    ];

    /// Wire name of the method.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::SessionPrompt => "session.prompt",
            Method::SessionCancel => "session.cancel",
            Method::SessionUpdate => "session.update",
            Method::SessionPromptResponse => "session.promptResponse",
        }
    }

    /// Whether the method flows from the peer to the bridge.
    pub fn is_inbound(&self) -> bool {
        matches!(self, Method::SessionPrompt | Method::SessionCancel)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Method::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| DecodeError::UnknownMethod(s.to_string()))
    }
}

// ============================================================================
// Payload
// ============================================================================

/// Method-specific payload, one variant per [`Method`].
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Prompt(PromptPayload),
    Cancel(CancelPayload),
    Update(UpdatePayload),
    PromptResponse(PromptResponsePayload),
}

impl Payload {
    pub fn method(&self) -> Method {
        match self {
            Payload::Prompt(_) => Method::SessionPrompt,
            Payload::Cancel(_) => Method::SessionCancel,
            Payload::Update(_) => Method::SessionUpdate,
            Payload::PromptResponse(_) => Method::SessionPromptResponse,
        }
    }

    /// Session and prompt identifiers carried by every payload.
    pub fn turn_ids(&self) -> (&str, &str) {
        match self {
            Payload::Prompt(p) => (&p.session_id, &p.prompt_id),
            Payload::Cancel(p) => (&p.session_id, &p.prompt_id),
            Payload::Update(p) => (&p.session_id, &p.prompt_id),
            Payload::PromptResponse(p) => (&p.session_id, &p.prompt_id),
        }
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// Routing identifiers echoed between peers.
///
/// `guid` is the device identifier and `user_id` the account identifier.
/// The bridge carries them but never interprets them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correlation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl Correlation {
    pub fn new(guid: Option<String>, user_id: Option<String>) -> Self {
        Self { guid, user_id }
    }
}

/// One wire message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Sender-generated id, unique per logical message.
    pub msg_id: String,
    pub guid: Option<String>,
    pub user_id: Option<String>,
    pub payload: Payload,
}

impl Envelope {
    /// Build an envelope with a freshly generated `msg_id`.
    pub fn new(payload: Payload, correlation: &Correlation) -> Self {
        Self {
            msg_id: uuid::Uuid::new_v4().to_string(),
            guid: correlation.guid.clone(),
            user_id: correlation.user_id.clone(),
            payload,
        }
    }

    pub fn method(&self) -> Method {
        self.payload.method()
    }

    pub fn correlation(&self) -> Correlation {
        Correlation::new(self.guid.clone(), self.user_id.clone())
    }
}
