//! Translator from agent runtime events to `session.update` payloads.
//!
//! One translator per Turn. It is stateful: it remembers how much assistant
//! text has already been forwarded and which synthesized tool call ids are
//! still open.
//!
//! ## Rules
//!
//! 1. A text `delta` is forwarded verbatim and advances the emitted cursor.
//! 2. A cumulative `text` without a delta forwards only the suffix past the
//!    cursor, then moves the cursor to the end of the text.
//! 3. Tool phases map `start -> tool_call (in_progress)`,
//!    `update -> tool_call_update (in_progress)`,
//!    `result -> tool_call_update (completed | failed)`.
//! 4. Lifecycle events produce nothing.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use serde_json::Value;

use agp_protocol::{ContentBlock, Location, ToolCall, ToolCallStatus, ToolKind, UpdatePayload};

use crate::agent::{AgentEvent, AgentStream, AssistantData, ToolData, ToolPhase};

/// Process-wide counter for synthesized tool call ids.
static TOOL_CALL_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Per-Turn event translator.
#[derive(Debug)]
pub struct TurnTranslator {
    session_id: String,
    prompt_id: String,
    /// Bytes of assistant text already forwarded.
    emitted: usize,
    /// Synthesized ids of open invocations, per tool name, oldest first.
    pending_tools: HashMap<String, VecDeque<String>>,
}

impl TurnTranslator {
    pub fn new(session_id: impl Into<String>, prompt_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            prompt_id: prompt_id.into(),
            emitted: 0,
            pending_tools: HashMap::new(),
        }
    }

    /// Translate one runtime event into zero or more updates.
    pub fn translate(&mut self, event: &AgentEvent) -> Vec<UpdatePayload> {
        match event.stream {
            AgentStream::Assistant => match event.assistant() {
                Some(data) => self.on_assistant(data).into_iter().collect(),
                None => {
                    debug!("Ignoring malformed assistant event seq={}", event.seq);
                    vec![]
                }
            },
            AgentStream::Tool => match event.tool() {
                Some(data) => vec![self.on_tool(data)],
                None => {
                    debug!("Ignoring malformed tool event seq={}", event.seq);
                    vec![]
                }
            },
            AgentStream::Lifecycle => {
                debug!("Agent lifecycle [{}]: {}", event.run_id, event.data);
                vec![]
            }
        }
    }

    fn on_assistant(&mut self, data: AssistantData) -> Option<UpdatePayload> {
        let chunk = match (data.delta, data.text) {
            (Some(delta), _) => {
                self.emitted += delta.len();
                delta
            }
            (None, Some(text)) => {
                // A shorter text than already sent yields nothing.
                let suffix = text.get(self.emitted..).unwrap_or_default().to_string();
                self.emitted = self.emitted.max(text.len());
                suffix
            }
            (None, None) => return None,
        };

        if chunk.is_empty() {
            return None;
        }
        Some(UpdatePayload::message_chunk(
            &self.session_id,
            &self.prompt_id,
            chunk,
        ))
    }

    fn on_tool(&mut self, data: ToolData) -> UpdatePayload {
        let tool_call_id = self.resolve_tool_call_id(&data);

        match data.phase {
            ToolPhase::Start => UpdatePayload::tool_call(
                &self.session_id,
                &self.prompt_id,
                ToolCall {
                    tool_call_id,
                    title: Some(data.name.clone()),
                    kind: Some(classify_tool_kind(&data.name)),
                    status: ToolCallStatus::InProgress,
                    content: None,
                    locations: data.args.as_ref().and_then(locations_from_args),
                },
            ),
            ToolPhase::Update => UpdatePayload::tool_call_update(
                &self.session_id,
                &self.prompt_id,
                ToolCall {
                    tool_call_id,
                    title: None,
                    kind: None,
                    status: ToolCallStatus::InProgress,
                    content: data.partial_result.as_ref().and_then(render_content),
                    locations: None,
                },
            ),
            ToolPhase::Result => {
                let status = if data.is_error.unwrap_or(false) {
                    ToolCallStatus::Failed
                } else {
                    ToolCallStatus::Completed
                };
                UpdatePayload::tool_call_update(
                    &self.session_id,
                    &self.prompt_id,
                    ToolCall {
                        tool_call_id,
                        title: None,
                        kind: None,
                        status,
                        content: data.result.as_ref().and_then(render_content),
                        locations: None,
                    },
                )
            }
        }
    }

    /// Use the runtime's id, or correlate phases of one invocation through a
    /// synthesized id keyed by tool name.
    fn resolve_tool_call_id(&mut self, data: &ToolData) -> String {
        if let Some(ref id) = data.tool_call_id {
            return id.clone();
        }

        match data.phase {
            ToolPhase::Start => {
                let id = self.synthesize_tool_call_id();
                self.pending_tools
                    .entry(data.name.clone())
                    .or_default()
                    .push_back(id.clone());
                id
            }
            ToolPhase::Update => self
                .pending_tools
                .get(&data.name)
                .and_then(|ids| ids.front().cloned())
                .unwrap_or_else(|| self.synthesize_tool_call_id()),
            ToolPhase::Result => self
                .pending_tools
                .get_mut(&data.name)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| self.synthesize_tool_call_id()),
        }
    }

    fn synthesize_tool_call_id(&self) -> String {
        let n = TOOL_CALL_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-tool-{}", self.prompt_id, n)
    }
}

/// Display hint from the tool name. First matching keyword group wins.
pub fn classify_tool_kind(name: &str) -> ToolKind {
    const GROUPS: &[(&[&str], ToolKind)] = &[
        (&["read", "get", "view"], ToolKind::Read),
        (&["write", "edit", "replace"], ToolKind::Edit),
        (&["delete", "remove"], ToolKind::Delete),
        (&["search", "find", "grep"], ToolKind::Search),
        (&["fetch", "request", "http"], ToolKind::Fetch),
        (&["think", "reason"], ToolKind::Think),
        (&["exec", "run", "terminal"], ToolKind::Execute),
    ];

    let name = name.to_lowercase();
    GROUPS
        .iter()
        .find(|(keywords, _)| keywords.iter().any(|k| name.contains(k)))
        .map(|(_, kind)| *kind)
        .unwrap_or(ToolKind::Other)
}

fn locations_from_args(args: &Value) -> Option<Vec<Location>> {
    ["path", "file_path"]
        .iter()
        .find_map(|key| args.get(key).and_then(Value::as_str))
        .filter(|path| !path.is_empty())
        .map(|path| {
            vec![Location {
                path: path.to_string(),
            }]
        })
}

/// Strings verbatim, anything else as compact JSON. Null renders nothing.
fn render_content(value: &Value) -> Option<Vec<ContentBlock>> {
    let text = match value {
        Value::Null => return None,
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    Some(vec![ContentBlock::text(text)])
}
