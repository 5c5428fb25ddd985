//! Agent runtime backed by a child process speaking JSON lines.
//!
//! One process is spawned per dispatch. The bridge writes the
//! [`DispatchContext`] as a single JSON line on stdin and closes it, then
//! reads stdout line by line:
//!
//! ```text
//! {"type":"assistant","delta":"Hi"}
//! {"type":"tool","phase":"start","name":"read_file","args":{"path":"a.txt"}}
//! {"type":"lifecycle","phase":"end"}
//! {"type":"deliver","kind":"final","text":"Hi there"}
//! ```
//!
//! Stream lines become [`AgentEvent`]s stamped with the run id and a
//! per-run sequence number. `deliver` lines go to the [`Deliverer`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tokio::sync::broadcast;

use super::{
    AgentError, AgentEvent, AgentRuntime, AgentStream, Deliverer, DeliveryKind, DispatchContext,
    ReplyPayload,
};

/// Buffer size for the event broadcast channel.
const EVENT_BUFFER_SIZE: usize = 256;

#[derive(Debug, Clone, Default)]
pub struct SubprocessConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

pub struct SubprocessRuntime {
    config: SubprocessConfig,
    event_tx: broadcast::Sender<AgentEvent>,
}

impl SubprocessRuntime {
    pub fn new(config: SubprocessConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self { config, event_tx }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = self.config.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    async fn stderr_reader_task(stderr: ChildStderr, run_id: String) -> Option<String> {
        let mut lines = BufReader::new(stderr).lines();
        let mut last = None;
        while let Ok(Some(line)) = lines.next_line().await {
            if !line.trim().is_empty() {
                warn!("Agent stderr [{}]: {}", run_id, line);
                last = Some(line);
            }
        }
        last
    }
}

#[async_trait]
impl AgentRuntime for SubprocessRuntime {
    fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.event_tx.subscribe()
    }

    async fn dispatch(&self, context: DispatchContext, deliver: Deliverer) -> Result<(), AgentError> {
        let mut child = self.command().spawn().map_err(|source| AgentError::Spawn {
            command: self.config.command.clone(),
            source,
        })?;
        info!(
            "Spawned agent '{}' for run {} (pid {:?})",
            self.config.command,
            context.run_id,
            child.id()
        );

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (Some(mut stdin), Some(stdout)) = (stdin, stdout) else {
            return Err(AgentError::Protocol("agent process has no stdio".to_string()));
        };

        let stderr_task =
            stderr.map(|s| tokio::spawn(Self::stderr_reader_task(s, context.run_id.clone())));

        let mut line = serde_json::to_string(&context)
            .map_err(|e| AgentError::Protocol(format!("failed to serialize context: {e}")))?;
        line.push('\n');
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        drop(stdin);

        let mut lines = BufReader::new(stdout).lines();
        let mut seq = 0u64;
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match parse_output_line(&line) {
                Ok(OutputLine::Event { stream, data }) => {
                    seq += 1;
                    let event = AgentEvent {
                        run_id: context.run_id.clone(),
                        seq,
                        stream,
                        ts: chrono::Utc::now().timestamp_millis(),
                        data,
                    };
                    // no subscribers is fine
                    let _ = self.event_tx.send(event);
                }
                Ok(OutputLine::Deliver { kind, payload }) => deliver.deliver(payload, kind),
                Err(e) => {
                    let display: String = line.chars().take(200).collect();
                    warn!("Ignoring agent output line: {} ({})", e, display);
                }
            }
        }

        let status = child.wait().await?;
        let last_stderr = match stderr_task {
            Some(task) => task.await.ok().flatten(),
            None => None,
        };
        debug!("Agent run {} exited with {}", context.run_id, status);

        if status.success() {
            Ok(())
        } else {
            let mut message = format!("agent exited with {status}");
            if let Some(stderr) = last_stderr {
                message.push_str(": ");
                message.push_str(&stderr);
            }
            Err(AgentError::Dispatch(message))
        }
    }
}

// ============================================================================
// Output parsing
// ============================================================================

#[derive(Debug, PartialEq)]
enum OutputLine {
    Event { stream: AgentStream, data: Value },
    Deliver { kind: DeliveryKind, payload: ReplyPayload },
}

fn parse_output_line(line: &str) -> Result<OutputLine, AgentError> {
    let value: Value =
        serde_json::from_str(line).map_err(|e| AgentError::Protocol(e.to_string()))?;
    let Value::Object(mut fields) = value else {
        return Err(AgentError::Protocol("expected a JSON object".to_string()));
    };
    let line_type = match fields.remove("type") {
        Some(Value::String(t)) => t,
        _ => return Err(AgentError::Protocol("missing 'type'".to_string())),
    };

    let stream = match line_type.as_str() {
        "assistant" => AgentStream::Assistant,
        "tool" => AgentStream::Tool,
        "lifecycle" => AgentStream::Lifecycle,
        "deliver" => {
            let kind = fields
                .remove("kind")
                .map(serde_json::from_value::<DeliveryKind>)
                .transpose()
                .map_err(|e| AgentError::Protocol(format!("invalid delivery kind: {e}")))?
                .unwrap_or(DeliveryKind::Final);
            let text = match fields.remove("text") {
                Some(Value::String(text)) => Some(text),
                _ => None,
            };
            return Ok(OutputLine::Deliver {
                kind,
                payload: ReplyPayload { text },
            });
        }
        other => return Err(AgentError::Protocol(format!("unknown line type '{other}'"))),
    };

    Ok(OutputLine::Event {
        stream,
        data: Value::Object(fields),
    })
}
