//! Test utilities: an in-memory transport and a scripted agent runtime.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::{Notify, broadcast, mpsc};

use agp_bridge::agent::{
    AgentError, AgentEvent, AgentRuntime, AgentStream, Deliverer, DeliveryKind, DispatchContext,
    ReplyPayload,
};
use agp_bridge::connection::{
    BackoffPolicy, ConnectTarget, ConnectionConfig, ConnectionError, ConnectionManager,
    ConnectionState, Frame, Transport, TransportEvent, TransportLink,
};
use agp_protocol::Envelope;

pub const TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Transport
// ============================================================================

/// The peer's end of one in-memory link.
pub struct PeerLink {
    pub inbound: mpsc::Sender<TransportEvent>,
    pub outbound: mpsc::Receiver<Frame>,
}

impl PeerLink {
    pub async fn send_text(&self, text: impl Into<String>) {
        self.inbound
            .send(TransportEvent::Message(text.into()))
            .await
            .expect("manager dropped the link");
    }

    pub async fn send_json(&self, value: Value) {
        self.send_text(value.to_string()).await;
    }

    /// Close the link from the peer side.
    pub async fn close(&self) {
        let _ = self
            .inbound
            .send(TransportEvent::Closed {
                reason: Some("peer closed".into()),
            })
            .await;
    }

    pub async fn next_frame(&mut self) -> Frame {
        tokio::time::timeout(TIMEOUT, self.outbound.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("link closed")
    }

    /// Next application envelope, skipping keepalives.
    pub async fn next_envelope(&mut self) -> Envelope {
        loop {
            match self.next_frame().await {
                Frame::Text(text) => return agp_protocol::decode_str(&text).expect("bad frame"),
                Frame::Ping => continue,
                Frame::Close => panic!("link closed while waiting for an envelope"),
            }
        }
    }

    /// Assert nothing but keepalives arrives within `wait`.
    pub async fn expect_silence(&mut self, wait: Duration) {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            match tokio::time::timeout_at(deadline, self.outbound.recv()).await {
                Err(_) => return,
                Ok(Some(Frame::Ping)) => continue,
                Ok(Some(Frame::Text(text))) => panic!("unexpected frame: {text}"),
                Ok(Some(Frame::Close)) | Ok(None) => return,
            }
        }
    }
}

/// In-memory transport. Each successful connect hands a [`PeerLink`] to the
/// test through the receiver returned by [`MemoryTransport::new`].
pub struct MemoryTransport {
    fail_first: AtomicU32,
    always_fail: bool,
    attempts: AtomicUsize,
    peers: mpsc::UnboundedSender<PeerLink>,
}

impl MemoryTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<PeerLink>) {
        Self::build(0, false)
    }

    pub fn failing_first(n: u32) -> (Arc<Self>, mpsc::UnboundedReceiver<PeerLink>) {
        Self::build(n, false)
    }

    pub fn always_failing() -> (Arc<Self>, mpsc::UnboundedReceiver<PeerLink>) {
        Self::build(0, true)
    }

    fn build(fail_first: u32, always_fail: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<PeerLink>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            fail_first: AtomicU32::new(fail_first),
            always_fail,
            attempts: AtomicUsize::new(0),
            peers,
        });
        (transport, rx)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, _target: &ConnectTarget) -> Result<TransportLink, ConnectionError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self.always_fail
            || self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if failing {
            return Err(ConnectionError::Transport("connection refused".into()));
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let _ = self.peers.send(PeerLink {
            inbound: inbound_tx,
            outbound: outbound_rx,
        });
        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

pub fn test_config() -> ConnectionConfig {
    let mut config = ConnectionConfig::new(ConnectTarget {
        url: "ws://peer.test/ws".into(),
        device_id: "device-1".into(),
        account_id: Some("account-1".into()),
        token: None,
    });
    config.heartbeat_interval = Duration::from_secs(60);
    config.backoff = BackoffPolicy {
        base: Duration::from_millis(10),
        cap: Duration::from_millis(50),
        max_attempts: 0,
    };
    config
}

/// Start `connection` and wait until it is Connected.
pub async fn connect(
    connection: &Arc<ConnectionManager>,
    peers: &mut mpsc::UnboundedReceiver<PeerLink>,
) -> PeerLink {
    connection.start().await;
    let peer = tokio::time::timeout(TIMEOUT, peers.recv())
        .await
        .expect("timed out waiting for connect")
        .expect("transport dropped");
    wait_for_state(connection, ConnectionState::Connected).await;
    peer
}

pub async fn wait_for_state(connection: &ConnectionManager, state: ConnectionState) {
    let mut rx = connection.watch_state();
    tokio::time::timeout(TIMEOUT, rx.wait_for(|s| *s == state))
        .await
        .expect("timed out waiting for state")
        .expect("state channel closed");
}

// ============================================================================
// Frames
// ============================================================================

pub fn prompt_frame(msg_id: &str, session_id: &str, prompt_id: &str, text: &str) -> Value {
    json!({
        "msg_id": msg_id,
        "guid": "device-1",
        "user_id": "account-1",
        "method": "session.prompt",
        "payload": {
            "session_id": session_id,
            "prompt_id": prompt_id,
            "agent_app": "assistant",
            "content": [{"type": "text", "text": text}]
        }
    })
}

pub fn cancel_frame(msg_id: &str, session_id: &str, prompt_id: &str) -> Value {
    json!({
        "msg_id": msg_id,
        "guid": "device-1",
        "user_id": "account-1",
        "method": "session.cancel",
        "payload": {
            "session_id": session_id,
            "prompt_id": prompt_id,
            "agent_app": "assistant"
        }
    })
}

// ============================================================================
// Agent runtime
// ============================================================================

#[derive(Clone)]
pub enum Step {
    Emit(AgentStream, Value),
    /// Emit an event stamped with another run id.
    EmitForeign(AgentStream, Value),
    Deliver(DeliveryKind, &'static str),
    /// Block until the gate is notified.
    Wait(Arc<Notify>),
    Fail(&'static str),
}

pub fn text(cumulative: &str) -> Step {
    Step::Emit(AgentStream::Assistant, json!({ "text": cumulative }))
}

pub fn delta(delta: &str) -> Step {
    Step::Emit(AgentStream::Assistant, json!({ "delta": delta }))
}

/// Runs the same script for every dispatch.
pub struct ScriptedRuntime {
    script: Vec<Step>,
    events: broadcast::Sender<AgentEvent>,
    contexts: Mutex<Vec<DispatchContext>>,
    finished: AtomicUsize,
    finished_notify: Notify,
}

impl ScriptedRuntime {
    pub fn new(script: Vec<Step>) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            script,
            events,
            contexts: Mutex::new(Vec::new()),
            finished: AtomicUsize::new(0),
            finished_notify: Notify::new(),
        })
    }

    pub fn dispatched(&self) -> usize {
        self.contexts.lock().unwrap().len()
    }

    pub fn contexts(&self) -> Vec<DispatchContext> {
        self.contexts.lock().unwrap().clone()
    }

    /// Wait until `n` dispatch calls have returned.
    pub async fn wait_finished(&self, n: usize) {
        tokio::time::timeout(TIMEOUT, async {
            loop {
                let notified = self.finished_notify.notified();
                if self.finished.load(Ordering::SeqCst) >= n {
                    return;
                }
                notified.await;
            }
        })
        .await
        .expect("timed out waiting for dispatch to finish");
    }

    async fn run_script(
        &self,
        context: &DispatchContext,
        deliver: &Deliverer,
    ) -> Result<(), AgentError> {
        let mut seq = 0;
        for step in &self.script {
            match step {
                Step::Emit(stream, data) | Step::EmitForeign(stream, data) => {
                    seq += 1;
                    let run_id = match step {
                        Step::EmitForeign(..) => format!("{}-other", context.run_id),
                        _ => context.run_id.clone(),
                    };
                    let _ = self.events.send(AgentEvent {
                        run_id,
                        seq,
                        stream: *stream,
                        ts: 0,
                        data: data.clone(),
                    });
                }
                Step::Deliver(kind, text) => deliver.deliver(ReplyPayload::text(*text), *kind),
                Step::Wait(gate) => gate.notified().await,
                Step::Fail(message) => return Err(AgentError::Dispatch(message.to_string())),
            }
            tokio::task::yield_now().await;
        }
        Ok(())
    }
}

#[async_trait]
impl AgentRuntime for ScriptedRuntime {
    fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    async fn dispatch(&self, context: DispatchContext, deliver: Deliverer) -> Result<(), AgentError> {
        self.contexts.lock().unwrap().push(context.clone());
        let result = self.run_script(&context, &deliver).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        self.finished_notify.notify_waiters();
        result
    }
}
