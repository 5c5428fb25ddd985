mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{Notify, mpsc};

use agp_bridge::agent::{AgentStream, DefaultRouter, DeliveryKind};
use agp_bridge::connection::{ConnectionManager, ConnectionState};
use agp_bridge::engine::SessionEngine;
use agp_protocol::{
    ContentBlock, Envelope, Payload, PromptResponsePayload, StopReason, ToolCallStatus, ToolKind,
    UpdatePayload, UpdateType,
};

use common::{
    MemoryTransport, PeerLink, ScriptedRuntime, Step, cancel_frame, delta, prompt_frame,
    test_config, text, wait_for_state,
};

const QUIET: Duration = Duration::from_millis(150);

struct Fixture {
    engine: SessionEngine,
    runtime: Arc<ScriptedRuntime>,
    peer: PeerLink,
    peers: mpsc::UnboundedReceiver<PeerLink>,
}

async fn fixture(script: Vec<Step>) -> Fixture {
    let (transport, mut peers) = MemoryTransport::new();
    let connection = Arc::new(ConnectionManager::new(test_config(), transport));
    let runtime = ScriptedRuntime::new(script);
    let engine = SessionEngine::new(
        Arc::clone(&connection),
        runtime.clone(),
        Arc::new(DefaultRouter::new("main")),
    )
    .await;

    engine.start().await;
    let peer = tokio::time::timeout(common::TIMEOUT, peers.recv())
        .await
        .expect("timed out waiting for connect")
        .expect("transport dropped");
    wait_for_state(&connection, ConnectionState::Connected).await;

    Fixture {
        engine,
        runtime,
        peer,
        peers,
    }
}

fn update(envelope: &Envelope) -> &UpdatePayload {
    match &envelope.payload {
        Payload::Update(update) => update,
        other => panic!("expected session.update, got {other:?}"),
    }
}

fn response(envelope: &Envelope) -> &PromptResponsePayload {
    match &envelope.payload {
        Payload::PromptResponse(response) => response,
        other => panic!("expected session.promptResponse, got {other:?}"),
    }
}

#[tokio::test]
async fn test_prompt_streams_chunks_then_one_end_turn() {
    let mut f = fixture(vec![
        text("Hi"),
        text("Hi there"),
        Step::Deliver(DeliveryKind::Final, "Hi there"),
    ])
    .await;

    f.peer.send_json(prompt_frame("m-1", "s1", "p1", "hello")).await;

    let first = f.peer.next_envelope().await;
    let second = f.peer.next_envelope().await;
    let done = f.peer.next_envelope().await;

    assert_eq!(update(&first).chunk_text(), Some("Hi"));
    assert_eq!(update(&second).chunk_text(), Some(" there"));

    let done_payload = response(&done);
    assert_eq!(done_payload.stop_reason, StopReason::EndTurn);
    assert_eq!(done_payload.session_id, "s1");
    assert_eq!(done_payload.prompt_id, "p1");
    assert_eq!(done_payload.content, Some(vec![ContentBlock::text("Hi there")]));

    // routing identifiers of the prompt are echoed back
    assert_eq!(done.guid.as_deref(), Some("device-1"));
    assert_eq!(done.user_id.as_deref(), Some("account-1"));

    f.peer.expect_silence(QUIET).await;
    assert_eq!(f.engine.active_turns(), 0);

    let ctx = &f.runtime.contexts()[0];
    assert_eq!(ctx.session_key, "agp:assistant:s1");
    assert_eq!(ctx.body, "hello");

    f.engine.shutdown().await;
}

#[tokio::test]
async fn test_events_from_other_runs_are_ignored() {
    let mut f = fixture(vec![
        Step::EmitForeign(AgentStream::Assistant, json!({"delta": "not mine"})),
        delta("mine"),
    ])
    .await;

    f.peer.send_json(prompt_frame("m-1", "s1", "p1", "hello")).await;

    assert_eq!(update(&f.peer.next_envelope().await).chunk_text(), Some("mine"));
    let done = f.peer.next_envelope().await;
    assert_eq!(response(&done).stop_reason, StopReason::EndTurn);
    assert_eq!(response(&done).content, None);

    f.engine.shutdown().await;
}

#[tokio::test]
async fn test_tool_phases_become_tool_updates() {
    let mut f = fixture(vec![
        Step::Emit(
            AgentStream::Tool,
            json!({"phase": "start", "name": "read_file", "toolCallId": "t1", "args": {"path": "notes.md"}}),
        ),
        Step::Emit(
            AgentStream::Tool,
            json!({"phase": "result", "name": "read_file", "toolCallId": "t1", "result": "contents", "isError": false}),
        ),
        Step::Deliver(DeliveryKind::Block, "read it"),
    ])
    .await;

    f.peer.send_json(prompt_frame("m-1", "s1", "p1", "read my notes")).await;

    let start = f.peer.next_envelope().await;
    let start = update(&start);
    assert_eq!(start.update_type, UpdateType::ToolCall);
    let call = start.tool_call.as_ref().unwrap();
    assert_eq!(call.tool_call_id, "t1");
    assert_eq!(call.kind, Some(ToolKind::Read));
    assert_eq!(call.status, ToolCallStatus::InProgress);

    let end = f.peer.next_envelope().await;
    let end = update(&end);
    assert_eq!(end.update_type, UpdateType::ToolCallUpdate);
    let call = end.tool_call.as_ref().unwrap();
    assert_eq!(call.status, ToolCallStatus::Completed);
    assert_eq!(call.content, Some(vec![ContentBlock::text("contents")]));

    let done = f.peer.next_envelope().await;
    assert_eq!(response(&done).content, Some(vec![ContentBlock::text("read it")]));

    f.engine.shutdown().await;
}

#[tokio::test]
async fn test_cancel_wins_over_later_completion() {
    let gate = Arc::new(Notify::new());
    let mut f = fixture(vec![
        delta("Hi"),
        Step::Wait(gate.clone()),
        delta(" late"),
        Step::Deliver(DeliveryKind::Final, "Hi late"),
    ])
    .await;

    f.peer.send_json(prompt_frame("m-1", "s1", "p1", "hello")).await;
    assert_eq!(update(&f.peer.next_envelope().await).chunk_text(), Some("Hi"));

    f.peer.send_json(cancel_frame("m-2", "s1", "p1")).await;
    let cancelled = f.peer.next_envelope().await;
    let payload = response(&cancelled);
    assert_eq!(payload.stop_reason, StopReason::Cancelled);
    assert_eq!(payload.content, None);
    assert_eq!(f.engine.active_turns(), 0);

    // dispatch finishes normally afterwards; nothing else may be sent
    gate.notify_one();
    f.runtime.wait_finished(1).await;
    f.peer.expect_silence(QUIET).await;

    f.engine.shutdown().await;
}

#[tokio::test]
async fn test_cancel_for_unknown_turn_still_answers() {
    let mut f = fixture(vec![]).await;

    f.peer.send_json(cancel_frame("m-1", "s1", "missing")).await;

    let envelope = f.peer.next_envelope().await;
    let payload = response(&envelope);
    assert_eq!(payload.stop_reason, StopReason::Cancelled);
    assert_eq!(payload.prompt_id, "missing");
    assert_eq!(envelope.guid.as_deref(), Some("device-1"));

    // the connection keeps serving
    f.peer.send_json(prompt_frame("m-2", "s1", "p2", "hello")).await;
    let done = f.peer.next_envelope().await;
    assert_eq!(response(&done).stop_reason, StopReason::EndTurn);

    f.engine.shutdown().await;
}

#[tokio::test]
async fn test_dispatch_failure_sends_error() {
    let mut f = fixture(vec![delta("partial"), Step::Fail("model unavailable")]).await;

    f.peer.send_json(prompt_frame("m-1", "s1", "p1", "hello")).await;

    assert_eq!(update(&f.peer.next_envelope().await).chunk_text(), Some("partial"));
    let envelope = f.peer.next_envelope().await;
    let payload = response(&envelope);
    assert_eq!(payload.stop_reason, StopReason::Error);
    assert!(
        payload
            .error
            .as_deref()
            .is_some_and(|e| e.contains("model unavailable"))
    );
    assert_eq!(f.engine.active_turns(), 0);

    // a failed turn does not take the connection down
    f.peer.send_json(cancel_frame("m-2", "s1", "p9")).await;
    assert_eq!(
        response(&f.peer.next_envelope().await).stop_reason,
        StopReason::Cancelled
    );

    f.engine.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_prompt_while_active_is_ignored() {
    let gate = Arc::new(Notify::new());
    let mut f = fixture(vec![Step::Wait(gate.clone()), Step::Deliver(DeliveryKind::Final, "once")]).await;

    f.peer.send_json(prompt_frame("m-1", "s1", "p1", "hello")).await;
    // same turn, new msg_id: a re-delivery the dedup cache cannot catch
    f.peer.send_json(prompt_frame("m-2", "s1", "p1", "hello")).await;
    // same msg_id: dropped by the dedup cache
    f.peer.send_json(prompt_frame("m-1", "s1", "p1", "hello")).await;

    f.peer.expect_silence(QUIET).await;
    assert_eq!(f.engine.active_turns(), 1);
    assert_eq!(f.runtime.dispatched(), 1);

    gate.notify_one();
    let done = f.peer.next_envelope().await;
    assert_eq!(response(&done).stop_reason, StopReason::EndTurn);
    f.peer.expect_silence(QUIET).await;
    assert_eq!(f.runtime.dispatched(), 1);

    f.engine.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_turns_each_get_one_response() {
    let mut f = fixture(vec![delta("x"), Step::Deliver(DeliveryKind::Final, "done")]).await;

    for i in 0..3 {
        f.peer
            .send_json(prompt_frame(&format!("m-{i}"), "s1", &format!("p{i}"), "go"))
            .await;
    }

    let mut terminal = Vec::new();
    let mut chunks = 0;
    while terminal.len() < 3 {
        let envelope = f.peer.next_envelope().await;
        match &envelope.payload {
            Payload::Update(_) => chunks += 1,
            Payload::PromptResponse(r) => terminal.push(r.prompt_id.clone()),
            other => panic!("unexpected payload {other:?}"),
        }
    }
    terminal.sort();
    assert_eq!(terminal, vec!["p0", "p1", "p2"]);
    assert_eq!(chunks, 3);
    f.peer.expect_silence(QUIET).await;

    f.engine.shutdown().await;
}

#[tokio::test]
async fn test_connection_loss_abandons_active_turns() {
    let gate = Arc::new(Notify::new());
    let mut f = fixture(vec![Step::Wait(gate.clone()), Step::Deliver(DeliveryKind::Final, "stale")]).await;

    f.peer.send_json(prompt_frame("m-1", "s1", "p1", "hello")).await;
    f.peer.expect_silence(QUIET).await;
    assert_eq!(f.engine.active_turns(), 1);

    f.peer.close().await;
    let mut next = tokio::time::timeout(common::TIMEOUT, f.peers.recv())
        .await
        .expect("no reconnect")
        .expect("transport dropped");
    wait_for_state(f.engine.connection(), ConnectionState::Connected).await;
    assert_eq!(f.engine.active_turns(), 0);

    // the orphaned dispatch finishing later is not answered on the new link
    gate.notify_one();
    f.runtime.wait_finished(1).await;
    next.expect_silence(QUIET).await;

    f.engine.shutdown().await;
}

#[tokio::test]
async fn test_cancel_racing_completion_never_precedes_end_turn() {
    let mut f = fixture(vec![Step::Deliver(DeliveryKind::Final, "done")]).await;

    for i in 0..20 {
        let prompt_id = format!("p{i}");
        f.peer
            .send_json(prompt_frame(&format!("m-{i}"), "s1", &prompt_id, "go"))
            .await;
        f.peer
            .send_json(cancel_frame(&format!("c-{i}"), "s1", &prompt_id))
            .await;

        // either the cancel closes the turn, or the completion goes out
        // first and the cancel is acknowledged after it
        let mut stops = Vec::new();
        loop {
            let envelope = f.peer.next_envelope().await;
            let payload = response(&envelope);
            assert_eq!(payload.prompt_id, prompt_id);
            stops.push(payload.stop_reason);
            if payload.stop_reason == StopReason::Cancelled {
                break;
            }
        }
        assert!(
            stops == [StopReason::Cancelled] || stops == [StopReason::EndTurn, StopReason::Cancelled],
            "unexpected terminal order {stops:?}"
        );
    }

    f.peer.expect_silence(QUIET).await;
    assert_eq!(f.engine.active_turns(), 0);

    f.engine.shutdown().await;
}

#[tokio::test]
async fn test_turns_abandoned_even_after_burst_of_bad_frames() {
    let gate = Arc::new(Notify::new());
    let mut f = fixture(vec![Step::Wait(gate.clone()), Step::Deliver(DeliveryKind::Final, "stale")]).await;
    let mut events = f.engine.connection().subscribe();

    f.peer.send_json(prompt_frame("m-1", "s1", "p1", "hello")).await;
    f.peer.expect_silence(QUIET).await;
    assert_eq!(f.engine.active_turns(), 1);

    // far more error events than the lifecycle broadcast buffers
    for i in 0..200 {
        f.peer.send_text(format!("{{garbage {i}")).await;
    }
    let epoch = f.engine.connection().link_epoch();
    f.peer.close().await;

    let mut next = tokio::time::timeout(common::TIMEOUT, f.peers.recv())
        .await
        .expect("no reconnect")
        .expect("transport dropped");
    wait_for_state(f.engine.connection(), ConnectionState::Connected).await;
    assert_eq!(f.engine.connection().link_epoch(), epoch + 1);
    assert!(matches!(
        events.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Lagged(_))
    ));

    tokio::time::timeout(common::TIMEOUT, async {
        while f.engine.active_turns() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("turn was not abandoned");

    gate.notify_one();
    f.runtime.wait_finished(1).await;
    next.expect_silence(QUIET).await;

    f.engine.shutdown().await;
}
