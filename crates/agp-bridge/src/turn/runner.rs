//! Drives one Turn from dispatch to terminal response.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::broadcast::{self, error::RecvError};

use agp_protocol::PromptResponsePayload;

use super::registry::{Turn, TurnRegistry};
use super::translator::TurnTranslator;
use crate::agent::{AgentError, AgentEvent, AgentRuntime, Deliverer, Delivery, DeliveryKind, DispatchContext};
use crate::connection::ConnectionManager;

/// How a Turn ended, as seen by the runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    Cancelled,
    Failed(String),
    /// Another party (cancel handler, abandonment) already closed the Turn.
    AlreadyClosed,
}

/// Everything a running Turn needs. Cheap to clone.
#[derive(Clone)]
pub struct TurnDriver {
    connection: Arc<ConnectionManager>,
    runtime: Arc<dyn AgentRuntime>,
    registry: Arc<TurnRegistry>,
}

impl TurnDriver {
    pub fn new(
        connection: Arc<ConnectionManager>,
        runtime: Arc<dyn AgentRuntime>,
        registry: Arc<TurnRegistry>,
    ) -> Self {
        Self {
            connection,
            runtime,
            registry,
        }
    }

    /// Subscribe, dispatch, forward progress, then close the Turn.
    pub async fn run(&self, turn: Arc<Turn>, context: DispatchContext) -> TurnOutcome {
        let key = turn.key();
        let mut translator = TurnTranslator::new(&key.session_id, &key.prompt_id);
        let mut replies = ReplyCollector::default();

        // Subscribe before dispatching so no early event is missed.
        let mut subscription = Some(self.runtime.subscribe());
        let (deliverer, mut deliveries) = Deliverer::channel();
        let run_id = context.run_id.clone();
        let dispatch = self.runtime.dispatch(context, deliverer);
        tokio::pin!(dispatch);

        let result = loop {
            tokio::select! {
                biased;

                _ = turn.cancelled(), if subscription.is_some() => {
                    debug!("Turn {} cancelled, unsubscribing", key);
                    subscription = None;
                }

                event = next_event(&mut subscription) => match event {
                    Ok(event) => self.forward(&turn, &mut translator, &run_id, &event).await,
                    Err(RecvError::Lagged(n)) => {
                        warn!("Turn {} lagged behind agent events, {} dropped", key, n);
                    }
                    Err(RecvError::Closed) => {
                        debug!("Agent event stream closed for turn {}", key);
                        subscription = None;
                    }
                },

                Some(delivery) = deliveries.recv() => replies.push(delivery),

                result = &mut dispatch => break result,
            }
        };

        // Events and replies already buffered belong to this run.
        if let Some(mut rx) = subscription.take() {
            loop {
                match rx.try_recv() {
                    Ok(event) => self.forward(&turn, &mut translator, &run_id, &event).await,
                    Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                    Err(_) => break,
                }
            }
        }
        while let Ok(delivery) = deliveries.try_recv() {
            replies.push(delivery);
        }

        self.complete(&turn, result, replies).await
    }

    async fn forward(
        &self,
        turn: &Turn,
        translator: &mut TurnTranslator,
        run_id: &str,
        event: &AgentEvent,
    ) {
        if event.run_id != run_id || turn.is_cancelled() {
            return;
        }
        for update in translator.translate(event) {
            if !turn.emit(&self.connection, update).await {
                debug!("Update for turn {} not sent", turn.key());
            }
        }
    }

    /// Sends the terminal response, then unregisters the Turn.
    async fn complete(
        &self,
        turn: &Arc<Turn>,
        result: Result<(), AgentError>,
        replies: ReplyCollector,
    ) -> TurnOutcome {
        let key = turn.key();

        let (response, outcome) = if turn.is_cancelled() {
            (
                PromptResponsePayload::cancelled(&key.session_id, &key.prompt_id),
                TurnOutcome::Cancelled,
            )
        } else {
            match result {
                Ok(()) => (
                    PromptResponsePayload::end_turn(
                        &key.session_id,
                        &key.prompt_id,
                        replies.into_text(),
                    ),
                    TurnOutcome::Completed,
                ),
                Err(e) => {
                    let message = e.to_string();
                    (
                        PromptResponsePayload::error(&key.session_id, &key.prompt_id, &message),
                        TurnOutcome::Failed(message),
                    )
                }
            }
        };

        let closed = turn.close(&self.connection, response).await;
        self.registry.finish(turn);

        match closed {
            Ok(true) => {
                match &outcome {
                    TurnOutcome::Failed(message) => {
                        warn!("Turn {} failed after {:?}: {}", key, turn.elapsed(), message)
                    }
                    other => info!("Turn {} finished ({:?}) in {:?}", key, other, turn.elapsed()),
                }
                outcome
            }
            Ok(false) => {
                debug!("Turn {} was already closed", key);
                TurnOutcome::AlreadyClosed
            }
            Err(e) => {
                warn!("Terminal response for turn {} not sent: {}", key, e);
                outcome
            }
        }
    }
}

async fn next_event(
    subscription: &mut Option<broadcast::Receiver<AgentEvent>>,
) -> Result<AgentEvent, RecvError> {
    match subscription {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Collects replies pushed through the deliverer.
#[derive(Debug, Default)]
struct ReplyCollector {
    final_text: Option<String>,
    blocks: Vec<String>,
}

impl ReplyCollector {
    fn push(&mut self, delivery: Delivery) {
        let Some(text) = delivery.payload.text else {
            return;
        };
        match delivery.kind {
            DeliveryKind::Final => self.final_text = Some(text),
            DeliveryKind::Block => self.blocks.push(text),
            DeliveryKind::Tool => {}
        }
    }

    /// Last final reply, else the blocks joined in order.
    fn into_text(self) -> Option<String> {
        if self.final_text.is_some() {
            return self.final_text;
        }
        if self.blocks.is_empty() {
            None
        } else {
            Some(self.blocks.join("\n"))
        }
    }
}
