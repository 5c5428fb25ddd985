//! Session engine: wires the connection, registry and agent runtime together.
//!
//! Inbound `session.prompt` creates a Turn and drives it on its own task;
//! inbound `session.cancel` closes a Turn with `cancelled`. Every accepted
//! prompt gets exactly one terminal response unless the connection drops
//! first, in which case the Turn is abandoned and the peer has to re-issue
//! the prompt.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use agp_protocol::{Envelope, Method, Payload, PromptResponsePayload};

use crate::agent::{AgentRuntime, PromptRouter};
use crate::connection::{ConnectionError, ConnectionManager, EnvelopeHandler};
use crate::turn::{TurnDriver, TurnKey, TurnRegistry};

struct EngineInner {
    connection: Arc<ConnectionManager>,
    router: Arc<dyn PromptRouter>,
    registry: Arc<TurnRegistry>,
    driver: TurnDriver,
}

/// Facade over the bridge.
#[derive(Clone)]
pub struct SessionEngine {
    inner: Arc<EngineInner>,
}

impl SessionEngine {
    /// Build the engine and register its handlers on `connection`.
    pub async fn new(
        connection: Arc<ConnectionManager>,
        runtime: Arc<dyn AgentRuntime>,
        router: Arc<dyn PromptRouter>,
    ) -> Self {
        let registry = Arc::new(TurnRegistry::new());
        let driver = TurnDriver::new(Arc::clone(&connection), runtime, Arc::clone(&registry));
        let inner = Arc::new(EngineInner {
            connection,
            router,
            registry,
            driver,
        });

        // Handlers hold weak references; the connection must not keep the
        // engine alive.
        let handler: Arc<dyn EnvelopeHandler> = Arc::new(EngineHandler {
            engine: Arc::downgrade(&inner),
        });
        inner
            .connection
            .on(Method::SessionPrompt, Arc::clone(&handler))
            .await;
        inner.connection.on(Method::SessionCancel, handler).await;

        Self { inner }
    }

    /// Start the connection and abandon Active Turns whenever it drops.
    pub async fn start(&self) {
        let mut links = self.inner.connection.watch_link_epoch();
        let engine = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while links.changed().await.is_ok() {
                let epoch = *links.borrow_and_update();
                let Some(engine) = engine.upgrade() else { break };
                let abandoned = engine.registry.abandon_before(epoch).await;
                if abandoned > 0 {
                    warn!(abandoned, epoch, "Connection lost, abandoning active turns");
                } else {
                    debug!(epoch, "Link closed with no active turns");
                }
            }
        });

        self.inner.connection.start().await;
    }

    /// Stop the connection. Active Turns are abandoned.
    pub async fn shutdown(&self) {
        self.inner.connection.stop().await;
        let abandoned = self.inner.registry.abandon_all().await;
        info!(abandoned, "Session engine shut down");
    }

    /// Resolves when the connection supervisor exits.
    pub async fn wait(&self) -> Result<(), ConnectionError> {
        self.inner.connection.wait_stopped().await
    }

    pub fn active_turns(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.inner.connection
    }
}

struct EngineHandler {
    engine: Weak<EngineInner>,
}

#[async_trait]
impl EnvelopeHandler for EngineHandler {
    async fn handle(&self, envelope: Envelope) {
        let Some(engine) = self.engine.upgrade() else {
            debug!(msg_id = %envelope.msg_id, "Engine gone, dropping envelope");
            return;
        };
        match &envelope.payload {
            Payload::Prompt(_) => engine.on_prompt(envelope),
            Payload::Cancel(_) => engine.on_cancel(envelope).await,
            _ => warn!(method = %envelope.method(), "Unexpected inbound method"),
        }
    }
}

impl EngineInner {
    #[instrument(skip_all, fields(msg_id = %envelope.msg_id))]
    fn on_prompt(&self, envelope: Envelope) {
        let correlation = envelope.correlation();
        let Payload::Prompt(prompt) = envelope.payload else {
            return;
        };
        let key = TurnKey::new(&prompt.session_id, &prompt.prompt_id);

        let link = self.connection.link_epoch();
        let Some(turn) = self.registry.begin(key, correlation.clone(), link) else {
            warn!(
                session_id = %prompt.session_id,
                prompt_id = %prompt.prompt_id,
                "Turn already active, ignoring duplicate prompt"
            );
            return;
        };

        let context = self.router.route(&prompt, &correlation);
        info!(
            session_id = %prompt.session_id,
            prompt_id = %prompt.prompt_id,
            run_id = %context.run_id,
            session_key = %context.session_key,
            "Turn started"
        );

        let driver = self.driver.clone();
        tokio::spawn(async move {
            driver.run(turn, context).await;
        });
    }

    #[instrument(skip_all, fields(msg_id = %envelope.msg_id))]
    async fn on_cancel(&self, envelope: Envelope) {
        let correlation = envelope.correlation();
        let Payload::Cancel(cancel) = envelope.payload else {
            return;
        };
        let key = TurnKey::new(&cancel.session_id, &cancel.prompt_id);
        let response = PromptResponsePayload::cancelled(&cancel.session_id, &cancel.prompt_id);

        let sent = match self.registry.cancel(&key) {
            Some(turn) => {
                info!(
                    session_id = %key.session_id,
                    prompt_id = %key.prompt_id,
                    elapsed_ms = turn.elapsed().as_millis() as u64,
                    "Turn cancelled"
                );
                match turn.close(&self.connection, response.clone()).await {
                    Ok(true) => Ok(()),
                    // completion won the race; still acknowledge the cancel
                    Ok(false) => self
                        .connection
                        .send(Payload::PromptResponse(response), &correlation)
                        .await
                        .map(|_| ()),
                    Err(e) => Err(e),
                }
            }
            None => {
                info!(
                    session_id = %key.session_id,
                    prompt_id = %key.prompt_id,
                    "Cancel for unknown turn, acknowledging"
                );
                self.connection
                    .send(Payload::PromptResponse(response), &correlation)
                    .await
                    .map(|_| ())
            }
        };

        if let Err(e) = sent {
            warn!(prompt_id = %key.prompt_id, error = %e, "Cancel response not sent");
        }
    }
}
