//! Connection manager: owns the transport link and drives the lifecycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::sync::{Mutex, RwLock, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use agp_protocol::{Correlation, Envelope, Method, Payload};

use super::lifecycle::{BackoffPolicy, ConnectionState, Lifecycle, ReconnectDecision, Transition};
use super::transport::{ConnectTarget, Frame, Transport, TransportEvent, TransportLink};
use super::{ConnectionError, ConnectionEvent};
use crate::dedup::{self, DedupCache};

/// Size of the lifecycle event broadcast channel.
const EVENT_BUFFER_SIZE: usize = 64;

/// Configuration for a [`ConnectionManager`].
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub target: ConnectTarget,
    /// Keepalive interval; keep well below the peer's idle timeout.
    pub heartbeat_interval: Duration,
    pub backoff: BackoffPolicy,
    pub dedup_capacity: usize,
    pub dedup_max_age: Option<Duration>,
    pub dedup_sweep_interval: Duration,
}

impl ConnectionConfig {
    pub fn new(target: ConnectTarget) -> Self {
        Self {
            target,
            heartbeat_interval: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
            dedup_capacity: dedup::DEFAULT_CAPACITY,
            dedup_max_age: Some(dedup::DEFAULT_MAX_AGE),
            dedup_sweep_interval: dedup::DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// Receives decoded, deduplicated envelopes for one method.
///
/// Handlers run on the inbound loop and must not block it; long work belongs
/// in a spawned task.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope);
}

/// Owns the duplex link to the peer.
///
/// The lifecycle state is written only here; other components observe it
/// through [`state`](Self::state), [`watch_state`](Self::watch_state) or
/// [`subscribe`](Self::subscribe).
pub struct ConnectionManager {
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    lifecycle: Mutex<Lifecycle>,
    state_tx: watch::Sender<ConnectionState>,
    /// Number of links that were open and have since ended.
    links_closed: watch::Sender<u64>,
    dedup: Mutex<DedupCache>,
    handlers: RwLock<HashMap<Method, Arc<dyn EnvelopeHandler>>>,
    /// Frame sender of the current link, present only while a link is up.
    outbound: RwLock<Option<mpsc::Sender<Frame>>>,
    events: broadcast::Sender<ConnectionEvent>,
    shutdown: Mutex<CancellationToken>,
    supervisor: Mutex<Option<JoinHandle<Result<(), ConnectionError>>>>,
    /// Held by the running supervisor task for its whole lifetime.
    running: Arc<Mutex<()>>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, transport: Arc<dyn Transport>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (links_closed, _) = watch::channel(0);
        let (events, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        let dedup = DedupCache::with_max_age(config.dedup_capacity, config.dedup_max_age);
        let lifecycle = Lifecycle::new(config.backoff.clone());

        Self {
            config,
            transport,
            lifecycle: Mutex::new(lifecycle),
            state_tx,
            links_closed,
            dedup: Mutex::new(dedup),
            handlers: RwLock::new(HashMap::new()),
            outbound: RwLock::new(None),
            events,
            shutdown: Mutex::new(CancellationToken::new()),
            supervisor: Mutex::new(None),
            running: Arc::new(Mutex::new(())),
        }
    }

    /// Register the handler for `method`, replacing any previous one.
    pub async fn on(&self, method: Method, handler: Arc<dyn EnvelopeHandler>) {
        self.handlers.write().await.insert(method, handler);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch lifecycle state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Identifies the current link: the number of links closed so far.
    pub fn link_epoch(&self) -> u64 {
        *self.links_closed.borrow()
    }

    /// Watch [`link_epoch`](Self::link_epoch). Unlike the event broadcast,
    /// this never drops a link loss.
    pub fn watch_link_epoch(&self) -> watch::Receiver<u64> {
        self.links_closed.subscribe()
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub async fn reconnect_attempts(&self) -> u32 {
        self.lifecycle.lock().await.reconnect_attempts()
    }

    /// Start connecting in the background. No-op if already running.
    ///
    /// After `stop()` this waits for the previous supervisor to wind down
    /// before starting a fresh one.
    pub async fn start(self: &Arc<Self>) {
        let mut shutdown = self.shutdown.lock().await;
        let running = match Arc::clone(&self.running).try_lock_owned() {
            Ok(guard) => guard,
            Err(_) if !shutdown.is_cancelled() => {
                warn!("Connection manager already running");
                return;
            }
            Err(_) => {
                debug!("Waiting for the stopped connection task to exit");
                Arc::clone(&self.running).lock_owned().await
            }
        };

        let token = CancellationToken::new();
        *shutdown = token.clone();
        self.lifecycle.lock().await.start();

        info!("Starting connection to {}", self.config.target.redacted_url());
        tokio::spawn(Arc::clone(self).sweep_loop(token.clone()));
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let _running = running;
            this.supervise(token).await
        });
        *self.supervisor.lock().await = Some(handle);
    }

    /// Stop the connection and suppress auto-reconnect until the next `start`.
    pub async fn stop(&self) {
        self.shutdown.lock().await.cancel();
        let transition = self.lifecycle.lock().await.stop();
        self.outbound.write().await.take();
        self.publish(transition);
        info!("Connection stopped");
    }

    /// Wait for the background supervisor to exit.
    ///
    /// Returns [`ConnectionError::ReconnectExhausted`] if it gave up.
    pub async fn wait_stopped(&self) -> Result<(), ConnectionError> {
        let handle = self.supervisor.lock().await.take();
        match handle {
            Some(handle) => handle
                .await
                .map_err(|e| ConnectionError::Transport(format!("supervisor task failed: {e}")))?,
            None => Ok(()),
        }
    }

    /// Best-effort, at-most-once send. Returns the generated `msg_id`.
    ///
    /// Rejected unless the connection is Connected. Never waits for delivery.
    pub async fn send(
        &self,
        payload: Payload,
        correlation: &Correlation,
    ) -> Result<String, ConnectionError> {
        let method = payload.method();
        if self.state() != ConnectionState::Connected {
            warn!("Dropping outbound {}: connection is {}", method, self.state());
            return Err(ConnectionError::NotConnected);
        }

        let Some(outbound) = self.outbound.read().await.clone() else {
            warn!("Dropping outbound {}: no active link", method);
            return Err(ConnectionError::NotConnected);
        };

        let (msg_id, text) = agp_protocol::encode(payload, correlation)?;
        match outbound.try_send(Frame::Text(text)) {
            Ok(()) => {
                debug!("Sent {} {}", method, msg_id);
                Ok(msg_id)
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Dropping outbound {}: send buffer full", method);
                Err(ConnectionError::Transport("send buffer full".to_string()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Dropping outbound {}: link closed", method);
                Err(ConnectionError::Closed)
            }
        }
    }

    // ========================================================================
    // Background tasks
    // ========================================================================

    async fn supervise(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), ConnectionError> {
        loop {
            let transition = self.lifecycle.lock().await.begin_connect();
            self.publish(transition);
            if shutdown.is_cancelled() {
                return Ok(());
            }

            let connected = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                result = self.transport.connect(&self.config.target) => result,
            };

            match connected {
                Ok(link) => self.run_link(link, &shutdown).await,
                Err(e) => {
                    warn!("Connection attempt failed: {}", e);
                    self.emit(ConnectionEvent::Error(e.to_string()));
                }
            }

            let decision = self.lifecycle.lock().await.on_connection_lost();
            let Some((transition, decision)) = decision else {
                return Ok(());
            };
            self.publish(transition);

            match decision {
                ReconnectDecision::Retry { attempt, delay } => {
                    warn!(
                        "Reconnecting in {}ms (attempt {})",
                        delay.as_millis(),
                        attempt
                    );
                    self.emit(ConnectionEvent::ReconnectScheduled { attempt, delay });
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                ReconnectDecision::Exhausted { attempts } => {
                    error!("Giving up after {} reconnect attempts", attempts);
                    let transition = self.lifecycle.lock().await.give_up();
                    self.publish(transition);
                    self.emit(ConnectionEvent::Exhausted { attempts });
                    // stops the sweep task
                    shutdown.cancel();
                    return Err(ConnectionError::ReconnectExhausted { attempts });
                }
            }
        }
    }

    /// Serve one link until it closes or shutdown is requested.
    async fn run_link(&self, link: TransportLink, shutdown: &CancellationToken) {
        let TransportLink {
            outbound,
            mut inbound,
        } = link;

        *self.outbound.write().await = Some(outbound.clone());
        let transition = self.lifecycle.lock().await.on_open();
        if transition.is_none() {
            // stopped while the connect was in flight
            self.outbound.write().await.take();
            let _ = outbound.try_send(Frame::Close);
            return;
        }
        self.publish(transition);

        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = outbound.try_send(Frame::Close);
                    break;
                }

                _ = heartbeat.tick() => {
                    if let Err(e) = outbound.try_send(Frame::Ping) {
                        warn!("Heartbeat failed: {}", e);
                    }
                }

                event = inbound.recv() => match event {
                    Some(TransportEvent::Message(text)) => self.dispatch_inbound(&text).await,
                    Some(TransportEvent::Pong) => debug!("Heartbeat acknowledged"),
                    Some(TransportEvent::Closed { reason }) => {
                        info!(
                            "Connection closed by peer: {}",
                            reason.as_deref().unwrap_or("no reason")
                        );
                        break;
                    }
                    Some(TransportEvent::Error(e)) => {
                        warn!("Connection error: {}", e);
                        self.emit(ConnectionEvent::Error(e));
                        break;
                    }
                    None => {
                        info!("Transport link dropped");
                        break;
                    }
                },
            }
        }

        self.outbound.write().await.take();
        self.links_closed.send_modify(|n| *n += 1);
    }

    /// Decode, dedup and dispatch one inbound frame.
    async fn dispatch_inbound(&self, text: &str) {
        let envelope = match agp_protocol::decode_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                let display: String = text.chars().take(200).collect();
                warn!("Dropping undecodable frame: {} ({})", e, display);
                self.emit(ConnectionEvent::Error(e.to_string()));
                return;
            }
        };

        {
            let mut dedup = self.dedup.lock().await;
            if dedup.seen(&envelope.msg_id) {
                debug!("Dropping replayed message {}", envelope.msg_id);
                return;
            }
            dedup.record(envelope.msg_id.clone());
        }

        let method = envelope.method();
        let handler = self.handlers.read().await.get(&method).cloned();
        match handler {
            Some(handler) => handler.handle(envelope).await,
            None => warn!("No handler for {}, dropping {}", method, envelope.msg_id),
        }
    }

    async fn sweep_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let period = self.config.dedup_sweep_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = self.dedup.lock().await.sweep();
                    if removed > 0 {
                        debug!("Dedup sweep removed {} ids", removed);
                    }
                }
            }
        }
    }

    fn publish(&self, transition: Option<Transition>) {
        if let Some(Transition { from, to }) = transition {
            info!("Connection state {} -> {}", from, to);
            self.state_tx.send_replace(to);
            self.emit(ConnectionEvent::StateChanged { from, to });
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }
}
