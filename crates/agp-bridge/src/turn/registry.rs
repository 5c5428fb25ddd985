//! Registry of in-flight Turns.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::debug;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use agp_protocol::{Correlation, Payload, PromptResponsePayload, UpdatePayload};

use crate::connection::{ConnectionError, ConnectionManager};

/// Identifies a Turn: `(session_id, prompt_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TurnKey {
    pub session_id: String,
    pub prompt_id: String,
}

impl TurnKey {
    pub fn new(session_id: impl Into<String>, prompt_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            prompt_id: prompt_id.into(),
        }
    }
}

impl fmt::Display for TurnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.session_id, self.prompt_id)
    }
}

/// One in-flight Turn.
///
/// All outbound traffic for the Turn goes through [`emit`](Self::emit) and
/// [`close`](Self::close), which share one lock. Once closed, nothing more is
/// sent, so the terminal response is always the last message and is sent at
/// most once.
#[derive(Debug)]
pub struct Turn {
    key: TurnKey,
    correlation: Correlation,
    cancel: CancellationToken,
    closed: Mutex<bool>,
    started_at: Instant,
    /// Link epoch the prompt arrived on.
    link: u64,
}

impl Turn {
    fn new(key: TurnKey, correlation: Correlation, link: u64) -> Self {
        Self {
            key,
            correlation,
            cancel: CancellationToken::new(),
            closed: Mutex::new(false),
            started_at: Instant::now(),
            link,
        }
    }

    pub fn key(&self) -> &TurnKey {
        &self.key
    }

    pub fn correlation(&self) -> &Correlation {
        &self.correlation
    }

    pub fn link(&self) -> u64 {
        self.link
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the Turn is cancelled or abandoned.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Send a progress update unless the Turn is cancelled or closed.
    /// Returns whether the update was handed to the connection.
    pub async fn emit(&self, connection: &ConnectionManager, update: UpdatePayload) -> bool {
        let closed = self.closed.lock().await;
        if *closed || self.is_cancelled() {
            return false;
        }
        connection
            .send(Payload::Update(update), &self.correlation)
            .await
            .is_ok()
    }

    /// Send the terminal response if none has been sent yet.
    ///
    /// Returns `Ok(false)` if the Turn was already closed. The Turn counts as
    /// closed even if the send itself fails.
    pub async fn close(
        &self,
        connection: &ConnectionManager,
        response: PromptResponsePayload,
    ) -> Result<bool, ConnectionError> {
        let mut closed = self.closed.lock().await;
        if *closed {
            return Ok(false);
        }
        *closed = true;
        connection
            .send(Payload::PromptResponse(response), &self.correlation)
            .await
            .map(|_| true)
    }

    /// Close without a terminal response and stop forwarding.
    async fn abandon(&self) {
        *self.closed.lock().await = true;
        self.cancel.cancel();
    }
}

/// Tracks Active Turns.
///
/// A Turn stays registered until its terminal response is out (or it was
/// cancelled or abandoned), so a cancel never overtakes a completion that is
/// already being sent.
#[derive(Debug, Default)]
pub struct TurnRegistry {
    turns: DashMap<TurnKey, Arc<Turn>>,
}

impl TurnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new Turn that arrived on link `link`. Returns `None` if one
    /// with the same key is already active.
    pub fn begin(&self, key: TurnKey, correlation: Correlation, link: u64) -> Option<Arc<Turn>> {
        match self.turns.entry(key) {
            Entry::Occupied(_) => None,
            Entry::Vacant(entry) => {
                let turn = Arc::new(Turn::new(entry.key().clone(), correlation, link));
                entry.insert(Arc::clone(&turn));
                Some(turn)
            }
        }
    }

    /// Remove `turn` if it is still the one registered under its key.
    pub fn finish(&self, turn: &Arc<Turn>) -> bool {
        self.turns
            .remove_if(&turn.key, |_, current| Arc::ptr_eq(current, turn))
            .is_some()
    }

    /// Remove a Turn and mark it cancelled.
    pub fn cancel(&self, key: &TurnKey) -> Option<Arc<Turn>> {
        let (_, turn) = self.turns.remove(key)?;
        turn.cancel.cancel();
        Some(turn)
    }

    /// Drop every Active Turn without sending anything. Returns how many.
    pub async fn abandon_all(&self) -> usize {
        self.abandon_where(|_| true).await
    }

    /// Drop the Turns that arrived on a link older than `link`.
    pub async fn abandon_before(&self, link: u64) -> usize {
        self.abandon_where(|turn| turn.link < link).await
    }

    async fn abandon_where(&self, pred: impl Fn(&Turn) -> bool) -> usize {
        let doomed: Vec<Arc<Turn>> = self
            .turns
            .iter()
            .filter(|entry| pred(entry.value().as_ref()))
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut abandoned = 0;
        for turn in doomed {
            if self.finish(&turn) {
                debug!("Abandoning turn {}", turn.key);
                turn.abandon().await;
                abandoned += 1;
            }
        }
        abandoned
    }

    pub fn contains(&self, key: &TurnKey) -> bool {
        self.turns.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}
