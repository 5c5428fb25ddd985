//! Turns: one prompt/response cycle each.
//!
//! - [`TurnRegistry`] tracks Active Turns keyed by `(session_id, prompt_id)`.
//! - [`TurnTranslator`] maps agent runtime events to `session.update`s.
//! - [`TurnDriver`] runs a Turn: subscribe, dispatch, forward, close.
//!
//! ```text
//!   prompt ─► Active ─┬─ dispatch Ok ──► Completed  (end_turn)
//!                     ├─ dispatch Err ─► Errored    (error)
//!                     └─ cancel ───────► Cancelled  (cancelled)
//! ```

mod registry;
mod runner;
mod translator;

pub use registry::{Turn, TurnKey, TurnRegistry};
pub use runner::{TurnDriver, TurnOutcome};
pub use translator::{TurnTranslator, classify_tool_kind};
