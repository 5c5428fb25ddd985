//! AGP wire protocol.
//!
//! Defines the envelope exchanged between a remote AGP peer and the local
//! bridge, the method-specific payloads, and the codec that turns raw frames
//! into typed envelopes and back.
//!
//! ## Envelope shape
//!
//! ```text
//! { "msg_id": string, "guid"?: string, "user_id"?: string,
//!   "method": string, "payload": object }
//! ```
//!
//! | method                   | direction      | payload                    |
//! |--------------------------|----------------|----------------------------|
//! | `session.prompt`         | peer -> bridge | [`PromptPayload`]          |
//! | `session.cancel`         | peer -> bridge | [`CancelPayload`]          |
//! | `session.update`         | bridge -> peer | [`UpdatePayload`]          |
//! | `session.promptResponse` | bridge -> peer | [`PromptResponsePayload`]  |
//!
//! The codec is pure: no I/O, no retries. Decoding fails closed with a typed
//! [`DecodeError`] so the transport layer can log and drop bad frames.

pub mod codec;
pub mod envelope;
pub mod error;
pub mod session;

pub use codec::{decode, decode_str, encode, encode_envelope};
pub use envelope::{Correlation, Envelope, Method, Payload};
pub use error::{DecodeError, EncodeError};
pub use session::{
    CancelPayload, ContentBlock, Location, PromptPayload, PromptResponsePayload, StopReason,
    ToolCall, ToolCallStatus, ToolKind, UpdatePayload, UpdateType,
};
