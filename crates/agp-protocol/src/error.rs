//! Codec error types.

use thiserror::Error;

/// Errors produced while decoding an inbound frame.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Frame is not valid JSON or does not have the envelope shape.
    #[error("malformed envelope: {0}")]
    Json(#[source] serde_json::Error),

    /// A required envelope field is missing or empty.
    #[error("envelope is missing required field `{0}`")]
    MissingField(&'static str),

    /// The `method` value is not part of the protocol.
    #[error("unknown method `{0}`")]
    UnknownMethod(String),

    /// The payload does not match the shape required by its method.
    #[error("invalid payload for {method}: {source}")]
    InvalidPayload {
        method: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors produced while encoding an outbound envelope.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("failed to serialize envelope: {0}")]
    Serialize(#[from] serde_json::Error),
}
