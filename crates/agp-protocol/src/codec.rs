//! Envelope codec.
//!
//! Decoding happens in two steps: the frame is parsed into a loosely typed
//! envelope (method as a string, payload as raw JSON), then the method is
//! resolved and the payload is parsed into the shape that method requires.
//! Each step has its own [`DecodeError`] variant.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::{Correlation, Envelope, Method, Payload};
use crate::error::{DecodeError, EncodeError};

#[derive(Debug, Serialize, Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    msg_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    guid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_id: Option<String>,
    #[serde(default)]
    method: String,
    #[serde(default)]
    payload: Value,
}

/// Decode a raw frame into a typed envelope.
pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    let raw: RawEnvelope = serde_json::from_slice(bytes).map_err(DecodeError::Json)?;
    from_raw(raw)
}

/// Decode a text frame into a typed envelope.
pub fn decode_str(text: &str) -> Result<Envelope, DecodeError> {
    decode(text.as_bytes())
}

/// Encode a payload into a text frame, stamping a fresh `msg_id`.
///
/// Returns the generated `msg_id` alongside the frame.
pub fn encode(payload: Payload, correlation: &Correlation) -> Result<(String, String), EncodeError> {
    let envelope = Envelope::new(payload, correlation);
    let text = encode_envelope(&envelope)?;
    Ok((envelope.msg_id, text))
}

/// Encode an already built envelope.
pub fn encode_envelope(envelope: &Envelope) -> Result<String, EncodeError> {
    let payload = match &envelope.payload {
        Payload::Prompt(p) => serde_json::to_value(p)?,
        Payload::Cancel(p) => serde_json::to_value(p)?,
        Payload::Update(p) => serde_json::to_value(p)?,
        Payload::PromptResponse(p) => serde_json::to_value(p)?,
    };
    let raw = RawEnvelope {
        msg_id: envelope.msg_id.clone(),
        guid: envelope.guid.clone(),
        user_id: envelope.user_id.clone(),
        method: envelope.method().as_str().to_string(),
        payload,
    };
    Ok(serde_json::to_string(&raw)?)
}

fn from_raw(raw: RawEnvelope) -> Result<Envelope, DecodeError> {
    if raw.method.is_empty() {
        return Err(DecodeError::MissingField("method"));
    }
    let method: Method = raw.method.parse()?;
    if raw.msg_id.is_empty() {
        return Err(DecodeError::MissingField("msg_id"));
    }

    let payload = match method {
        Method::SessionPrompt => Payload::Prompt(parse_payload(method, raw.payload)?),
        Method::SessionCancel => Payload::Cancel(parse_payload(method, raw.payload)?),
        Method::SessionUpdate => Payload::Update(parse_payload(method, raw.payload)?),
        Method::SessionPromptResponse => {
            Payload::PromptResponse(parse_payload(method, raw.payload)?)
        }
    };

    Ok(Envelope {
        msg_id: raw.msg_id,
        guid: raw.guid,
        user_id: raw.user_id,
        payload,
    })
}

fn parse_payload<T: DeserializeOwned>(method: Method, value: Value) -> Result<T, DecodeError> {
    serde_json::from_value(value).map_err(|source| DecodeError::InvalidPayload {
        method: method.as_str(),
        source,
    })
}
