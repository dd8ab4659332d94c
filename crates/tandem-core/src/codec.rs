//! JSON framing for signaling messages.
//!
//! Wire format: one UTF-8 JSON object per WebSocket frame.

use crate::error::{RelayError, RelayResult};
use crate::signal::{SignalKind, SignalMessage};
use serde_json::Value;

/// Default upper bound for a single inbound frame (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1_048_576;

/// Classification of a structurally valid inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A message of a relayable kind.
    Signal(SignalMessage),
    /// Valid JSON that is not relayed. Carries the `type` string when present.
    Unrecognized { type_tag: Option<String> },
}

/// Decode one frame.
///
/// Errors only when the bytes are not UTF-8 JSON. JSON that lacks a
/// recognized `type` decodes to [`Inbound::Unrecognized`].
pub fn decode_frame(data: &[u8]) -> RelayResult<Inbound> {
    let text = std::str::from_utf8(data)
        .map_err(|e| RelayError::Codec(format!("frame is not UTF-8: {e}")))?;
    let value: Value = serde_json::from_str(text)?;

    let Value::Object(body) = value else {
        return Ok(Inbound::Unrecognized { type_tag: None });
    };

    let type_tag = match body.get("type") {
        Some(Value::String(t)) => t.clone(),
        _ => return Ok(Inbound::Unrecognized { type_tag: None }),
    };

    match type_tag.parse::<SignalKind>() {
        Ok(kind) => Ok(Inbound::Signal(SignalMessage::new(kind, body))),
        Err(_) => Ok(Inbound::Unrecognized {
            type_tag: Some(type_tag),
        }),
    }
}

/// Encode a serializable value as a JSON text frame.
pub fn encode_message<T: serde::Serialize>(value: &T) -> RelayResult<String> {
    Ok(serde_json::to_string(value)?)
}
