//! Signaling message types.
//!
//! The relay only understands the `type` tag of a message. Everything else
//! (sender, SDP, ICE candidate) is carried as an opaque JSON object and
//! forwarded as-is.

use crate::error::{RelayError, RelayResult};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Message types the relay forwards between peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
    Register,
}

impl SignalKind {
    /// All relayable kinds.
    pub const ALL: [SignalKind; 4] = [
        SignalKind::Offer,
        SignalKind::Answer,
        SignalKind::Candidate,
        SignalKind::Register,
    ];

    /// Wire name of this kind (the value of the `type` field).
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
            SignalKind::Register => "register",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalKind {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SignalKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| RelayError::InvalidMessage(format!("unrecognized type: {s}")))
    }
}

/// A parsed signaling message of a recognized kind.
///
/// Holds the complete JSON object, `type` field included, so re-encoding
/// yields the same fields in the same order. Built by
/// [`decode_frame`](crate::codec::decode_frame).
#[derive(Debug, Clone, PartialEq)]
pub struct SignalMessage {
    kind: SignalKind,
    body: Map<String, Value>,
}

impl SignalMessage {
    /// Wrap a JSON object whose `type` field has already been matched to `kind`.
    pub(crate) fn new(kind: SignalKind, body: Map<String, Value>) -> Self {
        Self { kind, body }
    }

    pub fn kind(&self) -> SignalKind {
        self.kind
    }

    /// Self-declared sender label. Informational only, never verified.
    pub fn sender(&self) -> Option<&str> {
        self.body.get("sender").and_then(Value::as_str)
    }

    /// Re-encode the message as a JSON text frame.
    pub fn to_json(&self) -> RelayResult<String> {
        Ok(serde_json::to_string(&self.body)?)
    }
}

/// Messages originated by the relay itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Tells the earlier of two paired peers to create the offer.
    StartOffer,
}
