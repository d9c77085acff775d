//! Wire envelope shared by every session connection.
//!
//! Every frame is a JSON object `{ "event": string, "data": any, "seq"?: integer }`.
//! Events under the `system.` namespace drive the session protocol itself;
//! everything else is an application dispatch.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const HELLO: &str = "system.hello";
pub const IDENTIFY: &str = "system.identify";
pub const RESUME: &str = "system.resume";
pub const READY: &str = "system.ready";
pub const RESUMED: &str = "system.resumed";
pub const HEARTBEAT: &str = "system.heartbeat";
pub const HEARTBEAT_ACK: &str = "system.heartbeat_ack";
pub const ERROR: &str = "system.error";

const SYSTEM_PREFIX: &str = "system.";

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid payload for {event}: {source}")]
    Payload {
        event: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
            seq: None,
        }
    }

    pub fn from_payload<T: Serialize>(
        event: impl Into<String>,
        payload: &T,
    ) -> Result<Self, EnvelopeError> {
        Ok(Self::new(event, serde_json::to_value(payload)?))
    }

    pub fn decode(text: &str) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn is_system(&self) -> bool {
        self.event.starts_with(SYSTEM_PREFIX)
    }

    /// Decodes `data` into a typed payload.
    pub fn payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, EnvelopeError> {
        serde_json::from_value(self.data.clone()).map_err(|source| EnvelopeError::Payload {
            event: self.event.clone(),
            source,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloPayload {
    /// Milliseconds between client heartbeats.
    pub heartbeat_interval: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentifyPayload {
    pub token: String,
    /// Optional last-known context (e.g. the channel the user was viewing).
    #[serde(flatten)]
    pub context: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePayload {
    pub session_id: String,
    pub last_seq: u64,
    pub token: String,
}

/// Body of `system.ready`: a fresh session id plus whatever initial-state
/// snapshot the server attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadyPayload {
    pub session_id: String,
    #[serde(flatten)]
    pub snapshot: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: u16,
    #[serde(default)]
    pub message: String,
}
