/**
 * MESSAGE - Envelope exchanged on every catdog link
 *
 * ROLE : Immutable record {sender, timestamp, type, content} shared by the
 * link server/client pair, the global channel and the heartbeat emitter.
 *
 * WIRE : one JSON object per line (UTF-8). `type` defaults to "data" when
 * absent, `content` must be a JSON object.
 */

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

/// Erreurs de (dé)codage d'un message
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("invalid JSON frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("empty frame")]
    Empty,
    #[error("content must be a JSON object, got {0}")]
    ContentNotObject(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Data,
    Heartbeat,
}

/// Raw shape used for decoding so that a non-object `content` is reported
/// as a dedicated error instead of a generic serde message.
#[derive(Deserialize)]
struct RawMessage {
    sender: String,
    #[serde(default)]
    timestamp: Option<f64>,
    #[serde(rename = "type", default)]
    kind: MessageType,
    #[serde(default)]
    content: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    sender: String,
    timestamp: f64,
    #[serde(rename = "type")]
    kind: MessageType,
    content: Map<String, Value>,
}

impl Message {
    pub fn new(sender: impl Into<String>, kind: MessageType, content: Map<String, Value>) -> Self {
        Self {
            sender: sender.into(),
            timestamp: unix_now(),
            kind,
            content,
        }
    }

    pub fn data(sender: impl Into<String>, content: Map<String, Value>) -> Self {
        Self::new(sender, MessageType::Data, content)
    }

    /// Builds a data message from any JSON value; non-object values are rejected.
    pub fn data_from_value(sender: impl Into<String>, content: Value) -> Result<Self, MessageError> {
        match content {
            Value::Object(map) => Ok(Self::data(sender, map)),
            other => Err(MessageError::ContentNotObject(json_kind(&other))),
        }
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn is_heartbeat(&self) -> bool {
        self.kind == MessageType::Heartbeat
    }

    pub fn content(&self) -> &Map<String, Value> {
        &self.content
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.content.get(key)
    }

    /// Encodes the message as a single line, without the trailing newline.
    pub fn to_frame(&self) -> Result<String, MessageError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_frame(frame: &str) -> Result<Self, MessageError> {
        let frame = frame.trim();
        if frame.is_empty() {
            return Err(MessageError::Empty);
        }
        let raw: RawMessage = serde_json::from_str(frame)?;
        let content = match raw.content {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => return Err(MessageError::ContentNotObject(json_kind(&other))),
        };
        Ok(Self {
            sender: raw.sender,
            timestamp: raw.timestamp.unwrap_or_else(unix_now),
            kind: raw.kind,
            content,
        })
    }
}

/// Current wall clock as fractional unix seconds.
pub fn unix_now() -> f64 {
    OffsetDateTime::now_utc().unix_timestamp_nanos() as f64 / 1_000_000_000.0
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
