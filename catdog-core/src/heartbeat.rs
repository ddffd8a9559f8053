//! Heartbeat payloads
//!
//! A heartbeat is a [`Message`] of type `heartbeat` whose sender is the module
//! name. Nominal heartbeats (operational, not dying) only carry
//! `module_name`, `status` and `dying`; every other heartbeat carries the full
//! diagnostic set so that observers can tell why a module is unhappy.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::{Message, MessageError, MessageType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatStatus {
    Booting,
    Operational,
    Processing,
    Error,
}

impl HeartbeatStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HeartbeatStatus::Booting => "booting",
            HeartbeatStatus::Operational => "operational",
            HeartbeatStatus::Processing => "processing",
            HeartbeatStatus::Error => "error",
        }
    }

    /// Statuses the agent accepts as "online" during startup.
    pub fn is_online(&self) -> bool {
        matches!(self, HeartbeatStatus::Operational | HeartbeatStatus::Processing)
    }
}

impl fmt::Display for HeartbeatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostic block attached to every non-nominal heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostics {
    pub last_function: String,
    pub active: bool,
    pub connected: bool,
    /// Serialized as `null` when there is no error, the key is always present.
    pub error: Option<String>,
    pub time_in_status_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Heartbeat {
    pub module_name: String,
    pub status: HeartbeatStatus,
    pub dying: bool,
    #[serde(flatten)]
    pub diagnostics: Option<Diagnostics>,
}

impl Heartbeat {
    pub fn nominal(module_name: impl Into<String>) -> Self {
        Self {
            module_name: module_name.into(),
            status: HeartbeatStatus::Operational,
            dying: false,
            diagnostics: None,
        }
    }

    pub fn detailed(
        module_name: impl Into<String>,
        status: HeartbeatStatus,
        dying: bool,
        diagnostics: Diagnostics,
    ) -> Self {
        Self {
            module_name: module_name.into(),
            status,
            dying,
            diagnostics: Some(diagnostics),
        }
    }

    pub fn into_message(self) -> Message {
        let sender = self.module_name.clone();
        let content = match serde_json::to_value(&self) {
            Ok(Value::Object(map)) => map,
            // Heartbeat only holds strings, bools and finite floats
            _ => {
                let mut map = serde_json::Map::new();
                map.insert("module_name".into(), Value::String(self.module_name));
                map.insert("status".into(), Value::String(self.status.as_str().into()));
                map.insert("dying".into(), Value::Bool(self.dying));
                map
            }
        };
        Message::new(sender, MessageType::Heartbeat, content)
    }
}

/// Lenient decoded view of a heartbeat, as seen by consumers.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HeartbeatReport {
    pub module_name: String,
    pub status: HeartbeatStatus,
    #[serde(default)]
    pub dying: bool,
    #[serde(default)]
    pub last_function: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub connected: Option<bool>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub time_in_status_seconds: Option<f64>,
}

#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    #[error("message from {0} is not a heartbeat")]
    NotHeartbeat(String),
    #[error("invalid heartbeat content: {0}")]
    Content(#[from] serde_json::Error),
    #[error(transparent)]
    Message(#[from] MessageError),
}

impl HeartbeatReport {
    pub fn from_message(message: &Message) -> Result<Self, HeartbeatError> {
        if !message.is_heartbeat() {
            return Err(HeartbeatError::NotHeartbeat(message.sender().to_string()));
        }
        let content = Value::Object(message.content().clone());
        Ok(serde_json::from_value(content)?)
    }
}
