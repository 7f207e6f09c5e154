//! Messages exchanged between the sidebar and studio surfaces
//!
//! Wire shape: `{"type": "...", "source": "sidebar"|"studio", "payload": ..., "id": "..."}`.
//! Acknowledgments are ordinary messages of type `ack` whose payload carries
//! the original id as `messageId`.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use uuid::Uuid;

/// Reserved message type for acknowledgments
pub const ACK_TYPE: &str = "ack";

/// Surface a message originates from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Sidebar,
    Studio,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sidebar => "sidebar",
            Self::Studio => "studio",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A routed message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub source: Source,
    #[serde(default)]
    pub payload: Value,
    /// Empty until the router assigns one
    #[serde(default)]
    pub id: String,
}

impl BusMessage {
    pub fn new(kind: impl Into<String>, source: Source, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            source,
            payload,
            id: String::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Build the acknowledgment a surface sends back for `message_id`.
    pub fn ack(source: Source, message_id: &str) -> Self {
        Self::new(ACK_TYPE, source, json!({ "messageId": message_id })).with_id(generate_id())
    }

    pub fn is_ack(&self) -> bool {
        self.kind == ACK_TYPE
    }

    /// Id an ack refers to: `payload.messageId`, falling back to the ack's own id.
    pub fn acked_id(&self) -> &str {
        self.payload
            .get("messageId")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .unwrap_or(&self.id)
    }

    /// Assign a fresh id if none was supplied, returning the id either way.
    pub(crate) fn ensure_id(&mut self) -> &str {
        if self.id.is_empty() {
            self.id = generate_id();
        }
        &self.id
    }
}

/// Random 128-bit id rendered as a hyphenated UUID.
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}
