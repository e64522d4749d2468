use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::iteration::MemeSpec;

// ── Server → client ──────────────────────────────────────────────────

/// Messages the server pushes to a reviewer's WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Informational progress line. Delivery is best-effort.
    EventLog { message: String },
    /// Suspends the run until a `decision` with the same `command_id` arrives.
    ApprovalRequest {
        artifact_reference: String,
        command_id: String,
        iteration: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meme_spec: Option<MemeSpec>,
    },
    /// Reply to any client frame that is not a decision.
    Echo { data: serde_json::Value },
}

impl ServerMessage {
    pub fn event_log(message: impl Into<String>) -> Self {
        ServerMessage::EventLog {
            message: message.into(),
        }
    }
}

// ── Client → server ──────────────────────────────────────────────────

/// A reviewer's verdict as it appears on the wire.
///
/// `approved` travels as the string `"true"` or `"false"`; it is normalized to
/// a `bool` during deserialization. Native JSON booleans are accepted too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionPayload {
    #[serde(
        deserialize_with = "deserialize_wire_bool",
        serialize_with = "serialize_wire_bool"
    )]
    pub approved: bool,
    #[serde(default)]
    pub feedback: Option<String>,
    pub command_id: String,
}

impl DecisionPayload {
    pub fn decision(&self) -> Decision {
        Decision {
            approved: self.approved,
            feedback: self.feedback.clone().unwrap_or_default(),
        }
    }
}

/// Normalized decision handed to a suspended approval waiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub approved: bool,
    pub feedback: String,
}

impl Decision {
    pub fn approve() -> Self {
        Self {
            approved: true,
            feedback: String::new(),
        }
    }

    pub fn reject(feedback: impl Into<String>) -> Self {
        Self {
            approved: false,
            feedback: feedback.into(),
        }
    }
}

/// A parsed inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Decision(DecisionPayload),
    /// Any other JSON value; the server echoes it back.
    Other(serde_json::Value),
}

impl ClientMessage {
    /// Parse a text frame. Frames tagged `"type": "decision"` must carry a
    /// well-formed decision payload; everything else is passed through.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        if value.get("type").and_then(|t| t.as_str()) == Some("decision") {
            let payload = serde_json::from_value(value)?;
            return Ok(ClientMessage::Decision(payload));
        }
        Ok(ClientMessage::Other(value))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireBool {
    Native(bool),
    Text(String),
}

fn deserialize_wire_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    match WireBool::deserialize(deserializer)? {
        WireBool::Native(b) => Ok(b),
        WireBool::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(serde::de::Error::invalid_value(
                serde::de::Unexpected::Str(&s),
                &r#""true" or "false""#,
            )),
        },
    }
}

fn serialize_wire_bool<S>(value: &bool, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(if *value { "true" } else { "false" })
}
