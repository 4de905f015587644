//! Singer message model
//!
//! Lines are parsed to a `Value` first and dispatched on `type`; each message body is then read
//! into its own struct.

use crate::error::{Result, TargetError};
use crate::schema::Row;
use serde::Deserialize;
use serde_json::Value;

#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Schema(SchemaMessage),
    Record(RecordMessage),
    State(StateMessage),
    ActivateVersion(ActivateVersionMessage),
    /// Batch file references are not supported; only the stream is kept for logging
    Batch { stream: String },
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct SchemaMessage {
    pub stream: String,
    pub schema: Value,
    #[serde(default)]
    pub key_properties: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct RecordMessage {
    pub stream: String,
    pub record: Row,
    #[serde(default)]
    pub version: Option<u64>,
    #[serde(default)]
    pub time_extracted: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct StateMessage {
    pub value: Value,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ActivateVersionMessage {
    pub stream: String,
    pub version: u64,
}

#[derive(Deserialize)]
struct BatchMessage {
    stream: String,
}

impl Message {
    pub fn parse(line: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(line)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| TargetError::Schema(format!("Message has no type: {}", truncate(line))))?
            .to_string();

        let message = match kind.as_str() {
            "SCHEMA" => Message::Schema(serde_json::from_value(value)?),
            "RECORD" => Message::Record(serde_json::from_value(value)?),
            "STATE" => Message::State(serde_json::from_value(value)?),
            "ACTIVATE_VERSION" => Message::ActivateVersion(serde_json::from_value(value)?),
            "BATCH" => {
                let batch: BatchMessage = serde_json::from_value(value)?;
                Message::Batch { stream: batch.stream }
            }
            other => return Err(TargetError::Schema(format!("Unknown message type '{}'", other))),
        };
        Ok(message)
    }

    pub fn stream(&self) -> Option<&str> {
        match self {
            Message::Schema(m) => Some(&m.stream),
            Message::Record(m) => Some(&m.stream),
            Message::ActivateVersion(m) => Some(&m.stream),
            Message::Batch { stream } => Some(stream),
            Message::State(_) => None,
        }
    }
}

fn truncate(line: &str) -> &str {
    match line.char_indices().nth(120) {
        Some((index, _)) => &line[..index],
        None => line,
    }
}
