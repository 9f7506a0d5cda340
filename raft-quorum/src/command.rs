use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StorageError;

/// A write command as it is stored in the log: the raw query plus its
/// bound values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<Value>>,
}

impl Command {
    pub fn new(query: impl Into<String>, values: Option<Vec<Value>>) -> Self {
        Self {
            query: query.into(),
            values,
        }
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

/// One entry of the append-only command log.
///
/// `command` keeps the serialized [`Command`] exactly as it was first
/// written so that catch-up copies it byte for byte.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: u64,
    pub command: String,
    #[serde(rename = "commandtime")]
    pub command_time: DateTime<Utc>,
}

impl LogEntry {
    pub fn decode_command(&self) -> Result<Command, StorageError> {
        Command::decode(&self.command).map_err(|err| StorageError::CorruptEntry {
            id: self.id,
            reason: err.to_string(),
        })
    }
}
