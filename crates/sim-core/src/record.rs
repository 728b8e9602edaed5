//! Channel log line parsing.
//!
//! Each channel log is newline-delimited JSON. A line carrying an
//! `event_type` field is a lifecycle marker (`simulation_start`,
//! `round_start`, `round_end`, ...) and is not an action.

use chrono::Utc;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::types::ActionRecord;

/// Field whose presence marks a lifecycle/event line.
pub const EVENT_MARKER_FIELD: &str = "event_type";

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("record is not a JSON object")]
    NotAnObject,
}

/// A successfully parsed, non-blank log line.
#[derive(Debug, Clone, PartialEq)]
pub enum LogLine {
    Action(ActionRecord),
    /// Lifecycle marker with its `event_type` value.
    Marker(String),
}

/// Action line as written by the worker.
#[derive(Debug, Deserialize)]
struct RawAction {
    #[serde(default)]
    round: u32,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    agent_id: u64,
    #[serde(default)]
    agent_name: String,
    #[serde(default)]
    action_type: String,
    #[serde(default)]
    action_args: Map<String, Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    success: Option<bool>,
}

/// Parse one log line read from `channel`.
///
/// Blank lines yield `Ok(None)`.
pub fn parse_line(line: &str, channel: &str) -> Result<Option<LogLine>, RecordError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let value: Value = serde_json::from_str(trimmed)?;
    let Value::Object(object) = value else {
        return Err(RecordError::NotAnObject);
    };

    if let Some(marker) = object.get(EVENT_MARKER_FIELD) {
        let name = marker
            .as_str()
            .map_or_else(|| marker.to_string(), str::to_string);
        return Ok(Some(LogLine::Marker(name)));
    }

    let raw: RawAction = serde_json::from_value(Value::Object(object))?;
    let result = match raw.result {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    };

    Ok(Some(LogLine::Action(ActionRecord {
        round: raw.round,
        timestamp: raw
            .timestamp
            .unwrap_or_else(|| Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()),
        channel: channel.to_string(),
        actor_id: raw.agent_id,
        actor_name: raw.agent_name,
        action_type: raw.action_type,
        action_args: raw.action_args,
        result,
        success: raw.success.unwrap_or(true),
    })))
}
