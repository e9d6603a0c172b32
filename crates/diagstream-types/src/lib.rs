use chrono::{DateTime, SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Well-known event kinds produced by the diagnostics backend.
///
/// The set is open: the feed accepts any `type` string, these are only the
/// names the backend itself emits.
pub mod kinds {
    pub const NODE_STARTED: &str = "node_started";
    pub const NODE_FINISHED: &str = "node_finished";
    pub const TOOL_CALLED: &str = "tool_called";
    pub const TOOL_ERROR: &str = "tool_error";
    pub const TOKEN_USAGE: &str = "token_usage";
    /// Emitted by `POST /diagnostics/emit`.
    pub const STEP_MESSAGE: &str = "step_message";
}

/// A single diagnostic occurrence pushed by the backend.
///
/// Events are never mutated after decoding; consumers only reorder or drop
/// whole events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Event {
    /// Event kind, e.g. `"step_message"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Server-assigned occurrence time. Opaque ISO-8601 text.
    #[serde(
        rename = "ts",
        alias = "timestamp",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<String>,
    /// Originating component; `None` covers both absent and `null`.
    #[serde(default)]
    pub node: Option<String>,
    /// Open-ended structured data.
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl Event {
    /// Build an event of `kind` with an empty payload and no node.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            timestamp: None,
            node: None,
            payload: Map::new(),
        }
    }

    /// Builder-style: set the originating node.
    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    /// Builder-style: insert one payload entry.
    pub fn with_payload_entry(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Builder-style: set the timestamp text.
    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }

    /// A `step_message` event carrying `{"message": message}`.
    pub fn step_message(message: impl Into<String>) -> Self {
        let message: String = message.into();
        Self::new(kinds::STEP_MESSAGE).with_payload_entry("message", message)
    }

    /// Return a copy stamped with `at` when no timestamp is present yet.
    pub fn stamped(&self, at: DateTime<Utc>) -> Self {
        let mut ev = self.clone();
        if ev.timestamp.is_none() {
            ev.timestamp = Some(rfc3339(at));
        }
        ev
    }

    /// Decode one event from the text of a feed message.
    pub fn decode(data: &str) -> Result<Self, DiagError> {
        serde_json::from_str(data).map_err(|e| DiagError::Decode(e.to_string()))
    }

    /// Encode as a single line of JSON.
    pub fn encode(&self) -> Result<String, DiagError> {
        serde_json::to_string(self).map_err(|e| DiagError::Serialization(e.to_string()))
    }
}

/// Format `at` the way the backend stamps events (UTC, microseconds).
pub fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Body of `GET /health` and `GET /api/health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct HealthStatus {
    pub ok: bool,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub env: String,
    pub timestamp: String,
    /// Seconds since the server started.
    pub uptime: f64,
}

fn default_status() -> String {
    "ok".to_string()
}

impl HealthStatus {
    pub fn healthy(env: impl Into<String>, now: DateTime<Utc>, uptime_secs: f64) -> Self {
        Self {
            ok: true,
            status: default_status(),
            env: env.into(),
            timestamp: rfc3339(now),
            uptime: uptime_secs,
        }
    }
}

/// JSON Schema of [`Event`], published so front ends can generate types.
pub fn event_schema() -> Value {
    serde_json::to_value(schemars::schema_for!(Event)).unwrap_or(Value::Null)
}

/// Workspace-wide error type.
#[derive(Error, Debug)]
pub enum DiagError {
    #[error("Event decode error: {0}")]
    Decode(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Unexpected status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("Server error: {0}")]
    Server(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
