//! Event channel message envelope
//!
//! Every payload on the channel is a JSON object with a string `type` field.
//! The remaining fields are kept verbatim.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::reading::{AnalysisResult, PatientId};

pub const PING: &str = "ping";
pub const PONG: &str = "pong";
pub const PAIN_UPDATE: &str = "pain_update";
pub const ALERT: &str = "alert";

/// `{type, ...fields}` message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ChannelMessage {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: Map::new(),
        }
    }

    pub fn ping() -> Self {
        Self::new(PING)
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Parse an inbound text frame. Fails unless it is an object with a string `type`.
    pub fn decode(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn is_pong(&self) -> bool {
        self.kind == PONG
    }

    /// Whether the payload has the analysis-result shape
    pub fn carries_score(&self) -> bool {
        self.kind == PAIN_UPDATE || self.kind == ALERT
    }

    /// `patient_id` as a number or a numeric string
    pub fn patient_id(&self) -> Option<PatientId> {
        match self.fields.get("patient_id")? {
            Value::Number(n) => n.as_i64().map(PatientId),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Decode the fields as an analysis result
    pub fn analysis(&self) -> serde_json::Result<AnalysisResult> {
        serde_json::from_value(Value::Object(self.fields.clone()))
    }
}
