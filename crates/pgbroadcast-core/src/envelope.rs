//! The normalized change-notification record.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// A row change as published by the database trigger.
///
/// The same shape is used on both sides: it is decoded from the `NOTIFY`
/// payload and encoded unchanged as the outbound client message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Table the change happened on. Used for subscription routing.
    pub table: String,
    /// Kind of change, e.g. `insert`, `update`, `delete`.
    #[serde(default)]
    pub action: String,
    /// Row data, passed through untouched.
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Envelope {
    /// Create an envelope with empty data.
    pub fn new(table: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            action: action.into(),
            data: Map::new(),
        }
    }

    /// Add a data field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Decode an upstream notification payload.
    pub fn from_payload(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }

    /// Encode as the outbound wire message.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
