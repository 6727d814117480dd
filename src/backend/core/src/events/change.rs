//! Change notifications between models of the same entity type.

use serde::Serialize;
use serde_json::Value;

use crate::model::{ModelId, Selector};

/// Topic a model of `entity_type` listens on.
pub fn change_topic(entity_type: &str) -> String {
    format!("{}.change", entity_type)
}

/// The mutation that produced a [`ChangeEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeMethod {
    Write,
    Delete,
}

impl ChangeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Write => "write",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for ChangeMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published after a write or delete reached the database.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub method: ChangeMethod,
    pub entity_type: String,
    /// Model that performed the mutation. Receivers skip their own events.
    pub source: ModelId,
    /// Selector of the source model, `None` for one-shot mutations.
    pub source_selector: Option<Selector>,
    /// Forwarded to subscribers as `data.reason`.
    pub reason: Value,
}

impl ChangeEvent {
    /// The `reason` object pushed to subscribers of refreshed models.
    pub fn reason_for(method: ChangeMethod, entity_type: &str, payload: &Value) -> Value {
        serde_json::json!({
            "method": method,
            "name": entity_type,
            "payload": payload,
        })
    }

    pub fn topic(&self) -> String {
        change_topic(&self.entity_type)
    }
}
