//! Wire protocol.
//!
//! Inbound frames are `{"head": {"correlationId": …}, "body": {…}}`; every
//! outbound frame is a [`Response`] `{"correlationId", "method", "data"}`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

use crate::error::{Result, SyncError};
use crate::model::RawSelector;

// ═══════════════════════════════════════════════════════════════════════════════
// Inbound
// ═══════════════════════════════════════════════════════════════════════════════

/// Routing metadata of a request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestHead {
    /// Echoed back on the response and on pushes caused by a binding.
    #[serde(rename = "correlationId", default)]
    pub correlation_id: Value,
}

/// One operation against an entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub entity_type: String,
    pub method: String,
    #[serde(default)]
    pub selector: RawSelector,
    #[serde(default)]
    pub payload: Value,
    /// `true` binds, `false` unbinds, absent or `null` leaves bindings alone.
    #[serde(default)]
    pub subscribe: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    #[serde(default)]
    pub head: RequestHead,
    pub body: Request,
}

impl RequestEnvelope {
    pub fn new(correlation_id: impl Into<Value>, body: Request) -> Self {
        Self {
            head: RequestHead {
                correlation_id: correlation_id.into(),
            },
            body,
        }
    }

    /// Decode a text frame.
    ///
    /// On failure the error comes with whatever correlation id could still be
    /// recovered from the frame, `null` otherwise.
    pub fn decode(raw: &str) -> std::result::Result<Self, (Value, SyncError)> {
        let value: Value = serde_json::from_str(raw).map_err(|e| (Value::Null, SyncError::from(e)))?;
        let correlation_id = value
            .get("head")
            .and_then(|h| h.get("correlationId"))
            .cloned()
            .unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|e| (correlation_id, SyncError::from(e)))
    }
}

/// The three operations a model supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Read,
    Write,
    Delete,
}

impl Method {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            "delete" => Ok(Self::Delete),
            other => Err(SyncError::unknown_method(other)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Outbound
// ═══════════════════════════════════════════════════════════════════════════════

/// A reply or a push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "correlationId")]
    pub correlation_id: Value,
    pub method: String,
    pub data: Value,
}

impl Response {
    pub fn new(correlation_id: Value, method: impl Into<String>, data: Value) -> Self {
        Self {
            correlation_id,
            method: method.into(),
            data,
        }
    }

    /// `data` is `{"error": <client code>}`; nothing else leaves the process.
    pub fn error(correlation_id: Value, method: impl Into<String>, err: &SyncError) -> Self {
        Self::new(correlation_id, method, json!({ "error": err.client_code() }))
    }

    pub fn error_code(&self) -> Option<&str> {
        self.data.get("error").and_then(Value::as_str)
    }

    pub fn is_error(&self) -> bool {
        self.error_code().is_some()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
