//! Database contract used by models.
//!
//! Models address the store with named queries of the form
//! `<entity type>.<operation>` (`task.read`, `task.write`, `task.delete`).
//! Deletes travel through [`Database::write`].

pub mod memory;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::Result;

pub use memory::{MemoryDatabase, StoreError};

/// Executes named queries against stored data.
#[async_trait]
pub trait Database: Send + Sync {
    async fn read(&self, query: &str, params: &Value) -> Result<Value>;

    async fn write(&self, query: &str, params: &Value) -> Result<Value>;
}

/// Operation part of a query name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Read,
    Write,
    Delete,
}

impl QueryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "read" => Some(Self::Read),
            "write" => Some(Self::Write),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// `<entity type>.<operation>`
pub fn query_name(entity_type: &str, kind: QueryKind) -> String {
    format!("{}.{}", entity_type, kind.as_str())
}

/// Split a query name into entity type and operation.
pub fn split_query(query: &str) -> Option<(&str, QueryKind)> {
    let (entity_type, op) = query.rsplit_once('.')?;
    if entity_type.is_empty() {
        return None;
    }
    QueryKind::parse(op).map(|kind| (entity_type, kind))
}

/// Query parameters: the payload's fields with the selector's fields on top.
///
/// Non-object payloads contribute nothing.
pub fn query_params(selector: Option<&Value>, payload: &Value) -> Value {
    let mut params = match payload {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    if let Some(Value::Object(sel)) = selector {
        for (key, value) in sel {
            params.insert(key.clone(), value.clone());
        }
    }
    Value::Object(params)
}
