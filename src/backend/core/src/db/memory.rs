//! In-process reference store.
//!
//! Each registered entity type is a table of JSON records with an `id`
//! field. Only `<entity>.read`, `<entity>.write` and `<entity>.delete` are
//! served, and only for registered entity types.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, instrument};

use super::{split_query, Database, QueryKind};
use crate::error::SyncError;
use crate::model::identifier::canonical_json;

/// Failures raised by [`MemoryDatabase`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown query: {0}")]
    UnknownQuery(String),

    #[error("{entity_type} record {id} not found")]
    NotFound { entity_type: String, id: String },

    #[error("record must be a JSON object, got {0}")]
    InvalidRecord(String),

    #[error("{0} requires an id")]
    MissingId(String),
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        SyncError::store(err.to_string()).with_source(err)
    }
}

#[derive(Debug)]
struct Table {
    records: Vec<Map<String, Value>>,
    next_id: u64,
}

impl Table {
    fn new() -> Self {
        Self {
            records: Vec::new(),
            next_id: 1,
        }
    }

    fn position(&self, id: &Value) -> Option<usize> {
        self.records.iter().position(|r| r.get("id") == Some(id))
    }

    fn observe_id(&mut self, id: &Value) {
        if let Some(n) = id.as_u64() {
            self.next_id = self.next_id.max(n + 1);
        }
    }
}

/// Thread-safe in-memory [`Database`].
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    tables: RwLock<HashMap<String, Table>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entities<I, S>(entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let db = Self::new();
        for entity in entities {
            db.register_entity(entity);
        }
        db
    }

    /// Serve queries for `entity_type`. Registering twice keeps the data.
    pub fn register_entity(&self, entity_type: impl Into<String>) {
        self.tables
            .write()
            .entry(entity_type.into())
            .or_insert_with(Table::new);
    }

    /// Insert or replace records directly, bypassing the query interface.
    pub fn seed(&self, entity_type: &str, records: Vec<Value>) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let table = tables
            .entry(entity_type.to_string())
            .or_insert_with(Table::new);

        for record in records {
            let record = into_object(record)?;
            let id = record
                .get("id")
                .filter(|id| !id.is_null())
                .cloned()
                .ok_or_else(|| StoreError::MissingId(format!("{}.seed", entity_type)))?;
            table.observe_id(&id);
            match table.position(&id) {
                Some(pos) => table.records[pos] = record,
                None => table.records.push(record),
            }
        }
        Ok(())
    }

    /// Number of records stored for `entity_type`.
    pub fn len(&self, entity_type: &str) -> usize {
        self.tables
            .read()
            .get(entity_type)
            .map_or(0, |t| t.records.len())
    }

    pub fn entity_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Operations
    // ─────────────────────────────────────────────────────────────────────────

    fn resolve<'q>(&self, query: &'q str, allowed: &[QueryKind]) -> Result<(&'q str, QueryKind), StoreError> {
        let (entity_type, kind) =
            split_query(query).ok_or_else(|| StoreError::UnknownQuery(query.to_string()))?;
        if !allowed.contains(&kind) || !self.tables.read().contains_key(entity_type) {
            return Err(StoreError::UnknownQuery(query.to_string()));
        }
        Ok((entity_type, kind))
    }

    fn select(&self, entity_type: &str, params: &Value) -> Value {
        let tables = self.tables.read();
        let Some(table) = tables.get(entity_type) else {
            return Value::Null;
        };

        if let Some(id) = params.get("id").filter(|id| !id.is_null()) {
            return table
                .position(id)
                .map_or(Value::Null, |pos| Value::Object(table.records[pos].clone()));
        }

        let filter = params.get("filter").and_then(Value::as_object);
        let mut rows: Vec<&Map<String, Value>> = table
            .records
            .iter()
            .filter(|record| match filter {
                Some(filter) => filter.iter().all(|(k, v)| record.get(k) == Some(v)),
                None => true,
            })
            .collect();

        if let Some(order) = params.get("order").and_then(Value::as_object) {
            let mut keys: Vec<(&String, bool)> = order
                .iter()
                .map(|(field, dir)| (field, dir.as_str() == Some("desc")))
                .collect();
            keys.sort_by(|a, b| a.0.cmp(b.0));

            rows.sort_by(|a, b| {
                for (field, descending) in &keys {
                    let ord = compare_values(
                        a.get(*field).unwrap_or(&Value::Null),
                        b.get(*field).unwrap_or(&Value::Null),
                    );
                    let ord = if *descending { ord.reverse() } else { ord };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
        }

        Value::Array(rows.into_iter().cloned().map(Value::Object).collect())
    }

    fn upsert(&self, entity_type: &str, params: &Value) -> Result<Value, StoreError> {
        let fields = into_object(params.clone())?;
        let mut tables = self.tables.write();
        let table = tables
            .get_mut(entity_type)
            .ok_or_else(|| StoreError::UnknownQuery(format!("{}.write", entity_type)))?;

        match fields.get("id").filter(|id| !id.is_null()).cloned() {
            Some(id) => {
                table.observe_id(&id);
                let record = match table.position(&id) {
                    Some(pos) => {
                        let record = &mut table.records[pos];
                        for (key, value) in fields {
                            record.insert(key, value);
                        }
                        record.clone()
                    }
                    None => {
                        table.records.push(fields.clone());
                        fields
                    }
                };
                Ok(Value::Object(record))
            }
            None => {
                let mut record = fields;
                record.insert("id".to_string(), Value::from(table.next_id));
                table.next_id += 1;
                table.records.push(record.clone());
                Ok(Value::Object(record))
            }
        }
    }

    fn remove(&self, entity_type: &str, params: &Value) -> Result<Value, StoreError> {
        let id = params
            .get("id")
            .filter(|id| !id.is_null())
            .ok_or_else(|| StoreError::MissingId(format!("{}.delete", entity_type)))?;

        let mut tables = self.tables.write();
        let table = tables
            .get_mut(entity_type)
            .ok_or_else(|| StoreError::UnknownQuery(format!("{}.delete", entity_type)))?;

        match table.position(id) {
            Some(pos) => Ok(Value::Object(table.records.remove(pos))),
            None => Err(StoreError::NotFound {
                entity_type: entity_type.to_string(),
                id: canonical_json(id),
            }),
        }
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    #[instrument(skip(self, params), level = "debug")]
    async fn read(&self, query: &str, params: &Value) -> crate::error::Result<Value> {
        let (entity_type, _) = self.resolve(query, &[QueryKind::Read])?;
        let result = self.select(entity_type, params);
        debug!(query = %query, "Read served");
        Ok(result)
    }

    #[instrument(skip(self, params), level = "debug")]
    async fn write(&self, query: &str, params: &Value) -> crate::error::Result<Value> {
        let (entity_type, kind) = self.resolve(query, &[QueryKind::Write, QueryKind::Delete])?;
        let result = match kind {
            QueryKind::Delete => self.remove(entity_type, params)?,
            _ => self.upsert(entity_type, params)?,
        };
        debug!(query = %query, "Write served");
        Ok(result)
    }
}

fn into_object(value: Value) -> Result<Map<String, Value>, StoreError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::InvalidRecord(other.to_string())),
    }
}

/// Total order over JSON values: null < bool < number < string < array < object.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)).then_with(|| canonical_json(a).cmp(&canonical_json(b))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use serde_json::json;

    fn seeded() -> MemoryDatabase {
        let db = MemoryDatabase::with_entities(["task"]);
        db.seed(
            "task",
            vec![
                json!({"id": 1, "title": "b", "status": "open", "due": 3}),
                json!({"id": 2, "title": "a", "status": "closed", "due": 1}),
                json!({"id": 3, "title": "c", "status": "open", "due": 2}),
            ],
        )
        .unwrap();
        db
    }

    #[tokio::test]
    async fn test_read_by_id() {
        let db = seeded();
        let record = db.read("task.read", &json!({"id": 2})).await.unwrap();
        assert_eq!(record["title"], "a");

        let missing = db.read("task.read", &json!({"id": 99})).await.unwrap();
        assert!(missing.is_null());
    }

    #[tokio::test]
    async fn test_read_by_filter_sorted() {
        let db = seeded();
        let rows = db
            .read(
                "task.read",
                &json!({"filter": {"status": "open"}, "order": {"due": "desc"}}),
            )
            .await
            .unwrap();
        let ids: Vec<i64> = rows
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["id"].as_i64().unwrap())
            .collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_write_merges_and_inserts() {
        let db = seeded();
        let updated = db
            .write("task.write", &json!({"id": 1, "status": "closed"}))
            .await
            .unwrap();
        assert_eq!(updated, json!({"id": 1, "title": "b", "status": "closed", "due": 3}));

        let inserted = db.write("task.write", &json!({"title": "d"})).await.unwrap();
        assert_eq!(inserted["id"], 4);
        assert_eq!(db.len("task"), 4);
    }

    #[tokio::test]
    async fn test_delete_missing_fails() {
        let db = seeded();
        db.write("task.delete", &json!({"id": 3})).await.unwrap();
        let err = db.write("task.delete", &json!({"id": 3})).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::StoreFailure);
        assert_eq!(err.client_code(), "model");
    }

    #[tokio::test]
    async fn test_unknown_queries_rejected() {
        let db = seeded();
        for (query, read) in [("note.read", true), ("task.write", true), ("task.read", false), ("task.drop", false)] {
            let result = if read {
                db.read(query, &json!({})).await
            } else {
                db.write(query, &json!({})).await
            };
            let err = result.unwrap_err();
            assert_eq!(err.code(), ErrorCode::StoreFailure, "query {}", query);
            assert!(err.internal_message().unwrap().contains("unknown query"));
        }
    }

    #[test]
    fn test_compare_values_mixed_types() {
        assert_eq!(compare_values(&json!(null), &json!(1)), Ordering::Less);
        assert_eq!(compare_values(&json!(2.5), &json!(2)), Ordering::Greater);
        assert_eq!(compare_values(&json!("b"), &json!("a")), Ordering::Greater);
    }
}
