//! Selectors and canonical cache identifiers.
//!
//! An [`Identifier`] is `<entity type>.<canonical JSON>` where the JSON is
//! either `{"id":…}` or `{"filter":…,"order":…}` with every object's keys
//! sorted recursively, e.g. `task.{"id":7}`. Two selectors that differ only
//! in key order produce the same identifier.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

// ═══════════════════════════════════════════════════════════════════════════════
// Selector
// ═══════════════════════════════════════════════════════════════════════════════

/// Selector exactly as it arrives on the wire. Either part may be missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<Value>,
}

impl RawSelector {
    pub fn by_id(id: impl Into<Value>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn by_filter(filter: Value, order: Option<Value>) -> Self {
        Self {
            id: None,
            filter: Some(filter),
            order,
        }
    }

    /// `None` when the selector names neither an id nor a filter.
    ///
    /// An `id` wins over a `filter`. A missing `order` is the empty object.
    pub fn to_selector(&self) -> Option<Selector> {
        match (&self.id, &self.filter) {
            (Some(id), _) if !id.is_null() => Some(Selector::ById(id.clone())),
            (_, Some(filter)) if !filter.is_null() => Some(Selector::ByFilter {
                filter: filter.clone(),
                order: match &self.order {
                    Some(order) if !order.is_null() => order.clone(),
                    _ => Value::Object(Map::new()),
                },
            }),
            _ => None,
        }
    }
}

/// What a model represents: one record, or a filtered and ordered view.
#[derive(Debug, Clone, PartialEq)]
pub enum Selector {
    ById(Value),
    ByFilter { filter: Value, order: Value },
}

impl Selector {
    pub fn is_by_id(&self) -> bool {
        matches!(self, Self::ById(_))
    }

    /// `{"id":…}` or `{"filter":…,"order":…}`.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        match self {
            Self::ById(id) => {
                map.insert("id".to_string(), id.clone());
            }
            Self::ByFilter { filter, order } => {
                map.insert("filter".to_string(), filter.clone());
                map.insert("order".to_string(), order.clone());
            }
        }
        Value::Object(map)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Identifier
// ═══════════════════════════════════════════════════════════════════════════════

/// Cache key of a model.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Identifier(String);

impl Identifier {
    pub fn new(entity_type: &str, selector: &Selector) -> Self {
        let mut key = String::with_capacity(entity_type.len() + 32);
        key.push_str(entity_type);
        key.push('.');
        write_canonical(&selector.to_value(), &mut key);
        Self(key)
    }

    /// `None` when `raw` carries neither an id nor a filter.
    pub fn from_raw(entity_type: &str, raw: &RawSelector) -> Option<Self> {
        raw.to_selector().map(|s| Self::new(entity_type, &s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Serialize `value` with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();

            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_id_identifier() {
        let sel = RawSelector::by_id(7).to_selector().unwrap();
        assert_eq!(Identifier::new("task", &sel).as_str(), r#"task.{"id":7}"#);
    }

    #[test]
    fn test_filter_key_order_is_irrelevant() {
        let a: RawSelector = serde_json::from_str(
            r#"{"filter":{"status":"open","owner":{"team":"a","name":"x"}},"order":{"due":"asc"}}"#,
        )
        .unwrap();
        let b: RawSelector = serde_json::from_str(
            r#"{"order":{"due":"asc"},"filter":{"owner":{"name":"x","team":"a"},"status":"open"}}"#,
        )
        .unwrap();

        let ia = Identifier::from_raw("task", &a).unwrap();
        let ib = Identifier::from_raw("task", &b).unwrap();
        assert_eq!(ia, ib);
        assert_eq!(
            ia.as_str(),
            r#"task.{"filter":{"owner":{"name":"x","team":"a"},"status":"open"},"order":{"due":"asc"}}"#
        );
    }

    #[test]
    fn test_missing_order_equals_empty_order() {
        let a = RawSelector::by_filter(json!({"status": "open"}), None);
        let b = RawSelector::by_filter(json!({"status": "open"}), Some(json!({})));
        assert_eq!(Identifier::from_raw("task", &a), Identifier::from_raw("task", &b));
    }

    #[test]
    fn test_entity_type_is_part_of_key() {
        let sel = Selector::ById(json!(1));
        assert_ne!(Identifier::new("task", &sel), Identifier::new("note", &sel));
    }

    #[test]
    fn test_id_wins_over_filter() {
        let raw = RawSelector {
            id: Some(json!(3)),
            filter: Some(json!({"status": "open"})),
            order: None,
        };
        assert_eq!(raw.to_selector(), Some(Selector::ById(json!(3))));
    }

    #[test]
    fn test_no_identifier_without_id_or_filter() {
        assert!(RawSelector::default().to_selector().is_none());

        let null_id: RawSelector = serde_json::from_str(r#"{"id":null}"#).unwrap();
        assert!(Identifier::from_raw("task", &null_id).is_none());
    }

    #[test]
    fn test_canonical_json_escapes_keys_and_keeps_array_order() {
        let value = json!({"b": [3, 1, {"z": 1, "a": "q\"x"}], "a\"": null});
        assert_eq!(
            canonical_json(&value),
            r#"{"a\"":null,"b":[3,1,{"a":"q\"x","z":1}]}"#
        );
    }
}
