//! Typed attribute values
//!
//! The wire shape of one table cell. Externally tagged serde encoding gives
//! the familiar `{"S": ...}` / `{"N": ...}` JSON form, which the CLI state
//! file and archival deserializer both rely on.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One attribute map. Key attributes (`PK`,
/// `SK`) are injected by the store on write and present on read.
pub type Item = BTreeMap<String, AttrValue>;

/// A single attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    /// String.
    S(String),
    /// Integer number. Counters and timestamps are always integers.
    N(i64),
    /// Floating-point number. Only appears inside nested caller metadata.
    F(f64),
    /// Boolean.
    Bool(bool),
    /// Nested map. Never the target of ADD or SET-if-not-exists.
    M(BTreeMap<String, AttrValue>),
    /// List.
    L(Vec<AttrValue>),
    /// Explicit null.
    Null,
}

impl AttrValue {
    /// String content, if this is a string attribute.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::S(s) => Some(s),
            _ => None,
        }
    }

    /// Integer content, if this is an integer attribute.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttrValue::N(n) => Some(*n),
            _ => None,
        }
    }

    /// Boolean content, if this is a boolean attribute.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Nested map content, if this is a map attribute.
    pub fn as_map(&self) -> Option<&BTreeMap<String, AttrValue>> {
        match self {
            AttrValue::M(m) => Some(m),
            _ => None,
        }
    }

    /// Convert to a plain JSON value, dropping the type tags.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            AttrValue::S(s) => serde_json::Value::String(s.clone()),
            AttrValue::N(n) => serde_json::Value::from(*n),
            AttrValue::F(f) => serde_json::Value::from(*f),
            AttrValue::Bool(b) => serde_json::Value::Bool(*b),
            AttrValue::M(m) => {
                serde_json::Value::Object(m.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
            }
            AttrValue::L(l) => serde_json::Value::Array(l.iter().map(|v| v.to_json()).collect()),
            AttrValue::Null => serde_json::Value::Null,
        }
    }

    /// Build from a plain JSON value.
    pub fn from_json(value: &serde_json::Value) -> AttrValue {
        match value {
            serde_json::Value::Null => AttrValue::Null,
            serde_json::Value::Bool(b) => AttrValue::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => AttrValue::N(i),
                None => AttrValue::F(n.as_f64().unwrap_or(0.0)),
            },
            serde_json::Value::String(s) => AttrValue::S(s.clone()),
            serde_json::Value::Array(a) => AttrValue::L(a.iter().map(AttrValue::from_json).collect()),
            serde_json::Value::Object(o) => {
                AttrValue::M(o.iter().map(|(k, v)| (k.clone(), AttrValue::from_json(v))).collect())
            }
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::S(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::S(s)
    }
}

impl From<i64> for AttrValue {
    fn from(n: i64) -> Self {
        AttrValue::N(n)
    }
}

impl From<u32> for AttrValue {
    fn from(n: u32) -> Self {
        AttrValue::N(n as i64)
    }
}

impl From<bool> for AttrValue {
    fn from(b: bool) -> Self {
        AttrValue::Bool(b)
    }
}

/// Read a string attribute off an item.
pub fn get_s<'a>(item: &'a Item, attr: &str) -> Option<&'a str> {
    item.get(attr).and_then(AttrValue::as_str)
}

/// Read an integer attribute off an item.
pub fn get_n(item: &Item, attr: &str) -> Option<i64> {
    item.get(attr).and_then(AttrValue::as_i64)
}

/// Read a boolean attribute off an item.
pub fn get_bool(item: &Item, attr: &str) -> Option<bool> {
    item.get(attr).and_then(AttrValue::as_bool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors() {
        assert_eq!(AttrValue::S("x".into()).as_str(), Some("x"));
        assert_eq!(AttrValue::N(7).as_i64(), Some(7));
        assert_eq!(AttrValue::Bool(true).as_bool(), Some(true));
        assert_eq!(AttrValue::N(7).as_str(), None);
    }

    #[test]
    fn test_json_round_trip() {
        let json = serde_json::json!({
            "tier": "premium",
            "quota": 42,
            "ratio": 0.5,
            "flags": [true, null],
            "nested": {"a": "b"},
        });
        let attr = AttrValue::from_json(&json);
        assert_eq!(attr.to_json(), json);
    }

    #[test]
    fn test_wire_encoding_is_tagged() {
        let encoded = serde_json::to_string(&AttrValue::S("x".into())).unwrap();
        assert_eq!(encoded, r#"{"S":"x"}"#);
        let encoded = serde_json::to_string(&AttrValue::N(5)).unwrap();
        assert_eq!(encoded, r#"{"N":5}"#);
    }

    #[test]
    fn test_item_helpers() {
        let mut item = Item::new();
        item.insert("entity_id".into(), "e1".into());
        item.insert("rf".into(), AttrValue::N(100));
        item.insert("cascade".into(), AttrValue::Bool(false));
        assert_eq!(get_s(&item, "entity_id"), Some("e1"));
        assert_eq!(get_n(&item, "rf"), Some(100));
        assert_eq!(get_bool(&item, "cascade"), Some(false));
        assert_eq!(get_n(&item, "missing"), None);
    }
}
