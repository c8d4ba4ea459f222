//! Core types for EddyDB

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Unique document identifier
pub type DocumentId = String;

/// Collection name
pub type CollectionName = String;

/// Sequence number for change-event ordering
pub type SequenceNumber = u64;

/// Wall-clock milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Value type supporting the document field types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Object(HashMap<String, Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view; ints widen to floats
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&HashMap<String, Value>> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Rank used to totally order values of different types when sorting
    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(a) => Value::Array(a.into_iter().map(Into::into).collect()),
            serde_json::Value::Object(o) => {
                Value::Object(o.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

/// Total order over values for sort keys.
///
/// Missing (`None`) and `Null` sort before any value; numbers compare
/// across `Int`/`Float`; remaining cross-type pairs order by type rank.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(Value::Null)) | (Some(Value::Null), None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => compare_present(x, y),
    }
}

fn compare_present(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (xi, yi) in x.iter().zip(y.iter()) {
                let ord = compare_present(xi, yi);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => {
            if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
                return x.partial_cmp(&y).unwrap_or(Ordering::Equal);
            }
            a.type_rank().cmp(&b.type_rank())
        }
    }
}

/// A document stored in a collection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    /// Document ID
    #[serde(rename = "_id")]
    pub id: DocumentId,

    /// Revision number, bumped by the store on every write
    #[serde(rename = "_rev")]
    pub revision: u64,

    /// Soft-delete flag; a deleted document still exists as a tombstone
    #[serde(rename = "_deleted", default)]
    pub deleted: bool,

    /// Creation timestamp (millis), set on first insert
    #[serde(rename = "_created")]
    pub created_at: i64,

    /// Last-write timestamp (millis), set by the store on every write
    #[serde(rename = "_updated")]
    pub updated_at: i64,

    /// Vector clock for sync-originated writes
    #[serde(rename = "_vclock", default, skip_serializing_if = "Option::is_none")]
    pub vclock: Option<HashMap<String, u64>>,

    /// Document data
    #[serde(flatten)]
    pub data: HashMap<String, Value>,
}

impl Document {
    /// Create a new document with auto-generated ID
    pub fn new(data: HashMap<String, Value>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), data)
    }

    /// Create a document with a specific ID
    pub fn with_id(id: impl Into<String>, data: HashMap<String, Value>) -> Self {
        let now = now_millis();
        Self {
            id: id.into(),
            revision: 0,
            deleted: false,
            created_at: now,
            updated_at: now,
            vclock: None,
            data,
        }
    }

    /// Get a top-level value by key
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Set a top-level value
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    /// Resolve a dotted field path (`"address.city"`) against the data map.
    /// Missing segments yield `None`.
    pub fn field(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.data.get(first)?;
        for segment in segments {
            match current {
                Value::Object(map) => current = map.get(segment)?,
                _ => return None,
            }
        }
        Some(current)
    }

    /// Content equality ignoring store-assigned metadata. Drives branch
    /// diffing and merge: two documents are "the same state" when their
    /// user fields and tombstone flag agree.
    pub fn same_content(&self, other: &Document) -> bool {
        self.deleted == other.deleted && self.data == other.data
    }
}
