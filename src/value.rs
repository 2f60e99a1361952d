//! Values crossing the Rust/PHP boundary.
//!
//! The bridge exchanges primitive JSON types plus two escapes: host objects
//! and host functions travel as host-registry handles, and PHP instances
//! travel as PHP-side instance IDs. [`Value`] is the host-side superset of
//! all of these; the [`marshal`](crate::marshal) module maps it onto wire
//! JSON.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::host::{HostFn, HostObject};

/// A value that can be sent to or received from PHP.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// A plain sequence (PHP list).
    Arr(Vec<Value>),
    /// A plain record (PHP associative array / stdClass).
    Map(BTreeMap<String, Value>),
    /// A host object; marshalled as a host-registry handle.
    Obj(Arc<dyn HostObject>),
    /// A host function; marshalled as a host-registry handle.
    Fun(HostFn),
    /// A reference to a PHP-side instance by its PHP handle ID.
    PhpRef(u32),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// True for values that marshal as host handles rather than JSON.
    pub fn is_handle_eligible(&self) -> bool {
        matches!(self, Value::Obj(_) | Value::Fun(_))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_arr(&self) -> Option<&[Value]> {
        match self {
            Value::Arr(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Index into a sequence or record; `Value::Null` when absent.
    pub fn get(&self, key: &str) -> &Value {
        static NULL: Value = Value::Null;
        match self {
            Value::Map(map) => map.get(key).unwrap_or(&NULL),
            Value::Arr(items) => key
                .parse::<usize>()
                .ok()
                .and_then(|i| items.get(i))
                .unwrap_or(&NULL),
            _ => &NULL,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::Int(n) => write!(f, "Int({})", n),
            Value::Float(x) => write!(f, "Float({})", x),
            Value::Str(s) => write!(f, "Str({:?})", s),
            Value::Arr(items) => f.debug_tuple("Arr").field(items).finish(),
            Value::Map(map) => f.debug_tuple("Map").field(map).finish(),
            Value::Obj(_) => write!(f, "Obj(..)"),
            Value::Fun(_) => write!(f, "Fun(..)"),
            Value::PhpRef(id) => write!(f, "PhpRef({})", id),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Arr(a), Value::Arr(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Obj(a), Value::Obj(b)) => Arc::ptr_eq(a, b),
            (Value::Fun(a), Value::Fun(b)) => a.ptr_eq(b),
            (Value::PhpRef(a), Value::PhpRef(b)) => a == b,
            _ => false,
        }
    }
}

// =============================================================================
// Conversions
// =============================================================================

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Null
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Arr(items.into_iter().map(Into::into).collect())
    }
}

impl From<HostFn> for Value {
    fn from(f: HostFn) -> Self {
        Value::Fun(f)
    }
}

impl From<Arc<dyn HostObject>> for Value {
    fn from(obj: Arc<dyn HostObject>) -> Self {
        Value::Obj(obj)
    }
}

/// Convert plain JSON into a [`Value`], with no sentinel interpretation.
/// Wire payloads go through [`marshal::decode`](crate::marshal::decode)
/// instead, which does substitute handle sentinels.
impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(items) => {
                Value::Arr(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.into_iter().map(|(k, v)| (k, Value::from(v))).collect(),
            ),
        }
    }
}
