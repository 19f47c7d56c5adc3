//! Runtime value types crossing the sandbox boundary.
//!
//! Every value that enters or leaves the sandbox is reified as a
//! [`RuntimeValue`]. The sum is closed: there is no escape hatch for host
//! objects, functions, or engine-internal handles. Integers and floats are
//! distinct variants because the boundary codec must round-trip them
//! faithfully.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A dynamically-typed value as seen by handler scripts.
///
/// The `untagged` representation keeps the wire shape natural for the
/// sandboxed engine: integers encode as integers, floats as floats, maps as
/// maps. `Int` is listed before `Float` so integral numbers decode as `Int`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RuntimeValue {
    /// Null / absent value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value
    Int(i64),
    /// Floating-point value
    Float(f64),
    /// String value
    String(String),
    /// Ordered sequence of values
    List(Vec<RuntimeValue>),
    /// String-keyed mapping of values
    Map(HashMap<String, RuntimeValue>),
}

impl RuntimeValue {
    /// Check if the value is null
    pub fn is_null(&self) -> bool {
        matches!(self, RuntimeValue::Null)
    }

    /// Get as boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            RuntimeValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get as integer
    pub fn as_int(&self) -> Option<i64> {
        match self {
            RuntimeValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Get as float; integers widen losslessly where possible
    pub fn as_float(&self) -> Option<f64> {
        match self {
            RuntimeValue::Float(n) => Some(*n),
            RuntimeValue::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    /// Get as string slice
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RuntimeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get as list
    pub fn as_list(&self) -> Option<&[RuntimeValue]> {
        match self {
            RuntimeValue::List(items) => Some(items),
            _ => None,
        }
    }

    /// Get as map
    pub fn as_map(&self) -> Option<&HashMap<String, RuntimeValue>> {
        match self {
            RuntimeValue::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Look up a key on a map value. Returns `None` for non-maps.
    pub fn get(&self, key: &str) -> Option<&RuntimeValue> {
        self.as_map().and_then(|m| m.get(key))
    }
}

impl Default for RuntimeValue {
    fn default() -> Self {
        RuntimeValue::Null
    }
}

impl From<bool> for RuntimeValue {
    fn from(b: bool) -> Self {
        RuntimeValue::Bool(b)
    }
}

impl From<i64> for RuntimeValue {
    fn from(n: i64) -> Self {
        RuntimeValue::Int(n)
    }
}

impl From<i32> for RuntimeValue {
    fn from(n: i32) -> Self {
        RuntimeValue::Int(n as i64)
    }
}

impl From<f64> for RuntimeValue {
    fn from(n: f64) -> Self {
        RuntimeValue::Float(n)
    }
}

impl From<String> for RuntimeValue {
    fn from(s: String) -> Self {
        RuntimeValue::String(s)
    }
}

impl From<&str> for RuntimeValue {
    fn from(s: &str) -> Self {
        RuntimeValue::String(s.to_string())
    }
}

impl<T: Into<RuntimeValue>> From<Vec<T>> for RuntimeValue {
    fn from(v: Vec<T>) -> Self {
        RuntimeValue::List(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<RuntimeValue>> From<HashMap<String, T>> for RuntimeValue {
    fn from(m: HashMap<String, T>) -> Self {
        RuntimeValue::Map(m.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}
