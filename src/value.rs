// src/value.rs - Tag value system
use serde::{Deserialize, Serialize};
use std::fmt;

/// Value carried by a tag
///
/// Values are plain owned data, so cloning a value never shares state with
/// the original.
///
/// # Examples
///
/// ```rust
/// use vigil::Value;
///
/// let int_val = Value::Int(42);
/// let text_val = Value::String("DOWN".to_string());
///
/// // Type conversion
/// assert_eq!(int_val.as_float(), Some(42.0));
/// assert_eq!(text_val.as_string(), "DOWN");
/// assert!(int_val.loosely_equals(&Value::Float(42.0)));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    /// Boolean value
    Bool(bool),
    /// Integer value (64-bit)
    Int(i64),
    /// Floating-point value (64-bit)
    Float(f64),
    /// String value
    String(String),
}

impl Value {
    /// Convert to float if possible
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::String(s) => s.parse().ok(),
        }
    }

    /// Convert to string representation
    pub fn as_string(&self) -> String {
        match self {
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(s) => s.clone(),
        }
    }

    /// Loose equality used by value alarm conditions.
    ///
    /// Numeric values compare numerically across `Int`/`Float`, everything
    /// else compares by variant and content.
    pub fn loosely_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                match (self.as_float(), other.as_float()) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                }
            }
            _ => self == other,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_string())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}
