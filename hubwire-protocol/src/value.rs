//! Dynamically typed values carried as invocation arguments and results.

use crate::error::ProtocolError;
use indexmap::IndexMap;
use std::fmt;

/// Ordered string-keyed map of values.
pub type ValueMap = IndexMap<String, Value>;

/// The kind of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Null,
    Boolean,
    Float64,
    String,
    Binary,
    Array,
    Map,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Null => "null",
            ValueKind::Boolean => "boolean",
            ValueKind::Float64 => "float64",
            ValueKind::String => "string",
            ValueKind::Binary => "binary",
            ValueKind::Array => "array",
            ValueKind::Map => "map",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A protocol value.
///
/// Numbers are always held as `f64`. The codecs write integral values that fit
/// in 64 bits as wire integers, see [`Value::as_wire_integer`].
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Float64(f64),
    String(String),
    Binary(Vec<u8>),
    Array(Vec<Value>),
    Map(ValueMap),
}

/// An integral number as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireInteger {
    Signed(i64),
    Unsigned(u64),
}

impl Value {
    pub fn null() -> Self {
        Value::Null
    }

    pub fn binary(bytes: impl Into<Vec<u8>>) -> Self {
        Value::Binary(bytes.into())
    }

    /// Returns the kind of the active variant.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Boolean,
            Value::Float64(_) => ValueKind::Float64,
            Value::String(_) => ValueKind::String,
            Value::Binary(_) => ValueKind::Binary,
            Value::Array(_) => ValueKind::Array,
            Value::Map(_) => ValueKind::Map,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns the boolean value.
    ///
    /// A `Float64` holding exactly `0.0` or `1.0` is accepted as `false`/`true`.
    pub fn as_bool(&self) -> Result<bool, ProtocolError> {
        match self {
            Value::Bool(b) => Ok(*b),
            Value::Float64(n) if *n == 0.0 => Ok(false),
            Value::Float64(n) if *n == 1.0 => Ok(true),
            other => Err(other.mismatch(ValueKind::Boolean)),
        }
    }

    pub fn as_f64(&self) -> Result<f64, ProtocolError> {
        match self {
            Value::Float64(n) => Ok(*n),
            other => Err(other.mismatch(ValueKind::Float64)),
        }
    }

    pub fn as_str(&self) -> Result<&str, ProtocolError> {
        match self {
            Value::String(s) => Ok(s),
            other => Err(other.mismatch(ValueKind::String)),
        }
    }

    pub fn as_binary(&self) -> Result<&[u8], ProtocolError> {
        match self {
            Value::Binary(b) => Ok(b),
            other => Err(other.mismatch(ValueKind::Binary)),
        }
    }

    pub fn as_array(&self) -> Result<&[Value], ProtocolError> {
        match self {
            Value::Array(items) => Ok(items),
            other => Err(other.mismatch(ValueKind::Array)),
        }
    }

    pub fn as_map(&self) -> Result<&ValueMap, ProtocolError> {
        match self {
            Value::Map(map) => Ok(map),
            other => Err(other.mismatch(ValueKind::Map)),
        }
    }

    /// Consumes the value, returning the array items.
    pub fn into_array(self) -> Result<Vec<Value>, ProtocolError> {
        match self {
            Value::Array(items) => Ok(items),
            other => Err(other.mismatch(ValueKind::Array)),
        }
    }

    fn mismatch(&self, expected: ValueKind) -> ProtocolError {
        ProtocolError::TypeMismatch {
            actual: self.kind(),
            expected,
        }
    }

    /// Returns the integer a number collapses to on the wire, if any.
    ///
    /// Integral values are written as signed integers when negative and
    /// `>= i64::MIN`, as unsigned integers when non-negative and
    /// `<= u64::MAX`. Everything else stays a float.
    pub fn as_wire_integer(n: f64) -> Option<WireInteger> {
        if !n.is_finite() || n.fract() != 0.0 {
            return None;
        }
        if n < 0.0 {
            if n >= i64::MIN as f64 {
                return Some(WireInteger::Signed(n as i64));
            }
        } else if n < u64::MAX as f64 {
            return Some(WireInteger::Unsigned(n as u64));
        }
        None
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float64(n)
    }
}

impl From<f32> for Value {
    fn from(n: f32) -> Self {
        Value::Float64(n as f64)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Float64(n as f64)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Float64(n as f64)
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Float64(n as f64)
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Float64(n as f64)
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

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<ValueMap> for Value {
    fn from(map: ValueMap) -> Self {
        Value::Map(map)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Float64(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Binary(b) => write!(f, "<{} bytes>", b.len()),
            Value::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
            Value::Map(map) => {
                f.write_str("{")?;
                for (i, (key, value)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{:?}:{}", key, value)?;
                }
                f.write_str("}")
            }
        }
    }
}
