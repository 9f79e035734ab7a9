//! Operation arguments.
//!
//! Arguments are passed positionally. Before they reach a driver they are
//! serialized into their storage form: binary buffers become `\x`-escaped hex
//! text, arrays are serialized element-wise and custom values are converted
//! through [`ToSql`].

use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::Arc;

/// A value that knows its own storage form.
///
/// The returned parameter is serialized again, so a custom value may produce
/// bytes, arrays or even another custom value.
pub trait ToSql: Send + Sync {
    fn to_sql(&self) -> Param;
}

/// A positional argument for an operation.
#[derive(Clone)]
pub enum Param {
    /// NULL value
    Null,
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    Float(f64),
    Text(String),
    /// Binary buffer, sent as `\x`-escaped hex text
    Bytes(Vec<u8>),
    Array(Vec<Param>),
    Json(JsonValue),
    /// Value converted through its own storage form
    Custom(Arc<dyn ToSql>),
}

impl Param {
    /// Wrap a binary buffer.
    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self::Bytes(bytes.into())
    }

    /// Wrap a value that converts itself to a storage form.
    pub fn custom(value: impl ToSql + 'static) -> Self {
        Self::Custom(Arc::new(value))
    }

    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
            Self::Array(_) => "array",
            Self::Json(_) => "json",
            Self::Custom(_) => "custom",
        }
    }

    /// Convert to the storage form sent to the database.
    ///
    /// The result never contains `Bytes` or `Custom`.
    pub fn serialize(&self) -> Param {
        match self {
            Self::Bytes(bytes) => Self::Text(hex_escape(bytes)),
            Self::Array(items) => Self::Array(items.iter().map(Param::serialize).collect()),
            Self::Custom(value) => value.to_sql().serialize(),
            other => other.clone(),
        }
    }

    /// JSON rendering of the storage form, used in error contexts and logs.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Null => JsonValue::Null,
            Self::Bool(v) => JsonValue::Bool(*v),
            Self::Int(v) => JsonValue::from(*v),
            Self::Float(v) => serde_json::Number::from_f64(*v)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Self::Text(v) => JsonValue::String(v.clone()),
            Self::Bytes(v) => JsonValue::String(hex_escape(v)),
            Self::Array(items) => JsonValue::Array(items.iter().map(Param::to_json).collect()),
            Self::Json(v) => v.clone(),
            Self::Custom(v) => v.to_sql().to_json(),
        }
    }
}

/// Encode bytes the way PostgreSQL writes `bytea` in hex output format.
pub fn hex_escape(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("\\x");
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

impl fmt::Debug for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("Null"),
            Self::Bool(v) => f.debug_tuple("Bool").field(v).finish(),
            Self::Int(v) => f.debug_tuple("Int").field(v).finish(),
            Self::Float(v) => f.debug_tuple("Float").field(v).finish(),
            Self::Text(v) => f.debug_tuple("Text").field(v).finish(),
            Self::Bytes(v) => f.debug_tuple("Bytes").field(&v.len()).finish(),
            Self::Array(v) => f.debug_tuple("Array").field(v).finish(),
            Self::Json(v) => f.debug_tuple("Json").field(v).finish(),
            Self::Custom(v) => f.debug_tuple("Custom").field(&v.to_sql()).finish(),
        }
    }
}

impl From<bool> for Param {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Param {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for Param {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Param {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Param {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Param {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<Param>> for Param {
    fn from(v: Vec<Param>) -> Self {
        Self::Array(v)
    }
}

impl<T: Into<Param>> From<Option<T>> for Param {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// JSON arguments map onto the closest scalar variant.
impl From<JsonValue> for Param {
    fn from(v: JsonValue) -> Self {
        match v {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Bool(b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => n.as_f64().map(Self::Float).unwrap_or(Self::Null),
            },
            JsonValue::String(s) => Self::Text(s),
            JsonValue::Array(items) => Self::Array(items.into_iter().map(Param::from).collect()),
            object @ JsonValue::Object(_) => Self::Json(object),
        }
    }
}

/// Build a `Vec<Param>` from heterogeneous values.
///
/// ```ignore
/// conn.invoke("sumN", params![1, 2, "three"]).await?;
/// ```
#[macro_export]
macro_rules! params {
    () => { ::std::vec::Vec::<$crate::models::Param>::new() };
    ($($value:expr),+ $(,)?) => {
        vec![$($crate::models::Param::from($value)),+]
    };
}
