//! Row decoding.
//!
//! Type conversion uses a two-phase approach:
//! 1. `TypeCategory` classifies column types into logical categories
//! 2. Driver-specific decoders handle the actual value extraction
//!
//! Binary columns come back as `\x`-escaped hex text, the same form binary
//! arguments are sent in. PostgreSQL values with no direct mapping are read
//! from their wire bytes through [`PgRaw`].

use crate::config::Driver;
use crate::models::hex_escape;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueFormat, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row, Type, TypeInfo, ValueRef};

// =============================================================================
// Type Classification
// =============================================================================

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Uuid,
    Timestamp,
    TimestampTz,
    Date,
    Time,
    Array,
    Unknown,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, driver: Driver) -> TypeCategory {
    let lower = type_name.to_lowercase();

    if lower.ends_with("[]") {
        return TypeCategory::Array;
    }

    // Decimal/Numeric - check first as it overlaps with "numeric" in float checks
    if lower.contains("decimal") || lower.contains("numeric") {
        // SQLite's NUMERIC is actually a float
        if driver == Driver::Sqlite {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }

    if lower.contains("int") || lower.contains("serial") {
        return TypeCategory::Integer;
    }

    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }

    if lower.contains("float") || lower.contains("double") || lower == "real" {
        return TypeCategory::Float;
    }

    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }

    if lower == "uuid" {
        return TypeCategory::Uuid;
    }

    if lower.contains("blob") || lower == "bytea" {
        return TypeCategory::Binary;
    }

    match lower.as_str() {
        "timestamptz" => TypeCategory::TimestampTz,
        "timestamp" | "datetime" => TypeCategory::Timestamp,
        "date" => TypeCategory::Date,
        "time" => TypeCategory::Time,
        "text" | "varchar" | "char" | "bpchar" | "name" | "citext" => TypeCategory::Text,
        _ => TypeCategory::Unknown,
    }
}

// =============================================================================
// Raw PostgreSQL Values
// =============================================================================

/// A PostgreSQL value as it arrived on the wire, for any column type.
#[derive(Debug)]
pub struct PgRaw {
    pub format: PgValueFormat,
    pub bytes: Vec<u8>,
}

impl Type<sqlx::Postgres> for PgRaw {
    fn type_info() -> PgTypeInfo {
        <String as Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(_ty: &PgTypeInfo) -> bool {
        true
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for PgRaw {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        Ok(PgRaw {
            format: value.format(),
            bytes: value.as_bytes()?.to_vec(),
        })
    }
}

impl PgRaw {
    /// Text form of the value: the text itself, or UTF-8 binary data, or hex.
    fn into_text(self) -> String {
        match String::from_utf8(self.bytes) {
            Ok(s) => s,
            Err(e) => hex_escape(e.as_bytes()),
        }
    }

    /// NUMERIC as its exact decimal string.
    pub fn numeric_string(self) -> Result<String, String> {
        match self.format {
            PgValueFormat::Text => Ok(self.into_text()),
            PgValueFormat::Binary => decode_numeric(&self.bytes),
        }
    }

    /// UUID in canonical hyphenated form.
    pub fn uuid_string(self) -> Result<String, String> {
        match self.format {
            PgValueFormat::Text => Ok(self.into_text()),
            PgValueFormat::Binary => {
                if self.bytes.len() != 16 {
                    return Err(format!("uuid has {} bytes", self.bytes.len()));
                }
                let hex: String = self.bytes.iter().map(|b| format!("{b:02x}")).collect();
                Ok(format!(
                    "{}-{}-{}-{}-{}",
                    &hex[0..8],
                    &hex[8..12],
                    &hex[12..16],
                    &hex[16..20],
                    &hex[20..32]
                ))
            }
        }
    }
}

const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;

/// Decode the binary NUMERIC format: a header of digit count, weight, sign
/// and display scale, followed by base-10000 digits.
fn decode_numeric(bytes: &[u8]) -> Result<String, String> {
    let word = |i: usize| -> Result<u16, String> {
        bytes
            .get(i * 2..i * 2 + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .ok_or_else(|| "truncated numeric".to_string())
    };

    let ndigits = word(0)? as usize;
    let weight = word(1)? as i16 as i32;
    let sign = word(2)?;
    let dscale = word(3)? as usize;
    if sign == NUMERIC_NAN {
        return Ok("NaN".to_string());
    }
    let digits = (0..ndigits)
        .map(|i| word(4 + i))
        .collect::<Result<Vec<u16>, String>>()?;

    // digits[i] has weight (weight - i)
    let digit_at = |p: i32| -> u16 {
        usize::try_from(weight - p)
            .ok()
            .and_then(|i| digits.get(i).copied())
            .unwrap_or(0)
    };

    let mut out = String::new();
    if sign == NUMERIC_NEG {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        out.push_str(&digit_at(weight).to_string());
        for p in (0..weight).rev() {
            out.push_str(&format!("{:04}", digit_at(p)));
        }
    }
    if dscale > 0 {
        let groups = dscale.div_ceil(4);
        let mut fraction: String = (1..=groups as i32)
            .map(|k| format!("{:04}", digit_at(-k)))
            .collect();
        fraction.truncate(dscale);
        out.push('.');
        out.push_str(&fraction);
    }
    Ok(out)
}

// =============================================================================
// Row to JSON Trait
// =============================================================================

/// Trait for converting database rows to JSON maps.
pub trait RowToJson {
    fn to_json_map(&self) -> serde_json::Map<String, JsonValue>;

    /// Column names in declaration order.
    fn column_names(&self) -> Vec<String>;
}

impl RowToJson for PgRow {
    fn to_json_map(&self) -> serde_json::Map<String, JsonValue> {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let category = categorize_type(col.type_info().name(), Driver::Postgres);
                (col.name().to_string(), postgres::decode_column(self, idx, category))
            })
            .collect()
    }

    fn column_names(&self) -> Vec<String> {
        self.columns().iter().map(|c| c.name().to_string()).collect()
    }
}

impl RowToJson for SqliteRow {
    fn to_json_map(&self) -> serde_json::Map<String, JsonValue> {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let type_name = col.type_info().name();
                let category = categorize_type(type_name, Driver::Sqlite);
                (col.name().to_string(), sqlite::decode_column(self, idx, category))
            })
            .collect()
    }

    fn column_names(&self) -> Vec<String> {
        self.columns().iter().map(|c| c.name().to_string()).collect()
    }
}

fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

// =============================================================================
// Driver-Specific Decoders
// =============================================================================

mod postgres {
    use super::*;
    use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

    pub fn decode_column(row: &PgRow, idx: usize, category: TypeCategory) -> JsonValue {
        let decoded = match category {
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Float => decode_float(row, idx),
            TypeCategory::Decimal => Some(decode_raw(row, idx, PgRaw::numeric_string)),
            TypeCategory::Boolean => get::<bool>(row, idx),
            TypeCategory::Binary => get::<Vec<u8>>(row, idx),
            TypeCategory::Json => get::<JsonValue>(row, idx),
            TypeCategory::Uuid => Some(decode_raw(row, idx, PgRaw::uuid_string)),
            TypeCategory::TimestampTz => get::<DateTime<Utc>>(row, idx),
            TypeCategory::Timestamp => get::<NaiveDateTime>(row, idx),
            TypeCategory::Date => get::<NaiveDate>(row, idx),
            TypeCategory::Time => get::<NaiveTime>(row, idx),
            TypeCategory::Array => decode_array(row, idx),
            TypeCategory::Text | TypeCategory::Unknown => get::<String>(row, idx),
        };
        decoded.unwrap_or_else(|| decode_raw(row, idx, |raw| Ok(raw.into_text())))
    }

    /// `Some` when the column decodes as `T`; NULL becomes `Some(Null)`.
    fn get<T>(row: &PgRow, idx: usize) -> Option<JsonValue>
    where
        T: for<'r> Decode<'r, sqlx::Postgres> + Type<sqlx::Postgres> + Into<JsonValueSource>,
    {
        match row.try_get::<Option<T>, _>(idx) {
            Ok(Some(v)) => Some(v.into().0),
            Ok(None) => Some(JsonValue::Null),
            Err(_) => None,
        }
    }

    fn decode_raw(
        row: &PgRow,
        idx: usize,
        f: impl FnOnce(PgRaw) -> Result<String, String>,
    ) -> JsonValue {
        match row.try_get::<Option<PgRaw>, _>(idx) {
            Ok(Some(raw)) => match f(raw) {
                Ok(s) => JsonValue::String(s),
                Err(e) => {
                    tracing::error!("Failed to decode column {idx}: {e}");
                    JsonValue::Null
                }
            },
            Ok(None) => JsonValue::Null,
            Err(e) => {
                tracing::error!("Failed to read column {idx}: {e:?}");
                JsonValue::Null
            }
        }
    }

    fn decode_integer(row: &PgRow, idx: usize) -> Option<JsonValue> {
        if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
            return Some(v.map(JsonValue::from).unwrap_or(JsonValue::Null));
        }
        if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
            return Some(v.map(JsonValue::from).unwrap_or(JsonValue::Null));
        }
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return Some(v.map(JsonValue::from).unwrap_or(JsonValue::Null));
        }
        None
    }

    fn decode_float(row: &PgRow, idx: usize) -> Option<JsonValue> {
        if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
            return Some(v.map(float_value).unwrap_or(JsonValue::Null));
        }
        if let Ok(v) = row.try_get::<Option<f32>, _>(idx) {
            return Some(v.map(|v| float_value(f64::from(v))).unwrap_or(JsonValue::Null));
        }
        None
    }

    fn decode_array(row: &PgRow, idx: usize) -> Option<JsonValue> {
        macro_rules! try_array {
            ($ty:ty, $map:expr) => {
                if let Ok(v) = row.try_get::<Option<Vec<$ty>>, _>(idx) {
                    return Some(match v {
                        Some(items) => JsonValue::Array(items.into_iter().map($map).collect()),
                        None => JsonValue::Null,
                    });
                }
            };
        }

        try_array!(i16, JsonValue::from);
        try_array!(i32, JsonValue::from);
        try_array!(i64, JsonValue::from);
        try_array!(f32, |v: f32| float_value(f64::from(v)));
        try_array!(f64, float_value);
        try_array!(bool, JsonValue::Bool);
        try_array!(String, JsonValue::String);
        try_array!(Vec<u8>, |v: Vec<u8>| JsonValue::String(hex_escape(&v)));
        try_array!(JsonValue, |v: JsonValue| v);
        None
    }

    /// Conversion into JSON for the directly decodable types.
    pub struct JsonValueSource(pub JsonValue);

    impl From<bool> for JsonValueSource {
        fn from(v: bool) -> Self {
            Self(JsonValue::Bool(v))
        }
    }

    impl From<String> for JsonValueSource {
        fn from(v: String) -> Self {
            Self(JsonValue::String(v))
        }
    }

    impl From<Vec<u8>> for JsonValueSource {
        fn from(v: Vec<u8>) -> Self {
            Self(JsonValue::String(hex_escape(&v)))
        }
    }

    impl From<JsonValue> for JsonValueSource {
        fn from(v: JsonValue) -> Self {
            Self(v)
        }
    }

    impl From<DateTime<Utc>> for JsonValueSource {
        fn from(v: DateTime<Utc>) -> Self {
            Self(JsonValue::String(v.to_rfc3339()))
        }
    }

    impl From<NaiveDateTime> for JsonValueSource {
        fn from(v: NaiveDateTime) -> Self {
            Self(JsonValue::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string()))
        }
    }

    impl From<NaiveDate> for JsonValueSource {
        fn from(v: NaiveDate) -> Self {
            Self(JsonValue::String(v.to_string()))
        }
    }

    impl From<NaiveTime> for JsonValueSource {
        fn from(v: NaiveTime) -> Self {
            Self(JsonValue::String(v.to_string()))
        }
    }
}

mod sqlite {
    use super::*;

    pub fn decode_column(row: &SqliteRow, idx: usize, category: TypeCategory) -> JsonValue {
        match category {
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Boolean => row
                .try_get::<Option<bool>, _>(idx)
                .ok()
                .flatten()
                .map(JsonValue::Bool)
                .unwrap_or(JsonValue::Null),
            TypeCategory::Float | TypeCategory::Decimal => decode_float(row, idx),
            TypeCategory::Binary => decode_binary(row, idx),
            TypeCategory::Json => decode_text(row, idx, true),
            _ => decode_dynamic(row, idx),
        }
    }

    fn decode_integer(row: &SqliteRow, idx: usize) -> JsonValue {
        row.try_get::<Option<i64>, _>(idx)
            .ok()
            .flatten()
            .map(JsonValue::from)
            .unwrap_or(JsonValue::Null)
    }

    fn decode_float(row: &SqliteRow, idx: usize) -> JsonValue {
        row.try_get::<Option<f64>, _>(idx)
            .ok()
            .flatten()
            .map(float_value)
            .unwrap_or(JsonValue::Null)
    }

    fn decode_binary(row: &SqliteRow, idx: usize) -> JsonValue {
        row.try_get::<Option<Vec<u8>>, _>(idx)
            .ok()
            .flatten()
            .map(|v| JsonValue::String(hex_escape(&v)))
            .unwrap_or(JsonValue::Null)
    }

    fn decode_text(row: &SqliteRow, idx: usize, parse_json: bool) -> JsonValue {
        match row.try_get::<Option<String>, _>(idx) {
            Ok(Some(v)) => {
                if parse_json {
                    if let Ok(json) = serde_json::from_str::<JsonValue>(&v) {
                        return json;
                    }
                }
                JsonValue::String(v)
            }
            _ => JsonValue::Null,
        }
    }

    /// Expression columns carry the storage class of their value rather than
    /// a declared type, so try each class in turn.
    fn decode_dynamic(row: &SqliteRow, idx: usize) -> JsonValue {
        let Ok(raw) = row.try_get_raw(idx) else {
            return JsonValue::Null;
        };
        if raw.is_null() {
            return JsonValue::Null;
        }
        match raw.type_info().name() {
            "INTEGER" => decode_integer(row, idx),
            "REAL" => decode_float(row, idx),
            "BLOB" => decode_binary(row, idx),
            _ => decode_text(row, idx, false),
        }
    }
}
