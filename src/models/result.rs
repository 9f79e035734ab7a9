//! Raw results returned by the drivers.

use serde::Serialize;
use serde_json::Value as JsonValue;

/// One result row: column name to decoded value, in column order.
pub type Row = serde_json::Map<String, JsonValue>;

/// A shaped operation result. `None` is "undefined": no row, no value,
/// or an operation that returns nothing.
pub type Output = Option<JsonValue>;

/// Tabular result of one statement, before shaping.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawResult {
    /// Rows affected or returned, whichever is larger.
    pub row_count: u64,
    pub rows: Vec<Row>,
    /// Column names in declaration order.
    pub columns: Vec<String>,
}

impl RawResult {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// JSON rendering returned for operations with no declared shape.
    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}
