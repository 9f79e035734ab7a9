//! Result shaping.
//!
//! Converts a [`RawResult`] into the form declared by an operation's
//! `return` pragma.

use crate::models::{Output, RawResult, ReturnKind, Row};
use serde_json::Value as JsonValue;

/// Shape a raw result according to the declared return kind.
///
/// With no declared kind the raw result itself is returned. Stream kinds
/// resolve to the stream's terminal row count.
pub fn shape(kind: Option<ReturnKind>, raw: RawResult) -> Output {
    let Some(kind) = kind else {
        return Some(raw.to_json());
    };
    match kind {
        ReturnKind::None => None,
        ReturnKind::Value => {
            let row = raw.rows.into_iter().next()?;
            first_column(&raw.columns, row)
        }
        ReturnKind::Row => raw.rows.into_iter().next().map(JsonValue::Object),
        ReturnKind::Column => {
            let values = match raw.columns.first() {
                Some(name) => raw
                    .rows
                    .into_iter()
                    .map(|mut row| row.remove(name).unwrap_or(JsonValue::Null))
                    .collect(),
                None => Vec::new(),
            };
            Some(JsonValue::Array(values))
        }
        ReturnKind::Table => Some(JsonValue::Array(
            raw.rows.into_iter().map(JsonValue::Object).collect(),
        )),
        ReturnKind::ReadStream | ReturnKind::WriteStream => Some(JsonValue::from(raw.row_count)),
    }
}

/// Value of the first declared column, falling back to the row's first entry.
fn first_column(columns: &[String], mut row: Row) -> Output {
    match columns.first() {
        Some(name) => row.remove(name),
        None => row.into_iter().next().map(|(_, value)| value),
    }
}
