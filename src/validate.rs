//! Mock result validation.
//!
//! A stand-in value must have the shape its operation declares before it is
//! handed back to the caller. Kinds other than `table`, `row` and `column`
//! pass through unchecked.

use crate::models::{Output, ReturnKind};
use serde_json::Value as JsonValue;

/// Check a mock result against the declared return kind.
///
/// Returns the rejection message on mismatch.
pub fn check_mock_result(kind: Option<ReturnKind>, result: &Output) -> Result<(), &'static str> {
    match kind {
        Some(ReturnKind::Table) => match result {
            Some(JsonValue::Array(rows)) => {
                if rows.iter().all(JsonValue::is_object) {
                    Ok(())
                } else {
                    Err("mock does not return rows")
                }
            }
            _ => Err("mock does not return a table"),
        },
        Some(ReturnKind::Row) => match result {
            None => Ok(()),
            Some(JsonValue::Null) => Err("mock returns null, not a row"),
            Some(JsonValue::Object(row)) if row.is_empty() => {
                Err("mock row should have at least one column")
            }
            Some(JsonValue::Object(_)) => Ok(()),
            Some(_) => Err("mock does not return a row"),
        },
        Some(ReturnKind::Column) => match result {
            None | Some(JsonValue::Array(_)) => Ok(()),
            Some(JsonValue::Null) => Err("mock returns null, not a column"),
            Some(_) => Err("mock does not return a column"),
        },
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TABLE: Option<ReturnKind> = Some(ReturnKind::Table);
    const ROW: Option<ReturnKind> = Some(ReturnKind::Row);
    const COLUMN: Option<ReturnKind> = Some(ReturnKind::Column);

    #[test]
    fn test_table_validation() {
        assert_eq!(
            check_mock_result(TABLE, &Some(json!(42))),
            Err("mock does not return a table")
        );
        assert_eq!(
            check_mock_result(TABLE, &None),
            Err("mock does not return a table")
        );
        assert_eq!(
            check_mock_result(TABLE, &Some(json!([42]))),
            Err("mock does not return rows")
        );
        assert_eq!(
            check_mock_result(TABLE, &Some(json!([[1, 2]]))),
            Err("mock does not return rows")
        );
        assert_eq!(
            check_mock_result(TABLE, &Some(json!([{"num": 0}, null]))),
            Err("mock does not return rows")
        );
        assert!(check_mock_result(TABLE, &Some(json!([{"num": 0}, {"num": 1}]))).is_ok());
        assert!(check_mock_result(TABLE, &Some(json!([]))).is_ok());
    }

    #[test]
    fn test_row_validation() {
        assert!(check_mock_result(ROW, &None).is_ok());
        assert_eq!(
            check_mock_result(ROW, &Some(JsonValue::Null)),
            Err("mock returns null, not a row")
        );
        assert_eq!(
            check_mock_result(ROW, &Some(json!(42))),
            Err("mock does not return a row")
        );
        assert_eq!(
            check_mock_result(ROW, &Some(json!({}))),
            Err("mock row should have at least one column")
        );
        assert!(check_mock_result(ROW, &Some(json!({"x": 1}))).is_ok());
    }

    #[test]
    fn test_column_validation() {
        assert!(check_mock_result(COLUMN, &None).is_ok());
        assert!(check_mock_result(COLUMN, &Some(json!([1, 2, 3]))).is_ok());
        assert_eq!(
            check_mock_result(COLUMN, &Some(JsonValue::Null)),
            Err("mock returns null, not a column")
        );
        assert_eq!(
            check_mock_result(COLUMN, &Some(json!("a"))),
            Err("mock does not return a column")
        );
    }

    #[test]
    fn test_other_kinds_pass_through() {
        assert!(check_mock_result(Some(ReturnKind::Value), &Some(json!({"a": 1}))).is_ok());
        assert!(check_mock_result(None, &Some(json!(null))).is_ok());
        assert!(check_mock_result(Some(ReturnKind::WriteStream), &None).is_ok());
    }
}
