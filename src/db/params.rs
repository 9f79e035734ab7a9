//! Parameter binding utilities for database queries.
//!
//! Arguments arrive already serialized (see [`Param::serialize`]): no bytes,
//! no custom values. Arrays bind as native PostgreSQL arrays when every
//! element has the same scalar type, and as JSON otherwise.

use crate::models::Param;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgArguments;
use sqlx::sqlite::SqliteArguments;
use sqlx::types::Json;
use sqlx::{Postgres, Sqlite};

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;
type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// Bind a parameter to a PostgreSQL query.
pub(crate) fn bind_postgres_param<'q>(query: PgQuery<'q>, param: &'q Param) -> PgQuery<'q> {
    match param {
        // NULL binds as a text parameter; cast in SQL where another type is needed
        Param::Null => query.bind(None::<String>),
        Param::Bool(v) => query.bind(*v),
        Param::Int(v) => query.bind(*v),
        Param::Float(v) => query.bind(*v),
        Param::Text(v) => query.bind(v.as_str()),
        Param::Json(v) => query.bind(Json(v)),
        Param::Array(items) => bind_postgres_array(query, items),
        Param::Bytes(_) | Param::Custom(_) => query.bind(param.to_json().as_str().map(String::from)),
    }
}

fn bind_postgres_array<'q>(query: PgQuery<'q>, items: &'q [Param]) -> PgQuery<'q> {
    match homogeneous(items) {
        Some("bool") => query.bind(collect(items, |p| match p {
            Param::Bool(v) => Some(*v),
            _ => None,
        })),
        Some("int") => query.bind(collect(items, |p| match p {
            Param::Int(v) => Some(*v),
            _ => None,
        })),
        Some("float") => query.bind(collect(items, |p| match p {
            Param::Float(v) => Some(*v),
            _ => None,
        })),
        Some("text") => query.bind(collect(items, |p| match p {
            Param::Text(v) => Some(v.clone()),
            _ => None,
        })),
        _ => query.bind(Json(array_json(items))),
    }
}

/// Element type shared by every non-null element, if there is one.
fn homogeneous(items: &[Param]) -> Option<&'static str> {
    let mut kinds = items.iter().filter(|p| !p.is_null()).map(Param::type_name);
    let first = kinds.next().unwrap_or("text");
    kinds.all(|k| k == first).then_some(first)
}

fn collect<T>(items: &[Param], f: impl Fn(&Param) -> Option<T>) -> Vec<Option<T>> {
    items.iter().map(f).collect()
}

fn array_json(items: &[Param]) -> JsonValue {
    JsonValue::Array(items.iter().map(Param::to_json).collect())
}

/// Bind a parameter to a SQLite query.
pub(crate) fn bind_sqlite_param<'q>(query: SqliteQuery<'q>, param: &'q Param) -> SqliteQuery<'q> {
    match param {
        Param::Null => query.bind(None::<String>),
        Param::Bool(v) => query.bind(*v),
        Param::Int(v) => query.bind(*v),
        Param::Float(v) => query.bind(*v),
        Param::Text(v) => query.bind(v.as_str()),
        // SQLite doesn't have native JSON or array types, store as string
        Param::Json(v) => query.bind(v.to_string()),
        Param::Array(items) => query.bind(array_json(items).to_string()),
        Param::Bytes(_) | Param::Custom(_) => query.bind(param.to_json().as_str().map(String::from)),
    }
}
