//! Statement execution.
//!
//! One prepared statement per call, parameters bound positionally, rows
//! decoded through [`RowToJson`]. Transaction control statements go over the
//! simple protocol. Driver failures are rebuilt into [`LinkError::QueryFailed`]
//! with their diagnostics filtered to a fixed set of fields.

use crate::db::params::{bind_postgres_param, bind_sqlite_param};
use crate::db::pool::DbConnection;
use crate::db::types::RowToJson;
use crate::error::{ErrorContext, LinkError};
use crate::models::{Param, RawResult};
use futures_util::TryStreamExt;
use serde_json::Value as JsonValue;
use sqlx::Either;
use sqlx::postgres::{PgDatabaseError, PgErrorPosition};
use std::collections::BTreeMap;
use tracing::debug;

/// Run one statement with serialized parameters and collect its result.
pub async fn fetch(
    conn: &mut DbConnection,
    sql: &str,
    params: &[Param],
) -> Result<RawResult, sqlx::Error> {
    debug!(params = params.len(), "Executing statement");
    match conn {
        DbConnection::Postgres(c) => postgres::fetch(c, sql, params).await,
        DbConnection::SQLite(c) => sqlite::fetch(c, sql, params).await,
    }
}

/// Run a parameterless statement over the simple protocol.
pub async fn run_statement(conn: &mut DbConnection, sql: &str) -> Result<(), sqlx::Error> {
    impl_db_dispatch!(DbConnection, conn, {
        Postgres(c) => sqlx::raw_sql(sql).execute(&mut **c).await.map(|_| ()),
        SQLite(c) => sqlx::raw_sql(sql).execute(&mut **c).await.map(|_| ()),
    })
}

fn collect_result<R: RowToJson>(affected: u64, rows: Vec<R>) -> RawResult {
    let columns = rows.first().map(R::column_names).unwrap_or_default();
    let rows: Vec<_> = rows.iter().map(RowToJson::to_json_map).collect();
    RawResult {
        row_count: affected.max(rows.len() as u64),
        rows,
        columns,
    }
}

mod postgres {
    use super::*;
    use sqlx::Postgres;
    use sqlx::pool::PoolConnection;

    pub async fn fetch(
        conn: &mut PoolConnection<Postgres>,
        sql: &str,
        params: &[Param],
    ) -> Result<RawResult, sqlx::Error> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_postgres_param(query, param);
        }

        let mut affected = 0;
        let mut rows = Vec::new();
        #[allow(deprecated)]
        let mut stream = query.fetch_many(&mut **conn);
        while let Some(item) = stream.try_next().await? {
            match item {
                Either::Left(done) => affected += done.rows_affected(),
                Either::Right(row) => rows.push(row),
            }
        }
        Ok(collect_result(affected, rows))
    }
}

mod sqlite {
    use super::*;
    use sqlx::Sqlite;
    use sqlx::pool::PoolConnection;

    pub async fn fetch(
        conn: &mut PoolConnection<Sqlite>,
        sql: &str,
        params: &[Param],
    ) -> Result<RawResult, sqlx::Error> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_sqlite_param(query, param);
        }

        let mut affected = 0;
        let mut rows = Vec::new();
        #[allow(deprecated)]
        let mut stream = query.fetch_many(&mut **conn);
        while let Some(item) = stream.try_next().await? {
            match item {
                Either::Left(done) => affected += done.rows_affected(),
                Either::Right(row) => rows.push(row),
            }
        }
        Ok(collect_result(affected, rows))
    }
}

// =============================================================================
// Error Diagnostics
// =============================================================================

/// Human-readable message of a driver error, without the driver's prefix.
pub fn error_message(err: &sqlx::Error) -> String {
    match err {
        sqlx::Error::Database(db) => db.message().to_string(),
        other => other.to_string(),
    }
}

/// Driver diagnostics for a failed statement.
///
/// PostgreSQL keeps the fields useful for diagnosis; transport internals
/// (severity, source file, line and routine of the server) are dropped.
/// `position` is always a number.
pub fn diagnostics(err: &sqlx::Error) -> BTreeMap<String, JsonValue> {
    let mut out = BTreeMap::new();
    let sqlx::Error::Database(db) = err else {
        return out;
    };

    let Some(pg) = db.try_downcast_ref::<PgDatabaseError>() else {
        if let Some(code) = db.code() {
            out.insert("code".to_string(), JsonValue::String(code.into_owned()));
        }
        return out;
    };

    let mut put = |key: &str, value: Option<&str>| {
        if let Some(v) = value {
            out.insert(key.to_string(), JsonValue::String(v.to_string()));
        }
    };
    put("code", Some(pg.code()));
    put("detail", pg.detail());
    put("hint", pg.hint());
    put("where", pg.r#where());
    put("schema", pg.schema());
    put("table", pg.table());
    put("column", pg.column());
    put("data_type", pg.data_type());
    put("constraint", pg.constraint());

    match pg.position() {
        Some(PgErrorPosition::Original(position)) => {
            out.insert("position".to_string(), JsonValue::from(position));
        }
        Some(PgErrorPosition::Internal { position, query }) => {
            out.insert("internal_position".to_string(), JsonValue::from(position));
            out.insert(
                "internal_query".to_string(),
                JsonValue::String(query.to_string()),
            );
        }
        None => {}
    }
    out
}

/// Rebuild a driver error as a query failure carrying the call context.
pub fn query_failed(err: sqlx::Error, context: ErrorContext) -> LinkError {
    LinkError::query_failed(error_message(&err), diagnostics(&err), context)
}
