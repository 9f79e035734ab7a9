//! Live database backend.

use super::{Call, Compiler, Connection, CopyStream, TxnStep, connection_id, host_dimensions};
use crate::config::ConnectionOptions;
use crate::db::executor::{self, query_failed};
use crate::db::{DbConnection, PoolEntry, PoolManager, retry_connect};
use crate::error::{ErrorContext, LinkError, LinkResult};
use crate::models::{Output, RawResult, ReturnKind};
use crate::observe::{Dimensions, Observer, Timer};
use crate::shape::shape;
use serde_json::{Value as JsonValue, json};
use sqlx::postgres::PgConnection;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{Instrument, debug, info_span, warn};

/// A checked-out connection that tracks whether a transaction is open.
///
/// Dropped while a transaction is open, e.g. when the unit of work is
/// cancelled between `begin` and `commit`, the connection is closed instead
/// of being returned to the pool.
pub(super) struct LiveClient {
    conn: Mutex<DbConnection>,
    in_txn: AtomicBool,
}

impl LiveClient {
    pub(super) fn new(conn: DbConnection) -> Self {
        Self {
            conn: Mutex::new(conn),
            in_txn: AtomicBool::new(false),
        }
    }

    async fn lock(&self) -> MutexGuard<'_, DbConnection> {
        self.conn.lock().await
    }

    /// Whether a `begin` was issued without a matching commit or rollback.
    fn in_txn(&self) -> bool {
        self.in_txn.load(Ordering::SeqCst)
    }
}

impl Drop for LiveClient {
    fn drop(&mut self) {
        if *self.in_txn.get_mut() {
            warn!("Closing connection released inside a transaction");
            self.conn.get_mut().close_on_drop();
        }
    }
}

/// Runs operations against a pooled PostgreSQL or SQLite connection.
#[derive(Debug)]
pub struct LiveBackend {
    options: ConnectionOptions,
    compiler: Compiler,
    pools: Arc<PoolManager>,
}

impl LiveBackend {
    pub fn new(options: ConnectionOptions, directory: PathBuf, pools: Arc<PoolManager>) -> Self {
        Self {
            options,
            compiler: Compiler::new(directory),
            pools,
        }
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn compiler(&self) -> &Compiler {
        &self.compiler
    }

    pub fn pools(&self) -> &Arc<PoolManager> {
        &self.pools
    }

    fn prefix(&self) -> &'static str {
        self.options.driver.metric_prefix()
    }

    pub(super) async fn acquire<T>(
        &self,
        observer: &dyn Observer,
        work: impl AsyncFnOnce(&Connection<'_>) -> LinkResult<T>,
    ) -> LinkResult<T> {
        let prefix = self.prefix();
        let host = host_dimensions(&self.options);
        let entry = self.pools.get_or_create(&self.options).await?;
        let pool: &PoolEntry = &entry;
        let host_ref = &host;

        let stats = pool.stats();
        let span = info_span!(
            "connect",
            backend = prefix,
            host = %self.options.host,
            clients = stats.clients,
            idle = stats.idle,
            waiting = stats.waiting,
        );
        let timer = Timer::start(format!("{prefix}.connect.duration"));
        let connecting = retry_connect(&self.options.retry, move |_| {
            observer.debug("connecting", &occupancy(pool, host_ref, None, None));
            pool.acquire()
        });
        let (id, connected) = async { tokio::join!(connection_id(), connecting) }
            .instrument(span)
            .await;

        let (client, failures) = match connected {
            Ok(found) => found,
            Err(messages) => {
                let ms = timer.finish(observer, &host);
                let mut dims = occupancy(pool, &host, None, Some(ms));
                dims.insert("attempts".into(), json!(messages.len()));
                dims.insert("messages".into(), json!(messages));
                let err = LinkError::ConnectFailed {
                    host: self.options.host.clone(),
                    attempts: messages.len() as u32,
                    messages,
                    elapsed_ms: ms as u64,
                };
                observer.fail("Failed to connect to database", &err, &dims);
                return Err(err);
            }
        };

        let ms = timer.finish(observer, &host);
        observer.debug("connected", &occupancy(pool, &host, Some(&id), Some(ms)));
        observer.count(
            &format!("{prefix}.connect.retries"),
            failures.len() as u64,
            &host,
        );

        let timer = Timer::start(format!("{prefix}.connection.duration"));
        let span = info_span!(
            "connection",
            backend = prefix,
            host = %self.options.host,
            connection_id = %id,
        );
        let conn = Connection::live(id.clone(), observer, self, client);
        let result = work(&conn).instrument(span).await;
        let ms = timer.finish(observer, &host);
        drop(conn);
        observer.debug("disconnected", &occupancy(pool, &host, Some(&id), Some(ms)));
        result
    }

    pub(super) async fn query(
        &self,
        conn: &Connection<'_>,
        client: &LiveClient,
        call: Call,
    ) -> LinkResult<Output> {
        let observer = conn.observer();
        let timer = Timer::start(format!("{}.query.duration", self.prefix()));
        let span = info_span!("query", operation = %call.op.name(), connection_id = %conn.id());
        let fetched = async {
            let mut client = client.lock().await;
            executor::fetch(&mut client, call.op.sql(), &call.serialized).await
        }
        .instrument(span)
        .await;

        let dims = self.query_dimensions(call.op.name());
        match fetched {
            Ok(raw) => {
                let ms = timer.finish(observer, &dims);
                self.log_query(observer, &call.context, ms);
                Ok(shape(call.op.return_kind(), raw))
            }
            Err(e) => {
                let err = query_failed(e, call.context);
                observer.fail("query failed", &err, &dims);
                Err(err)
            }
        }
    }

    /// Run a bulk copy, handing the stream to `callback`.
    pub(super) async fn copy<F>(
        &self,
        conn: &Connection<'_>,
        client: &LiveClient,
        call: Call,
        callback: F,
    ) -> LinkResult<Output>
    where
        F: AsyncFnOnce(&mut CopyStream<'_>) -> LinkResult<()>,
    {
        let observer = conn.observer();
        let timer = Timer::start(format!("{}.query.duration", self.prefix()));
        let dims = self.query_dimensions(call.op.name());

        let mut client = client.lock().await;
        let DbConnection::Postgres(pg) = &mut *client else {
            return Err(LinkError::usage(
                format!("{}() bulk copy requires PostgreSQL", call.op.name()),
                call.context,
            ));
        };
        let pg: &mut PgConnection = pg;

        let outcome = copy_with(pg, &call, callback).await;
        match outcome {
            Ok(rows) => {
                let ms = timer.finish(observer, &dims);
                self.log_query(observer, &call.context, ms);
                let raw = RawResult {
                    row_count: rows,
                    ..RawResult::default()
                };
                Ok(shape(call.op.return_kind(), raw))
            }
            Err(err) => {
                observer.fail("query failed", &err, &dims);
                Err(err)
            }
        }
    }

    /// Issue a transaction control statement.
    ///
    /// The transaction counts as open from the moment `begin` is sent until
    /// a commit or rollback succeeds. A connection whose rollback failed is
    /// closed instead of being returned to the pool.
    pub(super) async fn statement(
        &self,
        conn: &Connection<'_>,
        client: &LiveClient,
        step: TxnStep,
        sql: &str,
        context: ErrorContext,
    ) -> LinkResult<()> {
        let mut dims = host_dimensions(&self.options);
        dims.insert("connection-id".into(), json!(conn.id()));
        conn.observer().info(sql, &dims);

        let mut db = client.lock().await;
        let was_open = client.in_txn();
        if step == TxnStep::Begin {
            client.in_txn.store(true, Ordering::SeqCst);
        }
        match executor::run_statement(&mut db, sql).await {
            Ok(()) => {
                if step != TxnStep::Begin {
                    client.in_txn.store(false, Ordering::SeqCst);
                }
                Ok(())
            }
            Err(e) => {
                match step {
                    TxnStep::Begin => client.in_txn.store(was_open, Ordering::SeqCst),
                    TxnStep::Rollback => db.close_on_drop(),
                    TxnStep::Commit => {}
                }
                Err(query_failed(e, context))
            }
        }
    }

    pub(super) async fn disconnect(&self) {
        if self.pools.disconnect(&self.options).await {
            debug!(host = %self.options.host, "Disconnected");
        }
    }

    fn query_dimensions(&self, operation: &str) -> Dimensions {
        let mut dims = host_dimensions(&self.options);
        dims.insert("query".into(), json!(operation));
        dims
    }

    fn log_query(&self, observer: &dyn Observer, context: &ErrorContext, ms: f64) {
        let mut dims = context.to_dimensions();
        dims.extend(host_dimensions(&self.options));
        dims.insert("ms".into(), json!(ms));
        observer.info("query", &dims);
    }
}

async fn copy_with<F>(pg: &mut PgConnection, call: &Call, callback: F) -> LinkResult<u64>
where
    F: AsyncFnOnce(&mut CopyStream<'_>) -> LinkResult<()>,
{
    let sql = call.op.sql();
    let context = &call.context;
    let mut stream = if call.op.return_kind() == Some(ReturnKind::WriteStream) {
        let copy = pg
            .copy_in_raw(sql)
            .await
            .map_err(|e| query_failed(e, context.clone()))?;
        CopyStream::copy_in(copy, context.clone())
    } else {
        let chunks = pg
            .copy_out_raw(sql)
            .await
            .map_err(|e| query_failed(e, context.clone()))?;
        CopyStream::copy_out(chunks, context.clone())
    };

    let outcome = callback(&mut stream).await;
    let rows = stream.finish(outcome.is_ok()).await;
    outcome?;
    rows
}

fn occupancy(pool: &PoolEntry, host: &Dimensions, id: Option<&str>, ms: Option<f64>) -> Dimensions {
    let stats = pool.stats();
    let mut dims = Dimensions::new();
    dims.insert("clients".into(), json!(stats.clients));
    dims.insert("idle".into(), json!(stats.idle));
    dims.insert("waiting".into(), json!(stats.waiting));
    if let Some(id) = id {
        dims.insert("connection-id".into(), JsonValue::String(id.to_string()));
    }
    if let Some(ms) = ms {
        dims.insert("ms".into(), json!(ms));
    }
    dims.extend(host.clone());
    dims
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Session;
    use crate::models::Param;
    use crate::observe::MemoryObserver;
    use std::fs;
    use tempfile::TempDir;

    fn backend(dir: &TempDir) -> LiveBackend {
        fs::write(
            dir.path().join("selectInteger.sql"),
            "--* return value\nselect 43 as x\n",
        )
        .unwrap();
        LiveBackend::new(
            ConnectionOptions::sqlite(":memory:"),
            dir.path().to_path_buf(),
            Arc::new(PoolManager::new()),
        )
    }

    #[tokio::test]
    async fn test_metric_order_for_one_call() {
        let dir = TempDir::new().unwrap();
        let live = backend(&dir);
        let observer = MemoryObserver::new();
        let value = live
            .acquire(&observer, async |conn: &Connection<'_>| {
                conn.invoke("selectInteger", vec![]).await
            })
            .await
            .unwrap();
        assert_eq!(value, Some(json!(43)));
        assert_eq!(
            observer.metrics(),
            vec![
                "sqlite.connect.duration",
                "sqlite.connect.retries",
                "sqlite.query.duration",
                "sqlite.connection.duration",
            ]
        );
        live.disconnect().await;
    }

    #[tokio::test]
    async fn test_sqlite_rejects_bulk_copy() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("copyIn.sql"), "--* return writestream\ncopy t from stdin\n")
            .unwrap();
        let live = backend(&dir);
        let observer = MemoryObserver::new();
        let err = live
            .acquire(&observer, async |conn: &Connection<'_>| {
                conn.invoke_with_stream("copyIn", vec![Param::Int(1)], async |s: &mut CopyStream<'_>| {
                    s.write(b"1\n").await
                })
                .await
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Usage { .. }));
        assert!(err.to_string().contains("requires PostgreSQL"));
        live.disconnect().await;
    }

    #[tokio::test]
    async fn test_transaction_flag_follows_statements() {
        let dir = TempDir::new().unwrap();
        let live = backend(&dir);
        let observer = MemoryObserver::new();
        live.acquire(&observer, async |conn: &Connection<'_>| {
            let Session::Live { client, .. } = &conn.session else {
                panic!("expected a live session");
            };
            assert!(!client.in_txn());
            conn.begin(None).await?;
            assert!(client.in_txn());
            conn.commit().await?;
            assert!(!client.in_txn());

            assert!(conn.begin(Some("nonsense")).await.is_err());
            assert!(!client.in_txn());
            conn.begin(None).await?;
            conn.rollback().await?;
            assert!(!client.in_txn());
            Ok::<_, LinkError>(())
        })
        .await
        .unwrap();
        live.disconnect().await;
    }

    #[tokio::test]
    async fn test_occupancy_dimensions() {
        let options = ConnectionOptions::postgres("db");
        let manager = PoolManager::new();
        let pool = manager.get_or_create(&options).await.unwrap();
        let dims = occupancy(&pool, &host_dimensions(&options), Some("abc123"), Some(1.5));
        assert_eq!(dims["host"], json!("db"));
        assert_eq!(dims["connection-id"], json!("abc123"));
        assert_eq!(dims["clients"], json!(0));
        assert_eq!(dims["waiting"], json!(0));
        assert_eq!(dims["ms"], json!(1.5));
        manager.close_all().await;
    }
}
