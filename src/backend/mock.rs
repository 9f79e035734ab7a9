//! Mock backend.
//!
//! Resolves operations from a registry of stand-in values or functions
//! instead of a database. Results are checked against the operation's
//! declared shape, and every result resolves on a later scheduler tick.

use super::{Call, Compiler, Connection, CopyStream, connection_id, host_dimensions};
use crate::config::ConnectionOptions;
use crate::error::{BoxError, LinkError, LinkResult};
use crate::models::{Output, Param};
use crate::observe::{Observer, Timer, dimensions};
use crate::validate::check_mock_result;
use serde_json::{Value as JsonValue, json};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{Instrument, info_span};

type MockFn = dyn Fn(&[Param]) -> Result<Output, BoxError> + Send + Sync;

/// A stand-in for one operation.
#[derive(Clone)]
pub enum Mock {
    /// Returned as-is on every call; `None` is undefined.
    Value(Output),
    /// Called with the caller's arguments on every call.
    Func(Arc<MockFn>),
}

impl fmt::Debug for Mock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mock::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Mock::Func(_) => f.write_str("Func(..)"),
        }
    }
}

/// Shared, mutable registry of stand-ins. Clones share one registry.
#[derive(Debug, Clone, Default)]
pub struct Mocks(Arc<RwLock<HashMap<String, Mock>>>);

impl Mocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a value returned by every call to `name`.
    pub fn set(&self, name: impl Into<String>, value: JsonValue) {
        self.insert(name, Mock::Value(Some(value)));
    }

    /// Register an undefined result for `name`.
    pub fn set_undefined(&self, name: impl Into<String>) {
        self.insert(name, Mock::Value(None));
    }

    /// Register a function computing the result from the call's arguments.
    pub fn set_fn<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&[Param]) -> Result<Output, BoxError> + Send + Sync + 'static,
    {
        self.insert(name, Mock::Func(Arc::new(f)));
    }

    pub fn remove(&self, name: &str) -> Option<Mock> {
        self.0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    pub fn clear(&self) {
        self.0.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn get(&self, name: &str) -> Option<Mock> {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn insert(&self, name: impl Into<String>, mock: Mock) {
        self.0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), mock);
    }
}

/// Answers operations from [`Mocks`]. SQL files are still compiled, so a
/// mock only stands in for operations that exist.
#[derive(Debug)]
pub struct MockBackend {
    options: ConnectionOptions,
    compiler: Compiler,
    mocks: Mocks,
}

impl MockBackend {
    pub fn new(options: ConnectionOptions, directory: PathBuf, mocks: Mocks) -> Self {
        Self {
            options,
            compiler: Compiler::new(directory),
            mocks,
        }
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn compiler(&self) -> &Compiler {
        &self.compiler
    }

    pub fn mocks(&self) -> &Mocks {
        &self.mocks
    }

    pub(super) async fn acquire<T>(
        &self,
        observer: &dyn Observer,
        work: impl AsyncFnOnce(&Connection<'_>) -> LinkResult<T>,
    ) -> LinkResult<T> {
        let host = host_dimensions(&self.options);
        let timer = Timer::start("mock.connect.duration");
        let id = connection_id().await;
        timer.finish(observer, &host);
        observer.count("mock.connect.retries", 0, &host);

        let timer = Timer::start("mock.connection.duration");
        let span = info_span!("connection", backend = "mock", host = %self.options.host, connection_id = %id);
        let conn = Connection::mock(id, observer, self);
        let result = work(&conn).instrument(span).await;
        timer.finish(observer, &host);
        result
    }

    pub(super) async fn query(&self, conn: &Connection<'_>, call: Call) -> LinkResult<Output> {
        let observer = conn.observer();
        let mut dims = call.context.to_dimensions();
        dims.extend(host_dimensions(&self.options));
        let timer = Timer::start("mock.query.duration");
        observer.info("query", &dims);

        let name = call.op.name();
        let Some(mock) = self.mocks.get(name) else {
            return Err(LinkError::MissingMock {
                context: Box::new(call.context),
            });
        };

        tokio::task::yield_now().await;
        timer.finish(observer, &host_dimensions(&self.options));

        let result = match mock {
            Mock::Value(value) => value,
            Mock::Func(f) => f(&call.args).map_err(|cause| LinkError::MockThrew {
                message: format!("mock {name}() threw error"),
                cause,
                context: Box::new(call.context.clone()),
            })?,
        };

        if let Err(message) = check_mock_result(call.op.return_kind(), &result) {
            return Err(LinkError::MockShape {
                message: message.to_string(),
                result,
                context: Box::new(call.context),
            });
        }
        Ok(result)
    }

    /// Run a stream operation: the callback gets a stream that accepts
    /// writes and yields no data, then the stand-in supplies the result.
    pub(super) async fn copy<F>(
        &self,
        conn: &Connection<'_>,
        call: Call,
        callback: F,
    ) -> LinkResult<Output>
    where
        F: AsyncFnOnce(&mut CopyStream<'_>) -> LinkResult<()>,
    {
        let mut stream = CopyStream::memory(call.context.clone());
        callback(&mut stream).await?;
        stream.finish(true).await?;
        self.query(conn, call).await
    }

    pub(super) async fn statement(&self, conn: &Connection<'_>, sql: &str) -> LinkResult<()> {
        conn.observer()
            .info(sql, &dimensions([("connection-id", json!(conn.id()))]));
        tokio::task::yield_now().await;
        Ok(())
    }
}
