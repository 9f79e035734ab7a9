//! Backends and the connection handle.
//!
//! A [`Backend`] compiles operations and hands out [`Connection`]s; it is
//! either a live database pool or an in-memory mock. Operations are looked
//! up by name on the handle: `has_operation` answers existence (compiling on
//! first reference), `invoke` runs one.

pub mod compiler;
pub mod live;
pub mod mock;
pub mod stream;

pub use compiler::{Compiler, Operation, OperationKind, TxnStep};
pub use live::LiveBackend;

use live::LiveClient;
pub use mock::{Mock, MockBackend, Mocks};
pub use stream::CopyStream;

use crate::config::ConnectionOptions;
use crate::db::DbConnection;
use crate::error::{ErrorContext, LinkError, LinkResult};
use crate::models::{AdHocQuery, Output, Param};
use crate::observe::{Dimensions, Observer, dimensions};
use serde_json::Value as JsonValue;
use std::panic::Location;
use std::sync::Arc;

/// Handle properties that resolve without compiling anything.
const BUILTINS: &[&str] = &["id"];

/// The backend strategy behind a link.
#[derive(Debug)]
pub enum Backend {
    Live(LiveBackend),
    Mock(MockBackend),
}

impl Backend {
    pub fn options(&self) -> &ConnectionOptions {
        match self {
            Backend::Live(b) => b.options(),
            Backend::Mock(b) => b.options(),
        }
    }

    pub fn compiler(&self) -> &Compiler {
        match self {
            Backend::Live(b) => b.compiler(),
            Backend::Mock(b) => b.compiler(),
        }
    }

    pub fn has_operation(&self, name: &str) -> bool {
        self.compiler().has_operation(name)
    }

    pub fn compile(&self, name: &str) -> LinkResult<Option<Arc<Operation>>> {
        self.compiler().compile(name)
    }

    /// Obtain a connection, run `work` with it, and release it.
    pub async fn acquire<T>(
        &self,
        observer: &dyn Observer,
        work: impl AsyncFnOnce(&Connection<'_>) -> LinkResult<T>,
    ) -> LinkResult<T> {
        match self {
            Backend::Live(b) => b.acquire(observer, work).await,
            Backend::Mock(b) => b.acquire(observer, work).await,
        }
    }

    /// Tear down the pool owned by this backend. Idempotent.
    pub async fn disconnect(&self) {
        if let Backend::Live(b) = self {
            b.disconnect().await;
        }
    }
}

enum Session<'a> {
    Live {
        backend: &'a LiveBackend,
        client: LiveClient,
    },
    Mock {
        backend: &'a MockBackend,
    },
}

/// One acquired connection, valid for the duration of a unit of work.
pub struct Connection<'a> {
    id: String,
    observer: &'a dyn Observer,
    session: Session<'a>,
}

/// A resolved invocation: the operation, its arguments and call context.
pub(crate) struct Call {
    pub op: Arc<Operation>,
    /// Arguments as passed by the caller.
    pub args: Vec<Param>,
    /// Arguments in storage form, as sent to the database.
    pub serialized: Vec<Param>,
    pub context: ErrorContext,
}

impl<'a> Connection<'a> {
    fn live(
        id: String,
        observer: &'a dyn Observer,
        backend: &'a LiveBackend,
        client: DbConnection,
    ) -> Self {
        Self {
            id,
            observer,
            session: Session::Live {
                backend,
                client: LiveClient::new(client),
            },
        }
    }

    fn mock(id: String, observer: &'a dyn Observer, backend: &'a MockBackend) -> Self {
        Self {
            id,
            observer,
            session: Session::Mock { backend },
        }
    }

    /// Correlation id of this connection, for logs only.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn observer(&self) -> &dyn Observer {
        self.observer
    }

    fn compiler(&self) -> &Compiler {
        match &self.session {
            Session::Live { backend, .. } => backend.compiler(),
            Session::Mock { backend } => backend.compiler(),
        }
    }

    /// Whether `name` resolves on this handle.
    ///
    /// True for built-in properties, which are read through their accessor
    /// (`id` through [`id`](Self::id)) and cannot be invoked, for `$` ad-hoc
    /// queries, and for operations backed by a SQL file. A SQL file is
    /// compiled on first reference, so a following [`invoke`](Self::invoke)
    /// finds it registered.
    pub fn has_operation(&self, name: &str) -> bool {
        BUILTINS.contains(&name) || name.starts_with('$') || self.compiler().has_operation(name)
    }

    /// Run the named operation with the given arguments.
    ///
    /// A name starting with `$` takes a single [`AdHocQuery`] descriptor
    /// instead of a SQL file. Name resolution and argument checks happen
    /// before the returned future first polls the connection.
    #[track_caller]
    pub fn invoke(
        &self,
        name: &str,
        args: Vec<Param>,
    ) -> impl Future<Output = LinkResult<Output>> {
        let call = self.prepare(name, args, Location::caller(), false);
        async move { self.execute(call?).await }
    }

    /// Run a `readstream`/`writestream` operation, handing its copy stream to
    /// `callback`. Resolves to the terminal row count.
    #[track_caller]
    pub fn invoke_with_stream<F>(
        &self,
        name: &str,
        args: Vec<Param>,
        callback: F,
    ) -> impl Future<Output = LinkResult<Output>>
    where
        F: AsyncFnOnce(&mut CopyStream<'_>) -> LinkResult<()>,
    {
        let call = self.prepare(name, args, Location::caller(), true);
        async move {
            let call = call?;
            match &self.session {
                Session::Live { backend, client } => {
                    backend.copy(self, client, call, callback).await
                }
                Session::Mock { backend } => backend.copy(self, call, callback).await,
            }
        }
    }

    /// Start a transaction, appending `modifiers` (e.g. `isolation level
    /// serializable`) to the `begin` statement.
    pub async fn begin(&self, modifiers: Option<&str>) -> LinkResult<()> {
        let sql = match modifiers.map(str::trim) {
            Some(m) if !m.is_empty() => format!("{} {m}", TxnStep::Begin.as_sql()),
            _ => TxnStep::Begin.as_sql().to_string(),
        };
        self.step(TxnStep::Begin, &sql).await
    }

    pub async fn commit(&self) -> LinkResult<()> {
        self.step(TxnStep::Commit, TxnStep::Commit.as_sql()).await
    }

    pub async fn rollback(&self) -> LinkResult<()> {
        self.step(TxnStep::Rollback, TxnStep::Rollback.as_sql()).await
    }

    async fn step(&self, step: TxnStep, sql: &str) -> LinkResult<()> {
        let context = ErrorContext::new(step.as_sql()).with_connection_id(&self.id);
        match &self.session {
            Session::Live { backend, client } => {
                backend.statement(self, client, step, sql, context).await
            }
            Session::Mock { backend } => backend.statement(self, sql).await,
        }
    }

    async fn execute(&self, call: Call) -> LinkResult<Output> {
        if let OperationKind::Transaction(step) = call.op.kind() {
            self.step(step, step.as_sql()).await?;
            return Ok(None);
        }
        match &self.session {
            Session::Live { backend, client } => backend.query(self, client, call).await,
            Session::Mock { backend } => backend.query(self, call).await,
        }
    }

    fn prepare(
        &self,
        name: &str,
        args: Vec<Param>,
        caller: &Location<'_>,
        streaming: bool,
    ) -> LinkResult<Call> {
        let (op, args) = if name.starts_with('$') {
            let query = adhoc_descriptor(name, &args)?;
            let op = self.compiler().compile_adhoc(name, &query)?;
            (Arc::new(op), query.args.into_iter().map(Param::from).collect())
        } else {
            let op = self
                .compiler()
                .compile(name)?
                .ok_or_else(|| LinkError::unknown_operation(name))?;
            (op, args)
        };

        let serialized: Vec<Param> = args.iter().map(Param::serialize).collect();
        let mut context = op.context(&serialized).with_connection_id(&self.id);
        context.callsite = Some(format!(
            "{}:{}:{}",
            caller.file(),
            caller.line(),
            caller.column()
        ));

        if op.is_stream() != streaming {
            let message = if streaming {
                format!("{name}() does not return a stream")
            } else {
                format!("{name}() requires a stream callback as its last argument")
            };
            return Err(LinkError::usage(message, context));
        }

        Ok(Call {
            op,
            args,
            serialized,
            context,
        })
    }
}

fn adhoc_descriptor(name: &str, args: &[Param]) -> LinkResult<AdHocQuery> {
    let usage = |detail: String| {
        LinkError::usage(
            format!("{name}() takes one {{sql, return?, args?}} descriptor: {detail}"),
            ErrorContext::new(name),
        )
    };
    match args {
        [Param::Json(value @ JsonValue::Object(_))] => {
            serde_json::from_value(value.clone()).map_err(|e| usage(e.to_string()))
        }
        _ => Err(usage(format!("got {} arguments", args.len()))),
    }
}

/// Short random id for log correlation.
pub(crate) async fn connection_id() -> String {
    let bytes: [u8; 3] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub(crate) fn host_dimensions(options: &ConnectionOptions) -> Dimensions {
    dimensions([("host", JsonValue::String(options.host.clone()))])
}
