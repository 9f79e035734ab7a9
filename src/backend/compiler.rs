//! Method compiler.
//!
//! Turns `<directory>/<name>.sql` into an [`Operation`] the first time the
//! name is referenced and keeps it in a per-backend registry.

use crate::error::{ErrorContext, LinkError, LinkResult};
use crate::models::{AdHocQuery, OperationMeta, Param, ReturnKind};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Transaction control statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStep {
    Begin,
    Commit,
    Rollback,
}

impl TxnStep {
    pub fn as_sql(self) -> &'static str {
        match self {
            TxnStep::Begin => "begin",
            TxnStep::Commit => "commit",
            TxnStep::Rollback => "rollback",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// SQL text from a file or an ad-hoc descriptor.
    Query,
    Transaction(TxnStep),
}

/// A compiled operation. Immutable once built.
#[derive(Debug)]
pub struct Operation {
    name: String,
    meta: OperationMeta,
    sql: String,
    kind: OperationKind,
}

impl Operation {
    fn query(name: &str, meta: OperationMeta, sql: String) -> Self {
        Self {
            name: name.to_string(),
            meta,
            sql,
            kind: OperationKind::Query,
        }
    }

    fn transaction(step: TxnStep) -> Self {
        Self {
            name: step.as_sql().to_string(),
            meta: OperationMeta::default(),
            sql: step.as_sql().to_string(),
            kind: OperationKind::Transaction(step),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn meta(&self) -> &OperationMeta {
        &self.meta
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn return_kind(&self) -> Option<ReturnKind> {
        self.meta.return_kind
    }

    pub fn is_stream(&self) -> bool {
        self.meta.return_kind.is_some_and(ReturnKind::is_stream)
    }

    /// Error context for one call with the given serialized arguments.
    pub fn context(&self, arguments: &[Param]) -> ErrorContext {
        ErrorContext {
            operation: self.name.clone(),
            source: self.meta.source.clone(),
            arguments: arguments.iter().map(Param::to_json).collect(),
            metadata: self.meta.pragmas.clone(),
            ..ErrorContext::default()
        }
    }
}

/// Name → operation registry backed by a directory of SQL files.
#[derive(Debug)]
pub struct Compiler {
    directory: PathBuf,
    registry: Mutex<HashMap<String, Arc<Operation>>>,
}

impl Compiler {
    /// Create a compiler with the transaction primitives pre-registered.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        let registry = [TxnStep::Begin, TxnStep::Commit, TxnStep::Rollback]
            .into_iter()
            .map(|step| (step.as_sql().to_string(), Arc::new(Operation::transaction(step))))
            .collect();
        Self {
            directory: directory.into(),
            registry: Mutex::new(registry),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Whether `name` resolves to an operation, compiling it if needed.
    ///
    /// A source that fails to compile counts as absent here; invoking it
    /// reports the compile error.
    pub fn has_operation(&self, name: &str) -> bool {
        matches!(self.compile(name), Ok(Some(_)))
    }

    /// Resolve `name`, reading and compiling its SQL file on first use.
    ///
    /// Returns `Ok(None)` when no such file exists. The registry lock is
    /// held across the read, so concurrent first uses compile once.
    pub fn compile(&self, name: &str) -> LinkResult<Option<Arc<Operation>>> {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(op) = registry.get(name) {
            return Ok(Some(Arc::clone(op)));
        }
        if !is_plain_name(name) {
            return Ok(None);
        }

        let source = self.directory.join(format!("{name}.sql"));
        let text = match std::fs::read_to_string(&source) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(LinkError::configuration(format!(
                    "Cannot read {}: {e}",
                    source.display()
                )));
            }
        };

        let meta = OperationMeta::from_source(Some(source), &text)?;
        debug!(operation = name, return_kind = ?meta.return_kind, "Compiled operation");
        let op = Arc::new(Operation::query(name, meta, text));
        registry.insert(name.to_string(), Arc::clone(&op));
        Ok(Some(op))
    }

    /// Build an operation from an ad-hoc descriptor. Not registered.
    pub fn compile_adhoc(&self, name: &str, query: &AdHocQuery) -> LinkResult<Operation> {
        let meta = OperationMeta::adhoc(query.return_kind.as_deref())?;
        Ok(Operation::query(name, meta, query.sql.clone()))
    }
}

/// Operation names map to files directly inside the directory.
fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}
