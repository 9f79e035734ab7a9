//! Error types for sql-link.
//!
//! Every failure that crosses the connect/query boundary carries an
//! [`ErrorContext`] describing the call that produced it, so a caller can
//! diagnose the problem without re-running the operation.

use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

/// Boxed error returned by mock stand-in functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Structured description of the call that failed.
///
/// Built incrementally: the compiler contributes the operation name, source
/// path and declared metadata, the dispatcher adds the serialized arguments
/// and call site, and the backend adds the connection id.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorContext {
    pub operation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    pub arguments: Vec<JsonValue>,
    /// Every pragma declared by the SQL source, `return` included.
    pub metadata: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callsite: Option<String>,
    #[serde(rename = "connection-id", skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
}

impl ErrorContext {
    /// Create a context for the named operation.
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Self::default()
        }
    }

    /// Attach the id of the connection the call ran on.
    pub fn with_connection_id(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    /// The declared `return` kind, if any.
    pub fn return_kind(&self) -> Option<&str> {
        self.metadata.get("return").map(String::as_str)
    }

    /// Flatten the context into a JSON object for log events.
    pub fn to_dimensions(&self) -> serde_json::Map<String, JsonValue> {
        let mut dims = serde_json::Map::new();
        dims.insert("query".into(), JsonValue::String(self.operation.clone()));
        if let Some(source) = &self.source {
            dims.insert(
                "source".into(),
                JsonValue::String(source.display().to_string()),
            );
        }
        dims.insert("arguments".into(), JsonValue::Array(self.arguments.clone()));
        for (key, value) in &self.metadata {
            dims.insert(key.clone(), JsonValue::String(value.clone()));
        }
        if let Some(callsite) = &self.callsite {
            dims.insert("callsite".into(), JsonValue::String(callsite.clone()));
        }
        if let Some(id) = &self.connection_id {
            dims.insert("connection-id".into(), JsonValue::String(id.clone()));
        }
        dims
    }
}

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("no operation named {name}")]
    UnknownOperation { name: String },

    #[error("{message}")]
    Usage {
        message: String,
        context: Box<ErrorContext>,
    },

    #[error("Failed to connect to database at {host} after {attempts} attempts")]
    ConnectFailed {
        host: String,
        attempts: u32,
        /// One message per failed attempt, in order.
        messages: Vec<String>,
        elapsed_ms: u64,
    },

    #[error("query failed: {message}")]
    QueryFailed {
        message: String,
        /// Driver diagnostics filtered to a stable allow-list.
        diagnostics: BTreeMap<String, JsonValue>,
        context: Box<ErrorContext>,
    },

    #[error("no mock for method {}", .context.operation)]
    MissingMock { context: Box<ErrorContext> },

    #[error("{message}")]
    MockShape {
        message: String,
        /// The value the stand-in produced; `None` for undefined.
        result: Option<JsonValue>,
        context: Box<ErrorContext>,
    },

    #[error("{message}")]
    MockThrew {
        message: String,
        #[source]
        cause: BoxError,
        context: Box<ErrorContext>,
    },

    #[error("rollback failed ({rollback}) after: {cause}")]
    RollbackFailed {
        #[source]
        cause: Box<LinkError>,
        rollback: Box<LinkError>,
    },

    #[error("Database error: {0}")]
    Driver(#[from] sqlx::Error),
}

impl LinkError {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an unknown-operation error.
    pub fn unknown_operation(name: impl Into<String>) -> Self {
        Self::UnknownOperation { name: name.into() }
    }

    /// Create a usage error for a malformed invocation.
    pub fn usage(message: impl Into<String>, context: ErrorContext) -> Self {
        Self::Usage {
            message: message.into(),
            context: Box::new(context),
        }
    }

    /// Create a query failure.
    pub fn query_failed(
        message: impl Into<String>,
        diagnostics: BTreeMap<String, JsonValue>,
        context: ErrorContext,
    ) -> Self {
        Self::QueryFailed {
            message: message.into(),
            diagnostics,
            context: Box::new(context),
        }
    }

    /// Call context attached to this error, if it has one.
    ///
    /// For a failed rollback this is the context of the original failure.
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::Usage { context, .. }
            | Self::QueryFailed { context, .. }
            | Self::MissingMock { context }
            | Self::MockShape { context, .. }
            | Self::MockThrew { context, .. } => Some(context),
            Self::RollbackFailed { cause, .. } => cause.context(),
            _ => None,
        }
    }

    /// Number of connection attempts made before giving up.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::ConnectFailed { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    /// Ordered per-attempt failure messages of a connect failure.
    pub fn messages(&self) -> &[String] {
        match self {
            Self::ConnectFailed { messages, .. } => messages,
            _ => &[],
        }
    }

    /// Driver diagnostics of a query failure.
    pub fn diagnostics(&self) -> Option<&BTreeMap<String, JsonValue>> {
        match self {
            Self::QueryFailed { diagnostics, .. } => Some(diagnostics),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    ///
    /// Only individual connection attempts are retried, and that happens
    /// inside acquisition; a surfaced `ConnectFailed` is final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Driver(sqlx::Error::PoolTimedOut | sqlx::Error::Io(_))
        )
    }
}

/// Result type alias for link operations.
pub type LinkResult<T> = Result<T, LinkError>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_context() -> ErrorContext {
        let mut context = ErrorContext::new("errorWithArguments");
        context.source = Some(PathBuf::from("/sql/errorWithArguments.sql"));
        context.arguments = vec![json!(42), json!(21), json!(96)];
        context.metadata.insert("return".into(), "row".into());
        context
    }

    #[test]
    fn test_error_display() {
        let err = LinkError::configuration("No query directory specified");
        assert!(err.to_string().contains("Configuration error"));
    }

    #[test]
    fn test_connect_failed_exposes_attempts() {
        let err = LinkError::ConnectFailed {
            host: "localhost".into(),
            attempts: 3,
            messages: vec!["a".into(), "b".into(), "c".into()],
            elapsed_ms: 12,
        };
        assert_eq!(err.attempts(), Some(3));
        assert_eq!(err.messages().len(), 3);
        assert!(err.to_string().contains("3 attempts"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_context_survives_rollback_failure() {
        let cause = LinkError::query_failed("boom", BTreeMap::new(), sample_context());
        let rollback = LinkError::query_failed(
            "connection reset",
            BTreeMap::new(),
            ErrorContext::new("rollback"),
        );
        let err = LinkError::RollbackFailed {
            cause: Box::new(cause),
            rollback: Box::new(rollback),
        };
        let context = err.context().unwrap();
        assert_eq!(context.operation, "errorWithArguments");
        assert_eq!(context.return_kind(), Some("row"));
    }

    #[test]
    fn test_missing_mock_message() {
        let err = LinkError::MissingMock {
            context: Box::new(ErrorContext::new("nurp")),
        };
        assert_eq!(err.to_string(), "no mock for method nurp");
    }

    #[test]
    fn test_context_dimensions() {
        let dims = sample_context()
            .with_connection_id("a1b2c3")
            .to_dimensions();
        assert_eq!(dims["query"], "errorWithArguments");
        assert_eq!(dims["return"], "row");
        assert_eq!(dims["arguments"], json!([42, 21, 96]));
        assert_eq!(dims["connection-id"], "a1b2c3");
    }
}
