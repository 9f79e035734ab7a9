//! Operation metadata declared by SQL sources.

use crate::error::{LinkError, LinkResult};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::LazyLock;

/// `--* key value` at the start of a line.
static PRAGMA: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?m)^--\*\s+(\w+)\s+(\w+)").expect("pragma pattern is valid")
});

/// The declared shape of an operation's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReturnKind {
    None,
    Value,
    Row,
    Column,
    Table,
    ReadStream,
    WriteStream,
}

impl ReturnKind {
    /// Whether the operation runs over the bulk copy protocol.
    pub fn is_stream(self) -> bool {
        matches!(self, Self::ReadStream | Self::WriteStream)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Value => "value",
            Self::Row => "row",
            Self::Column => "column",
            Self::Table => "table",
            Self::ReadStream => "readstream",
            Self::WriteStream => "writestream",
        }
    }
}

impl fmt::Display for ReturnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReturnKind {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "value" => Ok(Self::Value),
            "row" => Ok(Self::Row),
            "column" => Ok(Self::Column),
            "table" => Ok(Self::Table),
            "readstream" => Ok(Self::ReadStream),
            "writestream" => Ok(Self::WriteStream),
            other => Err(LinkError::configuration(format!(
                "unknown return kind '{other}'"
            ))),
        }
    }
}

/// Extract `--* key value` pragmas. Later duplicates overwrite earlier ones.
pub fn extract_pragmas(text: &str) -> BTreeMap<String, String> {
    PRAGMA
        .captures_iter(text)
        .map(|caps| (caps[1].to_string(), caps[2].to_string()))
        .collect()
}

/// Metadata for one compiled operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationMeta {
    /// Path of the SQL file; `None` for ad-hoc operations.
    pub source: Option<PathBuf>,
    /// Declared result shape; `None` returns the raw result.
    pub return_kind: Option<ReturnKind>,
    /// All declared pragmas, `return` included.
    pub pragmas: BTreeMap<String, String>,
}

impl OperationMeta {
    /// Build metadata from SQL text.
    ///
    /// Fails when the declared return kind is not recognized.
    pub fn from_source(source: Option<PathBuf>, text: &str) -> LinkResult<Self> {
        let pragmas = extract_pragmas(text);
        let return_kind = pragmas
            .get("return")
            .map(|kind| kind.parse::<ReturnKind>())
            .transpose()
            .map_err(|e| match &source {
                Some(path) => LinkError::configuration(format!("{e} in {}", path.display())),
                None => e,
            })?;
        Ok(Self {
            source,
            return_kind,
            pragmas,
        })
    }

    /// Metadata for an ad-hoc operation with an explicit return kind.
    pub fn adhoc(return_kind: Option<&str>) -> LinkResult<Self> {
        let mut pragmas = BTreeMap::new();
        let return_kind = match return_kind {
            Some(kind) => {
                pragmas.insert("return".to_string(), kind.to_string());
                Some(kind.parse::<ReturnKind>()?)
            }
            None => None,
        };
        Ok(Self {
            source: None,
            return_kind,
            pragmas,
        })
    }
}

/// Descriptor passed to a `$`-prefixed operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdHocQuery {
    pub sql: String,
    #[serde(default, rename = "return")]
    pub return_kind: Option<String>,
    #[serde(default)]
    pub args: Vec<JsonValue>,
}

impl AdHocQuery {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            return_kind: None,
            args: Vec::new(),
        }
    }

    pub fn returning(mut self, kind: ReturnKind) -> Self {
        self.return_kind = Some(kind.as_str().to_string());
        self
    }

    pub fn with_args(mut self, args: Vec<JsonValue>) -> Self {
        self.args = args;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_pragmas() {
        let text = "--* return row\n--* timeout 30\nselect 1 as x\n";
        let pragmas = extract_pragmas(text);
        assert_eq!(pragmas.get("return").map(String::as_str), Some("row"));
        assert_eq!(pragmas.get("timeout").map(String::as_str), Some("30"));
    }

    #[test]
    fn test_later_pragma_wins() {
        let pragmas = extract_pragmas("--* return row\n--* return table\n");
        assert_eq!(pragmas["return"], "table");
    }

    #[test]
    fn test_pragma_must_start_line() {
        let pragmas = extract_pragmas("select 1 --* return value\n-- * return row\n");
        assert!(pragmas.is_empty());
    }

    #[test]
    fn test_unknown_return_kind_is_configuration_error() {
        let err = OperationMeta::from_source(
            Some(PathBuf::from("/sql/badReturn.sql")),
            "--* return bogus\nselect 1",
        )
        .unwrap_err();
        assert!(matches!(err, LinkError::Configuration { .. }));
        assert!(err.to_string().contains("bogus"));
        assert!(err.to_string().contains("badReturn.sql"));
    }

    #[test]
    fn test_absent_return_kind() {
        let meta = OperationMeta::from_source(None, "select 1").unwrap();
        assert_eq!(meta.return_kind, None);
        assert!(meta.pragmas.is_empty());
    }

    #[test]
    fn test_stream_kinds() {
        assert!(ReturnKind::ReadStream.is_stream());
        assert!(ReturnKind::WriteStream.is_stream());
        assert!(!ReturnKind::Table.is_stream());
        assert_eq!("writestream".parse::<ReturnKind>().unwrap(), ReturnKind::WriteStream);
    }

    #[test]
    fn test_adhoc_descriptor_deserializes() {
        let query: AdHocQuery = serde_json::from_value(serde_json::json!({
            "sql": "select $1::int as x",
            "return": "value",
            "args": [7],
        }))
        .unwrap();
        assert_eq!(query.return_kind.as_deref(), Some("value"));
        let meta = OperationMeta::adhoc(query.return_kind.as_deref()).unwrap();
        assert_eq!(meta.return_kind, Some(ReturnKind::Value));
    }
}
