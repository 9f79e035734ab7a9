//! Data models for sql-link.
//!
//! This module re-exports all model types used throughout the crate.

pub mod operation;
pub mod params;
pub mod result;

// Re-export commonly used types
pub use operation::{AdHocQuery, OperationMeta, ReturnKind, extract_pragmas};
pub use params::{Param, ToSql, hex_escape};
pub use result::{Output, RawResult, Row};
