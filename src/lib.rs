//! sql-link
//!
//! Turns a directory of `.sql` files into a query API. Each
//! `<name>.sql` file becomes an operation whose result shape is declared by
//! `--* return <kind>` pragmas. Operations run against a pooled PostgreSQL or
//! SQLite connection, or against in-memory mocks in tests.

pub mod backend;
pub mod config;
pub mod db;
pub mod error;
pub mod link;
pub mod models;
pub mod observe;
pub mod shape;
pub mod validate;

pub use backend::{Connection, CopyStream, Mock, Mocks};
pub use config::{Config, ConnectionOptions, Driver, RetryOptions};
pub use db::PoolManager;
pub use error::{ErrorContext, LinkError, LinkResult};
pub use link::Link;
pub use models::{AdHocQuery, Output, Param, ReturnKind, ToSql};
pub use observe::{MemoryObserver, Observer, TracingObserver};
