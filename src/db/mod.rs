//! Database abstraction layer.
//!
//! This module provides the driver-facing side of the live backend:
//! - Database dispatch macros for reducing code duplication
//! - Connection pools keyed by connection options
//! - Retrying connection acquisition
//! - Parameter binding and statement execution
//! - Row decoding into JSON

#[macro_use]
pub mod macros;
pub mod executor;
pub mod params;
pub mod pool;
pub mod retry;
pub mod types;

pub use pool::{DbConnection, DbPool, PoolEntry, PoolManager, PoolStats};
pub use retry::retry_connect;
