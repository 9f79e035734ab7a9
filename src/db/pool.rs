//! Connection pool management.
//!
//! Pools are keyed by a hash of the normalized connection options, so every
//! backend built from identical options shares one pool. Pools are created
//! lazily: no connection is opened until the first acquisition.

use crate::config::{ConnectionOptions, Driver};
use crate::error::{LinkError, LinkResult};
use serde::Serialize;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{PgPool, Postgres, Sqlite, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Database-specific connection pool (avoids AnyPool limitations).
#[derive(Debug, Clone)]
pub enum DbPool {
    Postgres(PgPool),
    SQLite(SqlitePool),
}

impl DbPool {
    /// Create a lazy pool for the given options.
    pub fn create(options: &ConnectionOptions) -> LinkResult<Self> {
        let acquire_timeout = options.connection_timeout();
        match options.driver {
            Driver::Postgres => {
                let mut connect = PgConnectOptions::new().host(&options.host);
                if let Some(port) = options.port {
                    connect = connect.port(port);
                }
                if let Some(user) = &options.user {
                    connect = connect.username(user);
                }
                if let Some(password) = &options.password {
                    connect = connect.password(password);
                }
                if let Some(database) = &options.database {
                    connect = connect.database(database);
                }
                let pool = PgPoolOptions::new()
                    .max_connections(options.max_connections)
                    .acquire_timeout(acquire_timeout)
                    .connect_lazy_with(connect);
                Ok(DbPool::Postgres(pool))
            }
            Driver::Sqlite => {
                let filename = options.filename.as_deref().unwrap_or(":memory:");
                let connect = if filename == ":memory:" {
                    SqliteConnectOptions::from_str("sqlite::memory:").map_err(|e| {
                        LinkError::configuration(format!("Invalid SQLite options: {e}"))
                    })?
                } else {
                    SqliteConnectOptions::new()
                        .filename(filename)
                        .create_if_missing(true)
                };
                let pool = SqlitePoolOptions::new()
                    .max_connections(options.max_connections)
                    .acquire_timeout(acquire_timeout)
                    .connect_lazy_with(connect);
                Ok(DbPool::SQLite(pool))
            }
        }
    }

    /// Check out one connection.
    pub async fn acquire(&self) -> Result<DbConnection, sqlx::Error> {
        impl_db_dispatch!(DbPool, self, {
            Postgres(p) => p.acquire().await.map(DbConnection::Postgres),
            SQLite(p) => p.acquire().await.map(DbConnection::SQLite),
        })
    }

    /// Close the connection pool, waiting for checked-out connections.
    pub async fn close(&self) {
        impl_db_dispatch!(DbPool, self, {
            Postgres(p) => p.close().await,
            SQLite(p) => p.close().await,
        })
    }

    /// Connections currently open, idle or in use.
    pub fn size(&self) -> u32 {
        impl_db_dispatch!(DbPool, self, {
            Postgres(p) => p.size(),
            SQLite(p) => p.size(),
        })
    }

    pub fn num_idle(&self) -> usize {
        impl_db_dispatch!(DbPool, self, {
            Postgres(p) => p.num_idle(),
            SQLite(p) => p.num_idle(),
        })
    }

    pub fn driver(&self) -> Driver {
        match self {
            DbPool::Postgres(_) => Driver::Postgres,
            DbPool::SQLite(_) => Driver::Sqlite,
        }
    }
}

/// A connection checked out of a [`DbPool`]. Returned to the pool on drop.
#[derive(Debug)]
pub enum DbConnection {
    Postgres(PoolConnection<Postgres>),
    SQLite(PoolConnection<Sqlite>),
}

impl DbConnection {
    /// Close the connection on drop instead of returning it to the pool.
    pub fn close_on_drop(&mut self) {
        impl_db_dispatch!(DbConnection, self, {
            Postgres(c) => c.close_on_drop(),
            SQLite(c) => c.close_on_drop(),
        })
    }
}

/// Pool occupancy counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Open connections, idle or in use.
    pub clients: u32,
    pub idle: usize,
    /// Acquisitions currently waiting for a connection.
    pub waiting: usize,
}

/// One registered pool and its waiter count.
#[derive(Debug)]
pub struct PoolEntry {
    pool: DbPool,
    waiting: AtomicUsize,
}

impl PoolEntry {
    fn new(pool: DbPool) -> Self {
        Self {
            pool,
            waiting: AtomicUsize::new(0),
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Check out one connection, counted as waiting until it arrives.
    pub async fn acquire(&self) -> Result<DbConnection, sqlx::Error> {
        let _waiting = WaitGuard::new(&self.waiting);
        self.pool.acquire().await
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            clients: self.pool.size(),
            idle: self.pool.num_idle(),
            waiting: self.waiting.load(Ordering::Relaxed),
        }
    }
}

/// Decrements the waiter count on every exit path.
struct WaitGuard<'a>(&'a AtomicUsize);

impl<'a> WaitGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Registry of pools keyed by [`ConnectionOptions::pool_key`].
#[derive(Debug, Default)]
pub struct PoolManager {
    pools: RwLock<HashMap<String, Arc<PoolEntry>>>,
}

impl PoolManager {
    /// Create an empty pool manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the pool for these options, creating it on first use.
    pub async fn get_or_create(&self, options: &ConnectionOptions) -> LinkResult<Arc<PoolEntry>> {
        let key = options.pool_key();

        // Fast path: read lock
        {
            let pools = self.pools.read().await;
            if let Some(entry) = pools.get(&key) {
                return Ok(Arc::clone(entry));
            }
        }

        // Double-check under the write lock; pool creation does no I/O
        let mut pools = self.pools.write().await;
        if let Some(entry) = pools.get(&key) {
            return Ok(Arc::clone(entry));
        }
        let entry = Arc::new(PoolEntry::new(DbPool::create(options)?));
        info!(driver = %options.driver, host = %options.host, "Created connection pool");
        pools.insert(key, Arc::clone(&entry));
        Ok(entry)
    }

    /// Occupancy of the pool for these options, if it exists.
    pub async fn stats(&self, options: &ConnectionOptions) -> Option<PoolStats> {
        let pools = self.pools.read().await;
        pools.get(&options.pool_key()).map(|entry| entry.stats())
    }

    /// Get the number of registered pools.
    pub async fn pool_count(&self) -> usize {
        let pools = self.pools.read().await;
        pools.len()
    }

    /// Remove and close the pool for these options.
    ///
    /// Returns false when no such pool is registered; a second disconnect is
    /// a no-op.
    pub async fn disconnect(&self, options: &ConnectionOptions) -> bool {
        let entry = {
            let mut pools = self.pools.write().await;
            pools.remove(&options.pool_key())
        }; // Lock released here

        match entry {
            Some(entry) => {
                entry.pool.close().await;
                debug!(host = %options.host, "Closed connection pool");
                true
            }
            None => false,
        }
    }

    /// Close all pools and clear the registry.
    pub async fn close_all(&self) {
        let entries: Vec<Arc<PoolEntry>> = {
            let mut pools = self.pools.write().await;
            pools.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &entries {
            entry.pool.close().await;
        }
        info!(count = entries.len(), "All connection pools closed");
    }
}
