//! Public entry point.
//!
//! A [`Link`] pairs a directory of `.sql` files with a backend. Work runs
//! inside [`Link::connect`] (one connection) or [`Link::txn`] (one
//! connection inside a transaction).

use crate::backend::{Backend, Connection, LiveBackend, MockBackend, Mocks};
use crate::config::ConnectionOptions;
use crate::db::PoolManager;
use crate::error::{LinkError, LinkResult};
use crate::observe::{Observer, TracingObserver};
use futures_util::future::try_join_all;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct Link {
    backend: Backend,
    observer: Arc<dyn Observer>,
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link").field("backend", &self.backend).finish()
    }
}

impl Link {
    /// Create a live link with its own pool registry.
    pub fn new(options: ConnectionOptions, directory: impl AsRef<Path>) -> LinkResult<Self> {
        Self::with_pools(options, directory, Arc::new(PoolManager::new()))
    }

    /// Create a live link drawing pools from `pools`. Links with identical
    /// options on one manager share a pool.
    pub fn with_pools(
        options: ConnectionOptions,
        directory: impl AsRef<Path>,
        pools: Arc<PoolManager>,
    ) -> LinkResult<Self> {
        options.validate().map_err(LinkError::configuration)?;
        let directory = check_directory(directory.as_ref())?;
        Ok(Self::from_backend(Backend::Live(LiveBackend::new(
            options, directory, pools,
        ))))
    }

    /// Create a live link from a connection string.
    pub fn from_url(url: &str, directory: impl AsRef<Path>) -> LinkResult<Self> {
        Self::new(ConnectionOptions::parse(url)?, directory)
    }

    /// Create a link whose operations resolve from `mocks`.
    pub fn mock(
        options: ConnectionOptions,
        directory: impl AsRef<Path>,
        mocks: Mocks,
    ) -> LinkResult<Self> {
        let directory = check_directory(directory.as_ref())?;
        Ok(Self::from_backend(Backend::Mock(MockBackend::new(
            options, directory, mocks,
        ))))
    }

    fn from_backend(backend: Backend) -> Self {
        Self {
            backend,
            observer: Arc::new(TracingObserver),
        }
    }

    /// Report events to `observer` instead of `tracing`.
    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn options(&self) -> &ConnectionOptions {
        self.backend.options()
    }

    /// Canonical path of the SQL directory.
    pub fn directory(&self) -> &Path {
        self.backend.compiler().directory()
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Pool registry of a live link.
    pub fn pools(&self) -> Option<&Arc<PoolManager>> {
        match &self.backend {
            Backend::Live(live) => Some(live.pools()),
            Backend::Mock(_) => None,
        }
    }

    pub fn has_operation(&self, name: &str) -> bool {
        self.backend.has_operation(name)
    }

    /// Run `work` with one connection, released when it returns.
    pub async fn connect<T>(
        &self,
        work: impl AsyncFnOnce(&Connection<'_>) -> LinkResult<T>,
    ) -> LinkResult<T> {
        self.backend.acquire(self.observer.as_ref(), work).await
    }

    /// Run every unit of work concurrently, each on its own connection.
    ///
    /// Fails with the first error; results keep the input order.
    pub async fn all<T, F>(&self, works: impl IntoIterator<Item = F>) -> LinkResult<Vec<T>>
    where
        F: AsyncFnOnce(&Connection<'_>) -> LinkResult<T>,
    {
        try_join_all(works.into_iter().map(|work| self.connect(work))).await
    }

    /// Run `work` inside a transaction.
    ///
    /// Commits when `work` succeeds. When `work` or the commit fails, rolls
    /// back and returns that error; a failing rollback is reported as
    /// [`LinkError::RollbackFailed`] carrying both errors. A `txn` started
    /// from inside `work` uses its own connection and transaction.
    pub async fn txn<T>(
        &self,
        work: impl AsyncFnOnce(&Connection<'_>) -> LinkResult<T>,
    ) -> LinkResult<T> {
        self.txn_with(None, work).await
    }

    /// Like [`txn`](Self::txn), appending `modifiers` (e.g. `isolation
    /// level serializable, read only`) to `begin`.
    pub async fn txn_with<T>(
        &self,
        modifiers: Option<&str>,
        work: impl AsyncFnOnce(&Connection<'_>) -> LinkResult<T>,
    ) -> LinkResult<T> {
        self.connect(async move |conn: &Connection<'_>| {
            conn.begin(modifiers).await?;
            let err = match work(conn).await {
                Ok(value) => match conn.commit().await {
                    Ok(()) => return Ok(value),
                    // SQLite keeps the transaction open after a failed commit.
                    Err(err) => err,
                },
                Err(err) => err,
            };
            Err(rollback_after(conn, err).await)
        })
        .await
    }

    /// Tear down this link's pool. Waits for the pool to close; a second
    /// call is a no-op.
    pub async fn disconnect(&self) {
        self.backend.disconnect().await;
    }
}

/// Roll back after `cause`, keeping `cause` as the reported error.
async fn rollback_after(conn: &Connection<'_>, cause: LinkError) -> LinkError {
    match conn.rollback().await {
        Ok(()) => cause,
        Err(rollback) => LinkError::RollbackFailed {
            cause: Box::new(cause),
            rollback: Box::new(rollback),
        },
    }
}

/// Resolve the SQL directory and check that it can be listed.
fn check_directory(directory: &Path) -> LinkResult<PathBuf> {
    let resolved = directory.canonicalize().map_err(|e| {
        LinkError::configuration(format!(
            "SQL directory {} not found: {e}",
            directory.display()
        ))
    })?;
    std::fs::read_dir(&resolved).map_err(|e| {
        LinkError::configuration(format!(
            "SQL directory {} is not readable: {e}",
            resolved.display()
        ))
    })?;
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_directory_is_configuration_error() {
        let err = Link::new(
            ConnectionOptions::postgres("localhost"),
            "/definitely/not/a/directory",
        )
        .unwrap_err();
        assert!(matches!(err, LinkError::Configuration { .. }));
    }

    #[test]
    fn test_file_is_not_a_directory() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("plain.sql");
        std::fs::write(&file, "select 1").unwrap();
        let err = Link::mock(ConnectionOptions::postgres("localhost"), &file, Mocks::new())
            .unwrap_err();
        assert!(matches!(err, LinkError::Configuration { .. }));
    }

    #[test]
    fn test_directory_is_canonical() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("sql");
        std::fs::create_dir(&nested).unwrap();
        let link = Link::mock(
            ConnectionOptions::postgres("localhost"),
            nested.join("..").join("sql"),
            Mocks::new(),
        )
        .unwrap();
        assert_eq!(link.directory(), nested.canonicalize().unwrap());
        assert!(link.pools().is_none());
    }

    #[test]
    fn test_invalid_retry_options_rejected() {
        let dir = TempDir::new().unwrap();
        let mut options = ConnectionOptions::postgres("localhost");
        options.retry.factor = 0.5;
        let err = Link::new(options, dir.path()).unwrap_err();
        assert!(matches!(err, LinkError::Configuration { .. }));
    }
}
