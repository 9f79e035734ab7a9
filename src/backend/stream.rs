//! Bulk-copy streams handed to `readstream`/`writestream` callbacks.

use crate::db::executor::query_failed;
use crate::error::{ErrorContext, LinkError, LinkResult};
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use sqlx::postgres::{PgConnection, PgCopyIn};

/// A byte stream over one `COPY` invocation.
///
/// Writable for `COPY ... FROM STDIN`, readable for `COPY ... TO STDOUT`.
pub struct CopyStream<'c> {
    inner: Inner<'c>,
    context: ErrorContext,
}

enum Inner<'c> {
    In(Option<PgCopyIn<&'c mut PgConnection>>),
    Out {
        chunks: BoxStream<'c, Result<Bytes, sqlx::Error>>,
        rows: u64,
    },
    /// Mock streams accept writes and yield nothing.
    Memory { written: u64 },
}

impl<'c> CopyStream<'c> {
    pub(crate) fn copy_in(copy: PgCopyIn<&'c mut PgConnection>, context: ErrorContext) -> Self {
        Self {
            inner: Inner::In(Some(copy)),
            context,
        }
    }

    pub(crate) fn copy_out(
        chunks: BoxStream<'c, Result<Bytes, sqlx::Error>>,
        context: ErrorContext,
    ) -> Self {
        Self {
            inner: Inner::Out { chunks, rows: 0 },
            context,
        }
    }

    pub(crate) fn memory(context: ErrorContext) -> Self {
        Self {
            inner: Inner::Memory { written: 0 },
            context,
        }
    }

    /// Send one chunk of copy data.
    pub async fn write(&mut self, chunk: impl AsRef<[u8]>) -> LinkResult<()> {
        match &mut self.inner {
            Inner::In(Some(copy)) => {
                if let Err(e) = copy.send(chunk.as_ref()).await {
                    return Err(query_failed(e, self.context.clone()));
                }
                Ok(())
            }
            Inner::Memory { written } => {
                *written += 1;
                Ok(())
            }
            Inner::In(None) | Inner::Out { .. } => Err(LinkError::usage(
                format!("{}() stream is not writable", self.context.operation),
                self.context.clone(),
            )),
        }
    }

    /// Receive the next chunk of copy data, `None` at the end.
    pub async fn read(&mut self) -> LinkResult<Option<Bytes>> {
        match &mut self.inner {
            Inner::Out { chunks, rows } => match chunks.next().await {
                Some(Ok(chunk)) => {
                    *rows += 1;
                    Ok(Some(chunk))
                }
                Some(Err(e)) => Err(query_failed(e, self.context.clone())),
                None => Ok(None),
            },
            Inner::Memory { .. } => Ok(None),
            Inner::In(_) => Err(LinkError::usage(
                format!("{}() stream is not readable", self.context.operation),
                self.context.clone(),
            )),
        }
    }

    /// Complete the copy and return its terminal row count.
    ///
    /// Unread output is drained first. When `ok` is false a pending copy-in
    /// is aborted and nothing is committed.
    pub(crate) async fn finish(mut self, ok: bool) -> LinkResult<u64> {
        let context = self.context;
        match &mut self.inner {
            Inner::In(copy) => {
                let Some(copy) = copy.take() else {
                    return Ok(0);
                };
                if ok {
                    copy.finish().await.map_err(|e| query_failed(e, context))
                } else {
                    copy.abort("copy callback failed")
                        .await
                        .map_err(|e| query_failed(e, context))?;
                    Ok(0)
                }
            }
            Inner::Out { chunks, rows } => {
                while let Some(chunk) = chunks.next().await {
                    chunk.map_err(|e| query_failed(e, context.clone()))?;
                    *rows += 1;
                }
                Ok(*rows)
            }
            Inner::Memory { written } => Ok(*written),
        }
    }
}
