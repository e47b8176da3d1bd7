//! Streaming scan execution: runs a generated [`crate::select::SelectPlan`]
//! against a pooled connection and yields rows as they arrive, honoring
//! out-of-band cancellation via an Attention packet.

use futures_core::Stream;
use mssql_client::cancel::CancelHandle;
use mssql_client::Row;
use mssql_driver_pool::PooledConnection;

use crate::error::BridgeError;
use crate::select::SelectPlan;

/// A live, cancellable scan over a single generated `SELECT`.
///
/// Holds the pooled connection for the scan's lifetime; dropping the scan
/// (or letting it run to completion) returns the connection to the pool.
pub struct Scan {
    conn: PooledConnection,
    plan: SelectPlan,
    cancel: Option<CancelHandle>,
    started: bool,
}

impl Scan {
    /// Build a scan from a pooled connection and a generated plan. The
    /// underlying query does not run until [`Scan::rows`] is first polled.
    #[must_use]
    pub fn new(conn: PooledConnection, plan: SelectPlan) -> Self {
        Self {
            conn,
            plan,
            cancel: None,
            started: false,
        }
    }

    /// The select plan this scan executes.
    #[must_use]
    pub fn plan(&self) -> &SelectPlan {
        &self.plan
    }

    /// A handle the host can use to cancel this scan from another task.
    ///
    /// Only meaningful after the scan has started; returns `None` beforehand.
    #[must_use]
    pub fn cancel_handle(&self) -> Option<CancelHandle> {
        self.cancel.clone()
    }

    /// Drive the scan to completion, collecting every row.
    ///
    /// Intended for small result sets (e.g. catalog-backed metadata queries);
    /// large scans should use [`Scan::rows`] instead to stream incrementally.
    pub async fn collect_all(mut self) -> Result<Vec<Row>, BridgeError> {
        self.cancel = Some(self.conn.cancel_handle());
        let stream = self.conn.query(&self.plan.sql, &[]).await?;
        Ok(stream.collect_all().await?)
    }

    /// Begin streaming the scan, returning a `Stream` of decoded rows.
    ///
    /// The returned stream borrows the connection for its lifetime; dropping
    /// it before exhaustion leaves the connection mid-result-set, so the pool
    /// will discard it on next checkout's health check rather than reuse it
    /// blindly.
    pub async fn rows(&mut self) -> Result<impl Stream<Item = Result<Row, BridgeError>> + '_, BridgeError> {
        self.cancel = Some(self.conn.cancel_handle());
        self.started = true;
        let stream = self.conn.query(&self.plan.sql, &[]).await?;
        Ok(RowStream { inner: stream })
    }

    /// Cancel the in-flight scan by sending an Attention packet, then drain
    /// until the server acknowledges with `DONE_ATTN`.
    ///
    /// No-op if the scan hasn't started yet.
    pub async fn cancel(&self) -> Result<(), BridgeError> {
        if let Some(handle) = &self.cancel {
            handle.cancel().await?;
            handle.wait_cancelled().await;
        }
        Ok(())
    }
}

/// Adapts [`mssql_client::stream::QueryStream`]'s error type to [`BridgeError`].
struct RowStream<'a> {
    inner: mssql_client::stream::QueryStream<'a>,
}

impl<'a> Stream for RowStream<'a> {
    type Item = Result<Row, BridgeError>;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let inner = std::pin::Pin::new(&mut this.inner);
        match inner.poll_next(cx) {
            std::task::Poll::Ready(Some(Ok(row))) => std::task::Poll::Ready(Some(Ok(row))),
            std::task::Poll::Ready(Some(Err(e))) => std::task::Poll::Ready(Some(Err(e.into()))),
            std::task::Poll::Ready(None) => std::task::Poll::Ready(None),
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }
}
