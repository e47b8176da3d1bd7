//! Thin entry points the host uses to drive a connection pool: open/close,
//! health ping, pool statistics, one-shot execution, scan startup, and
//! catalog preload/refresh.

use mssql_catalog::Catalog;
use mssql_client::Config as ClientConfig;
use mssql_driver_pool::{Pool, PoolConfig, PoolStatus};

use crate::error::BridgeError;
use crate::scan::Scan;
use crate::select::SelectPlan;

/// Bundles a connection pool with the catalog cache that sits in front of it.
///
/// This is the handle the host holds for the lifetime of a single
/// configured connection to a server: every `open`/`exec`/`scan` call in
/// this module takes a `&Bridge` rather than threading a pool and a catalog
/// through separately.
pub struct Bridge {
    pool: Pool,
    catalog: Catalog,
}

impl Bridge {
    /// Open a pool against `client_config` and attach a fresh catalog cache.
    pub async fn open(client_config: ClientConfig, pool_config: PoolConfig, catalog: Catalog) -> Result<Self, BridgeError> {
        let pool = Pool::new(client_config, pool_config).await?;
        Ok(Self { pool, catalog })
    }

    /// Close the underlying pool, dropping all idle connections.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Verify connectivity by checking out and returning a connection.
    ///
    /// Succeeds as soon as the pool hands back a connection that passed its
    /// checkout health check (if configured); does not issue an extra query.
    pub async fn ping(&self) -> Result<(), BridgeError> {
        let _conn = self.pool.get().await?;
        Ok(())
    }

    /// Current pool occupancy and capacity.
    #[must_use]
    pub fn pool_stats(&self) -> PoolStatus {
        self.pool.status()
    }

    /// The catalog cache backing this bridge.
    #[must_use]
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Run a statement with no result set (DDL, or DML outside the batched
    /// insert/update/delete helpers), returning the affected row count.
    pub async fn exec(&self, sql: &str) -> Result<u64, BridgeError> {
        let mut conn = self.pool.get().await?;
        let result = conn.execute(sql, &[]).await?;
        Ok(result.rows_affected)
    }

    /// Start a cancellable scan for a previously generated [`SelectPlan`].
    ///
    /// Checks out a connection for the scan's lifetime; the connection
    /// returns to the pool when the returned [`Scan`] is dropped.
    pub async fn scan(&self, plan: SelectPlan) -> Result<Scan, BridgeError> {
        let conn = self.pool.get().await?;
        Ok(Scan::new(conn, plan))
    }

    /// Force-load every catalog tier up front via a single bulk query,
    /// rather than lazily on first access.
    pub async fn preload_catalog(&self) -> Result<(), BridgeError> {
        let mut conn = self.pool.get().await?;
        self.catalog.bulk_load_all(&mut *conn).await?;
        Ok(())
    }

    /// Drop all cached catalog state, forcing the next access of any tier to
    /// reissue its discovery query.
    pub fn refresh_cache(&self) {
        self.catalog.invalidate_all();
    }

    /// Drop cached state for a single schema (its table list and every
    /// table's columns), without disturbing the rest of the cache.
    pub fn refresh_schema(&self, schema: &str) {
        self.catalog.invalidate_schema(schema);
    }

    /// Drop cached column/primary-key state for a single table.
    pub fn refresh_table(&self, schema: &str, table: &str) {
        self.catalog.invalidate_table(schema, table);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn bridge_is_send_sync() {
        assert_send_sync::<Bridge>();
    }
}
