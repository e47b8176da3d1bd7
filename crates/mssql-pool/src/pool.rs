//! Connection pool implementation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use mssql_client::{Client, Config as ClientConfig, Ready};
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::lifecycle::ConnectionMetadata;

/// A connection pool for SQL Server.
///
/// The pool manages a set of database connections, providing automatic
/// connection reuse, health checking, and lifecycle management.
pub struct Pool {
    client_config: ClientConfig,
    config: PoolConfig,
    inner: Arc<PoolInner>,
}

struct Idle {
    client: Client<Ready>,
    meta: ConnectionMetadata,
}

struct PoolInner {
    client_config: ClientConfig,
    config: PoolConfig,
    idle: Mutex<VecDeque<Idle>>,
    /// Bounds total outstanding connections (idle + checked out) at `max_connections`.
    permits: Semaphore,
    closed: Mutex<bool>,
    next_id: AtomicU64,
    total: AtomicU32,
}

impl Pool {
    /// Create a new pool, eagerly opening `min_connections` connections.
    pub async fn new(client_config: ClientConfig, config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;

        let inner = Arc::new(PoolInner {
            client_config: client_config.clone(),
            config: config.clone(),
            idle: Mutex::new(VecDeque::new()),
            permits: Semaphore::new(config.max_connections as usize),
            closed: Mutex::new(false),
            next_id: AtomicU64::new(1),
            total: AtomicU32::new(0),
        });

        for _ in 0..config.min_connections {
            let permit = inner
                .permits
                .acquire()
                .await
                .map_err(|_| PoolError::PoolClosed)?;
            permit.forget();
            let conn = inner.open_connection().await?;
            inner.idle.lock().push_back(conn);
        }

        Ok(Self {
            client_config,
            config,
            inner,
        })
    }

    /// Get a connection from the pool.
    ///
    /// This will either return an existing idle connection or create a new one
    /// if the pool is not at capacity. If all connections are in use and the
    /// pool is at capacity, this will wait until a connection becomes available
    /// or the timeout is reached.
    pub async fn get(&self) -> Result<PooledConnection, PoolError> {
        if *self.inner.closed.lock() {
            return Err(PoolError::PoolClosed);
        }

        tracing::trace!("acquiring connection from pool");

        let deadline = tokio::time::Instant::now() + self.config.connection_timeout;
        let outcome = tokio::time::timeout_at(deadline, self.inner.acquire()).await;

        let conn = match outcome {
            Ok(result) => result?,
            Err(_) => return Err(PoolError::AcquisitionTimeout(self.config.connection_timeout)),
        };

        Ok(PooledConnection {
            client: Some(conn.client),
            meta: conn.meta,
            pool: Arc::clone(&self.inner),
        })
    }

    /// Get the current pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let total = self.inner.total.load(Ordering::SeqCst);
        let available = self.inner.idle.lock().len() as u32;
        PoolStatus {
            available,
            in_use: total.saturating_sub(available),
            total,
            max: self.config.max_connections,
        }
    }

    /// Close the pool, dropping all connections.
    pub async fn close(&self) {
        *self.inner.closed.lock() = true;
        self.inner.idle.lock().clear();
        self.inner.permits.close();
        tracing::info!("connection pool closed");
    }

    /// Check if the pool is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.inner.closed.lock()
    }

    /// Get the pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get the connection configuration used to open new connections.
    #[must_use]
    pub fn client_config(&self) -> &ClientConfig {
        &self.client_config
    }
}

impl PoolInner {
    async fn open_connection(&self) -> Result<Idle, PoolError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let client = Client::connect(self.client_config.clone())
            .await
            .map_err(|e| PoolError::ConnectionCreation(e.to_string()))?;
        self.total.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(connection_id = id, "opened new pooled connection");
        Ok(Idle {
            client,
            meta: ConnectionMetadata::new(id),
        })
    }

    async fn acquire(&self) -> Result<Idle, PoolError> {
        loop {
            if *self.closed.lock() {
                return Err(PoolError::PoolClosed);
            }

            if let Some(mut conn) = self.idle.lock().pop_front() {
                if self.config.test_on_checkout {
                    match conn.client.execute(&self.config.health_check_query, &[]).await {
                        Ok(_) => {
                            conn.meta.mark_health_check();
                        }
                        Err(e) => {
                            tracing::debug!(
                                connection_id = conn.meta.id,
                                error = %e,
                                "discarding unhealthy pooled connection"
                            );
                            self.total.fetch_sub(1, Ordering::SeqCst);
                            // The discarded connection's slot is free again; a fresh
                            // one is opened (and a permit re-acquired) on retry.
                            self.permits.add_permits(1);
                            continue;
                        }
                    }
                }
                conn.meta.mark_checkout();
                return Ok(conn);
            }

            // No idle connection. Acquire a slot and open a new one.
            let permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| PoolError::PoolClosed)?;
            permit.forget();
            match self.open_connection().await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    self.permits.add_permits(1);
                    return Err(e);
                }
            }
        }
    }

    async fn reclaim(&self, mut client: Client<Ready>, mut meta: ConnectionMetadata) {
        if *self.closed.lock() {
            self.total.fetch_sub(1, Ordering::SeqCst);
            self.permits.add_permits(1);
            return;
        }

        if meta.is_expired(self.config.max_lifetime) {
            tracing::trace!(connection_id = meta.id, "retiring connection past max lifetime");
            self.total.fetch_sub(1, Ordering::SeqCst);
            self.permits.add_permits(1);
            return;
        }

        if self.config.sp_reset_connection {
            if let Err(e) = client.execute("sp_reset_connection", &[]).await {
                tracing::debug!(connection_id = meta.id, error = %e, "sp_reset_connection failed, dropping connection");
                self.total.fetch_sub(1, Ordering::SeqCst);
                self.permits.add_permits(1);
                return;
            }
        }

        if self.config.test_on_checkin {
            if let Err(e) = client.execute(&self.config.health_check_query, &[]).await {
                tracing::debug!(connection_id = meta.id, error = %e, "checkin health check failed, dropping connection");
                self.total.fetch_sub(1, Ordering::SeqCst);
                self.permits.add_permits(1);
                return;
            }
        }

        meta.mark_checkin();
        self.idle.lock().push_back(Idle { client, meta });
        self.permits.add_permits(1);
    }
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolStatus {
    /// Number of idle connections available.
    pub available: u32,
    /// Number of connections currently in use.
    pub in_use: u32,
    /// Total number of connections.
    pub total: u32,
    /// Maximum allowed connections.
    pub max: u32,
}

/// A connection retrieved from the pool.
///
/// When dropped, the connection is automatically returned to the pool.
pub struct PooledConnection {
    client: Option<Client<Ready>>,
    meta: ConnectionMetadata,
    pool: Arc<PoolInner>,
}

impl PooledConnection {
    /// Detach the connection from the pool.
    ///
    /// The connection will not be returned to the pool when dropped.
    #[must_use]
    pub fn detach(mut self) -> Client<Ready> {
        self.pool.total.fetch_sub(1, Ordering::SeqCst);
        self.pool.permits.add_permits(1);
        self.client.take().expect("client present until drop")
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = Client<Ready>;

    fn deref(&self) -> &Self::Target {
        self.client.as_ref().expect("client present until drop")
    }
}

impl std::ops::DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.client.as_mut().expect("client present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        tracing::trace!(connection_id = self.meta.id, "returning connection to pool");
        if let Some(client) = self.client.take() {
            let pool = Arc::clone(&self.pool);
            let meta = self.meta.clone();
            tokio::spawn(async move {
                pool.reclaim(client, meta).await;
            });
        }
    }
}
