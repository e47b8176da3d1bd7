//! Bridge error types.

use thiserror::Error;

/// Errors raised while pushing a query or DML operation down to SQL Server.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The underlying client/connection call failed.
    #[error(transparent)]
    Client(#[from] mssql_client::Error),

    /// A pool acquisition failed.
    #[error(transparent)]
    Pool(#[from] mssql_driver_pool::PoolError),

    /// A catalog lookup failed.
    #[error(transparent)]
    Catalog(#[from] mssql_catalog::CatalogError),

    /// A value could not be serialized to a T-SQL literal (e.g. NaN/Infinity).
    #[error("cannot serialize value to a SQL literal: {0}")]
    UnrepresentableLiteral(String),

    /// A feature requested by the host is not implemented by this bridge.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    /// Invalid configuration (e.g. batch size of zero).
    #[error("bad configuration: {0}")]
    BadConfiguration(String),
}
