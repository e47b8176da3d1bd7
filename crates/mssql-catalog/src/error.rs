//! Catalog error types.

use thiserror::Error;

/// Errors raised while loading or querying catalog metadata.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The underlying connection failed to execute a discovery query.
    #[error("catalog discovery query failed: {0}")]
    Query(#[from] mssql_client::Error),

    /// A schema was referenced that has never been discovered.
    #[error("unknown schema: {0}")]
    UnknownSchema(String),

    /// A table was referenced that has never been discovered.
    #[error("unknown table: {0}.{1}")]
    UnknownTable(String, String),

    /// `rowid` was requested against a view, which has no primary key.
    #[error("{0}.{1} is a view and has no rowid")]
    NotATable(String, String),

    /// `rowid` was requested against a table with no primary key.
    #[error("{0}.{1} has no primary key")]
    NoPrimaryKey(String, String),

    /// A column value from a discovery query was missing or of the wrong type.
    #[error("malformed catalog row: {0}")]
    MalformedRow(String),
}
