//! # mssql-catalog
//!
//! Lazily-loaded, invalidatable cache of SQL Server schema/table/column
//! metadata, plus regex-to-SQL predicate pushdown for discovery queries.
//!
//! Three independent tiers (schemas, tables, columns) are loaded on first
//! access and can be invalidated individually after DDL so callers never see
//! stale metadata without paying for a full reload on every touch.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod cache;
pub mod error;
pub mod filter;
pub mod model;

pub use cache::{Catalog, CatalogConfig, CatalogConnection};
pub use error::CatalogError;
pub use filter::Pushdown;
pub use model::{
    ColumnDescriptor, LoadState, PrimaryKeyInfo, RelationKind, RowidType, SchemaEntry, TableEntry,
};
