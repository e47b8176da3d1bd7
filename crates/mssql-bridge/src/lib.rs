//! # mssql-bridge
//!
//! Translates host-side query/DML operations into generated T-SQL against a
//! pooled SQL Server connection: filter and function pushdown, `rowid`
//! synthesis from primary keys, batched INSERT/UPDATE/DELETE generation, and
//! cancellable streaming scans.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod diagnostics;
pub mod dml;
pub mod error;
pub mod filter;
pub mod ident;
pub mod insert;
pub mod literal;
pub mod scan;
pub mod select;

pub use diagnostics::Bridge;
pub use dml::{build_delete_batches, build_update_batches, DmlBatch, DEFAULT_PARAMETER_CAP};
pub use error::BridgeError;
pub use filter::{CompareOp, Expr, Predicate, Pushdown};
pub use insert::{build_insert_batches, InsertBatch, InsertBatchLimits};
pub use scan::Scan;
pub use select::{build_select, SelectPlan};
