//! Catalog data model: schemas, tables, columns, and primary-key info.

use std::time::Instant;

/// Load state of a catalog tier.
///
/// `Loading` serializes concurrent loaders: the first caller to observe
/// `NotLoaded` or `Stale` transitions to `Loading` and runs the discovery
/// query; everyone else waits on the same tier's lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadState {
    /// Never discovered.
    #[default]
    NotLoaded,
    /// A discovery query is in flight.
    Loading,
    /// Discovered and within TTL (or TTL disabled).
    Loaded,
    /// Discovered, but the TTL has elapsed; must reload before next read.
    Stale,
}

impl LoadState {
    /// Whether a reader must trigger (or wait for) a (re)load before using this tier.
    #[must_use]
    pub fn needs_load(&self) -> bool {
        matches!(self, Self::NotLoaded | Self::Stale)
    }
}

/// Whether a catalog relation is a table or a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    /// An ordinary table; may have a primary key and support `rowid`.
    Table,
    /// A view; never has primary-key info, and `rowid` requests fail.
    View,
}

/// The host-visible type of a synthesized `rowid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowidType {
    /// Single-column primary key; rowid mirrors that column's mapped type directly.
    Scalar(String),
    /// Composite primary key; rowid is a record whose fields mirror the PK
    /// columns in key-ordinal order.
    Composite(Vec<String>),
}

/// Primary-key metadata for a table.
#[derive(Debug, Clone, Default)]
pub struct PrimaryKeyInfo {
    /// Whether this info has been loaded from `sys.columns`/key constraints yet.
    pub loaded: bool,
    /// Whether a primary key exists on this table.
    pub exists: bool,
    /// Primary-key column names, ordered by key ordinal.
    pub columns: Vec<String>,
    /// The rowid type implied by `columns`, if `exists`.
    pub rowid_type: Option<RowidType>,
}

impl PrimaryKeyInfo {
    /// Build primary-key info from an ordered list of key columns.
    #[must_use]
    pub fn from_columns(columns: Vec<String>) -> Self {
        let rowid_type = match columns.as_slice() {
            [] => None,
            [single] => Some(RowidType::Scalar(single.clone())),
            many => Some(RowidType::Composite(many.to_vec())),
        };
        Self {
            loaded: true,
            exists: !columns.is_empty(),
            columns,
            rowid_type,
        }
    }

    /// Primary-key info for a relation known to have none (e.g. a view).
    #[must_use]
    pub fn none() -> Self {
        Self {
            loaded: true,
            exists: false,
            columns: Vec::new(),
            rowid_type: None,
        }
    }
}

/// A single column's catalog descriptor.
#[derive(Debug, Clone)]
pub struct ColumnDescriptor {
    /// Column name.
    pub name: String,
    /// 1-based ordinal position within the table.
    pub ordinal: u32,
    /// SQL Server type name (e.g. "nvarchar", "int") from `sys.types`.
    pub sql_type_name: String,
    /// Host-mapped type name.
    pub mapped_type: String,
    /// Max length in bytes, where applicable (-1 for MAX types, per `sys.columns`).
    pub max_length: Option<i32>,
    /// Numeric precision.
    pub precision: Option<u8>,
    /// Numeric scale.
    pub scale: Option<u8>,
    /// Whether NULL is allowed.
    pub is_nullable: bool,
    /// Collation name, for string types.
    pub collation: Option<String>,
    /// Derived from `_CS_`/`_BIN` in the collation name.
    pub is_case_sensitive: bool,
    /// Derived from the type being one of the N-prefixed Unicode types.
    pub is_unicode: bool,
    /// Derived from a `_UTF8` suffix in the collation name.
    pub is_utf8: bool,
}

impl ColumnDescriptor {
    pub(crate) fn derive_collation_flags(collation: Option<&str>) -> (bool, bool) {
        let Some(collation) = collation else {
            return (false, false);
        };
        let is_case_sensitive = collation.contains("_CS_") || collation.contains("_BIN");
        let is_utf8 = collation.ends_with("_UTF8");
        (is_case_sensitive, is_utf8)
    }
}

/// A table or view entry within a schema.
#[derive(Debug, Clone)]
pub struct TableEntry {
    /// Owning schema name.
    pub schema: String,
    /// Table (or view) name.
    pub name: String,
    /// Whether this is a table or a view.
    pub kind: RelationKind,
    /// Row count, if known (joined from `sys.partitions`).
    pub row_count: Option<i64>,
    /// Columns, ordered by ordinal. Empty until `columns_state` is `Loaded`.
    pub columns: Vec<ColumnDescriptor>,
    /// Load state of this table's column list.
    pub columns_state: LoadState,
    /// Primary-key info. Only meaningful once `columns_state == Loaded`.
    pub primary_key: PrimaryKeyInfo,
    /// When `columns` was last (re)loaded.
    pub last_refresh: Option<Instant>,
}

impl TableEntry {
    /// Construct an empty entry with no columns loaded yet.
    #[must_use]
    pub fn new(schema: impl Into<String>, name: impl Into<String>, kind: RelationKind) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
            kind,
            row_count: None,
            columns: Vec::new(),
            columns_state: LoadState::NotLoaded,
            primary_key: PrimaryKeyInfo::default(),
            last_refresh: None,
        }
    }
}

/// A schema entry holding its discovered tables/views.
#[derive(Debug, Clone, Default)]
pub struct SchemaEntry {
    /// Schema name.
    pub name: String,
    /// Tables and views, keyed by name.
    pub tables: std::collections::HashMap<String, TableEntry>,
    /// Load state of this schema's table list.
    pub tables_state: LoadState,
    /// When `tables` was last (re)loaded.
    pub last_refresh: Option<Instant>,
}

impl SchemaEntry {
    /// Construct an empty entry with no tables loaded yet.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: std::collections::HashMap::new(),
            tables_state: LoadState::NotLoaded,
            last_refresh: None,
        }
    }
}
