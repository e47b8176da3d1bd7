//! Three-tier, lazily-loaded catalog cache: schemas -> tables -> columns.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use mssql_client::{Client, Ready, Row};
use parking_lot::Mutex;

use crate::error::CatalogError;
use crate::filter::{self, Pushdown};
use crate::model::{ColumnDescriptor, LoadState, PrimaryKeyInfo, RelationKind, SchemaEntry, TableEntry};

/// Anything the catalog can run a discovery query against.
///
/// Implemented for `Client<Ready>` directly; a `mssql-driver-pool` pooled
/// connection implements it too via `DerefMut` (see that crate), so the
/// catalog never has to depend on the pool crate.
#[allow(async_fn_in_trait)]
pub trait CatalogConnection {
    /// Run a query and buffer all rows.
    async fn query_rows(&mut self, sql: &str) -> Result<Vec<Row>, CatalogError>;
}

impl CatalogConnection for Client<Ready> {
    async fn query_rows(&mut self, sql: &str) -> Result<Vec<Row>, CatalogError> {
        let rows = self.query(sql, &[]).await?.collect_all().await?;
        Ok(rows)
    }
}

/// Configuration for the catalog cache.
#[derive(Debug, Clone)]
pub struct CatalogConfig {
    /// TTL after which a `Loaded` tier flips to `Stale` on next access.
    /// Zero disables automatic refresh.
    pub ttl: Duration,
    /// Optional regex restricting which schema names are discovered.
    pub schema_filter: Option<String>,
    /// Optional regex restricting which table names are discovered.
    pub table_filter: Option<String>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::ZERO,
            schema_filter: None,
            table_filter: None,
        }
    }
}

/// The three-tier catalog cache for one attachment.
pub struct Catalog {
    config: CatalogConfig,
    schemas: Mutex<HashMap<String, SchemaEntry>>,
    schemas_state: Mutex<LoadState>,
    schemas_refreshed: Mutex<Option<Instant>>,
}

impl Catalog {
    /// Create an empty catalog cache.
    #[must_use]
    pub fn new(config: CatalogConfig) -> Self {
        Self {
            config,
            schemas: Mutex::new(HashMap::new()),
            schemas_state: Mutex::new(LoadState::NotLoaded),
            schemas_refreshed: Mutex::new(None),
        }
    }

    fn tier_expired(&self, last_refresh: Option<Instant>) -> bool {
        if self.config.ttl.is_zero() {
            return false;
        }
        match last_refresh {
            Some(t) => t.elapsed() > self.config.ttl,
            None => true,
        }
    }

    fn mark_stale_if_expired(&self) {
        let mut state = self.schemas_state.lock();
        if *state == LoadState::Loaded && self.tier_expired(*self.schemas_refreshed.lock()) {
            *state = LoadState::Stale;
        }
    }

    /// Ensure the schema list has been discovered (runs one query against
    /// `sys.schemas` on first access or after invalidation/TTL expiry).
    pub async fn ensure_schemas_loaded(&self, conn: &mut impl CatalogConnection) -> Result<(), CatalogError> {
        self.mark_stale_if_expired();
        if !self.schemas_state.lock().needs_load() {
            return Ok(());
        }
        *self.schemas_state.lock() = LoadState::Loading;

        let mut sql = "SELECT name FROM sys.schemas".to_string();
        if let Some(pattern) = &self.config.schema_filter {
            if let Some(predicate) = sql_predicate("name", pattern) {
                sql.push_str(" WHERE ");
                sql.push_str(&predicate);
            }
        }

        let result = conn.query_rows(&sql).await;
        match result {
            Ok(rows) => {
                let mut schemas = self.schemas.lock();
                for row in &rows {
                    let name: String = row
                        .get_string(0)
                        .ok_or_else(|| CatalogError::MalformedRow("sys.schemas.name".into()))?;
                    if !matches_client_side(&self.config.schema_filter, &name) {
                        continue;
                    }
                    schemas.entry(name.clone()).or_insert_with(|| SchemaEntry::new(name));
                }
                *self.schemas_refreshed.lock() = Some(Instant::now());
                *self.schemas_state.lock() = LoadState::Loaded;
                Ok(())
            }
            Err(e) => {
                *self.schemas_state.lock() = LoadState::NotLoaded;
                Err(e)
            }
        }
    }

    /// Ensure a schema's table/view list has been discovered (one query
    /// against `sys.objects` joined with `sys.partitions` for row counts).
    pub async fn ensure_tables_loaded(
        &self,
        conn: &mut impl CatalogConnection,
        schema: &str,
    ) -> Result<(), CatalogError> {
        self.ensure_schemas_loaded(conn).await?;

        {
            let mut schemas = self.schemas.lock();
            let entry = schemas
                .get_mut(schema)
                .ok_or_else(|| CatalogError::UnknownSchema(schema.to_string()))?;
            if self.config.ttl > Duration::ZERO
                && entry.tables_state == LoadState::Loaded
                && self.tier_expired(entry.last_refresh)
            {
                entry.tables_state = LoadState::Stale;
            }
            if !entry.tables_state.needs_load() {
                return Ok(());
            }
            entry.tables_state = LoadState::Loading;
        }

        let mut sql = format!(
            "SELECT o.name, o.type, p.rows FROM sys.objects o \
             LEFT JOIN sys.partitions p ON p.object_id = o.object_id AND p.index_id IN (0, 1) \
             JOIN sys.schemas s ON s.schema_id = o.schema_id \
             WHERE o.type IN ('U', 'V') AND s.name = '{}'",
            escape_literal(schema)
        );
        if let Some(pattern) = &self.config.table_filter {
            if let Some(predicate) = sql_predicate("o.name", pattern) {
                sql.push_str(" AND ");
                sql.push_str(&predicate);
            }
        }

        let result = conn.query_rows(&sql).await;
        match result {
            Ok(rows) => {
                let mut schemas = self.schemas.lock();
                let entry = schemas
                    .get_mut(schema)
                    .ok_or_else(|| CatalogError::UnknownSchema(schema.to_string()))?;
                for row in &rows {
                    let name: String = row
                        .get_string(0)
                        .ok_or_else(|| CatalogError::MalformedRow("sys.objects.name".into()))?;
                    if !matches_client_side(&self.config.table_filter, &name) {
                        continue;
                    }
                    let type_code: String = row.get_string(1).unwrap_or_default();
                    let kind = if type_code.trim() == "V" {
                        RelationKind::View
                    } else {
                        RelationKind::Table
                    };
                    let row_count: Option<i64> = row.get(2).ok();
                    let table = entry
                        .tables
                        .entry(name.clone())
                        .or_insert_with(|| TableEntry::new(schema, name, kind));
                    table.kind = kind;
                    table.row_count = row_count;
                }
                entry.last_refresh = Some(Instant::now());
                entry.tables_state = LoadState::Loaded;
                Ok(())
            }
            Err(e) => {
                let mut schemas = self.schemas.lock();
                if let Some(entry) = schemas.get_mut(schema) {
                    entry.tables_state = LoadState::NotLoaded;
                }
                Err(e)
            }
        }
    }

    /// Ensure a table's column list (and derived primary-key info) has been
    /// discovered (one query against `sys.columns` joined with `sys.types`).
    pub async fn ensure_columns_loaded(
        &self,
        conn: &mut impl CatalogConnection,
        schema: &str,
        table: &str,
    ) -> Result<(), CatalogError> {
        self.ensure_tables_loaded(conn, schema).await?;

        let kind = {
            let mut schemas = self.schemas.lock();
            let entry = schemas
                .get_mut(schema)
                .ok_or_else(|| CatalogError::UnknownSchema(schema.to_string()))?;
            let t = entry
                .tables
                .get_mut(table)
                .ok_or_else(|| CatalogError::UnknownTable(schema.to_string(), table.to_string()))?;
            if self.config.ttl > Duration::ZERO
                && t.columns_state == LoadState::Loaded
                && self.tier_expired(t.last_refresh)
            {
                t.columns_state = LoadState::Stale;
            }
            if !t.columns_state.needs_load() {
                return Ok(());
            }
            t.columns_state = LoadState::Loading;
            t.kind
        };

        let columns_sql = format!(
            "SELECT c.name, c.column_id, ty.name, c.max_length, c.precision, c.scale, \
                    c.is_nullable, cast(coll.name as nvarchar(128)) \
             FROM sys.columns c \
             JOIN sys.types ty ON ty.user_type_id = c.user_type_id \
             JOIN sys.objects o ON o.object_id = c.object_id \
             JOIN sys.schemas s ON s.schema_id = o.schema_id \
             OUTER APPLY (SELECT collation_name AS name) coll \
             WHERE s.name = '{schema}' AND o.name = '{table}' \
             ORDER BY c.column_id",
            schema = escape_literal(schema),
            table = escape_literal(table),
        );

        let pk_sql = format!(
            "SELECT c.name FROM sys.indexes i \
             JOIN sys.index_columns ic ON ic.object_id = i.object_id AND ic.index_id = i.index_id \
             JOIN sys.columns c ON c.object_id = ic.object_id AND c.column_id = ic.column_id \
             JOIN sys.objects o ON o.object_id = i.object_id \
             JOIN sys.schemas s ON s.schema_id = o.schema_id \
             WHERE i.is_primary_key = 1 AND s.name = '{schema}' AND o.name = '{table}' \
             ORDER BY ic.key_ordinal",
            schema = escape_literal(schema),
            table = escape_literal(table),
        );

        let columns_result = conn.query_rows(&columns_sql).await;
        let columns_rows = match columns_result {
            Ok(rows) => rows,
            Err(e) => {
                self.reset_columns_state(schema, table);
                return Err(e);
            }
        };

        let mut columns = Vec::with_capacity(columns_rows.len());
        for row in &columns_rows {
            let name: String = row
                .get_string(0)
                .ok_or_else(|| CatalogError::MalformedRow("sys.columns.name".into()))?;
            let ordinal: i32 = row.get(1).unwrap_or(0);
            let sql_type_name: String = row.get_string(2).unwrap_or_default();
            let max_length: Option<i32> = row.get(3).ok();
            let precision: Option<u8> = row.get::<i32>(4).ok().map(|p| p as u8);
            let scale: Option<u8> = row.get::<i32>(5).ok().map(|s| s as u8);
            let is_nullable: bool = row.get(6).unwrap_or(false);
            let collation: Option<String> = row.get_string(7);
            let (is_case_sensitive, is_utf8) =
                ColumnDescriptor::derive_collation_flags(collation.as_deref());
            let is_unicode = sql_type_name.starts_with('n') || sql_type_name.starts_with('N');
            columns.push(ColumnDescriptor {
                name,
                ordinal: ordinal.max(0) as u32,
                mapped_type: mapped_type_name(&sql_type_name),
                sql_type_name,
                max_length,
                precision,
                scale,
                is_nullable,
                collation,
                is_case_sensitive,
                is_unicode,
                is_utf8,
            });
        }

        let primary_key = if kind == RelationKind::View {
            PrimaryKeyInfo::none()
        } else {
            match conn.query_rows(&pk_sql).await {
                Ok(rows) => {
                    let mut pk_columns = Vec::with_capacity(rows.len());
                    for row in &rows {
                        pk_columns.push(
                            row.get_string(0)
                                .ok_or_else(|| CatalogError::MalformedRow("pk column name".into()))?,
                        );
                    }
                    PrimaryKeyInfo::from_columns(pk_columns)
                }
                Err(e) => {
                    self.reset_columns_state(schema, table);
                    return Err(e);
                }
            }
        };

        let mut schemas = self.schemas.lock();
        let entry = schemas
            .get_mut(schema)
            .ok_or_else(|| CatalogError::UnknownSchema(schema.to_string()))?;
        let t = entry
            .tables
            .get_mut(table)
            .ok_or_else(|| CatalogError::UnknownTable(schema.to_string(), table.to_string()))?;
        t.columns = columns;
        t.primary_key = primary_key;
        t.last_refresh = Some(Instant::now());
        t.columns_state = LoadState::Loaded;
        Ok(())
    }

    fn reset_columns_state(&self, schema: &str, table: &str) {
        let mut schemas = self.schemas.lock();
        if let Some(entry) = schemas.get_mut(schema) {
            if let Some(t) = entry.tables.get_mut(table) {
                t.columns_state = LoadState::NotLoaded;
            }
        }
    }

    /// Bulk-populate schemas, tables, and columns for every schema with a
    /// single joined query, for attachments that prefer upfront preload.
    pub async fn bulk_load_all(&self, conn: &mut impl CatalogConnection) -> Result<(), CatalogError> {
        let sql = "SELECT s.name, o.name, o.type, c.name, c.column_id, ty.name, \
                          c.max_length, c.precision, c.scale, c.is_nullable, \
                          cast(coll.name as nvarchar(128)) \
                   FROM sys.schemas s \
                   JOIN sys.objects o ON o.schema_id = s.schema_id AND o.type IN ('U', 'V') \
                   JOIN sys.columns c ON c.object_id = o.object_id \
                   JOIN sys.types ty ON ty.user_type_id = c.user_type_id \
                   OUTER APPLY (SELECT collation_name AS name) coll \
                   ORDER BY s.name, o.name, c.column_id";

        let rows = conn.query_rows(sql).await?;
        let mut schemas: HashMap<String, SchemaEntry> = HashMap::new();

        for row in &rows {
            let schema_name: String = row
                .get_string(0)
                .ok_or_else(|| CatalogError::MalformedRow("schema name".into()))?;
            let table_name: String = row
                .get_string(1)
                .ok_or_else(|| CatalogError::MalformedRow("table name".into()))?;
            let type_code: String = row.get_string(2).unwrap_or_default();
            let kind = if type_code.trim() == "V" {
                RelationKind::View
            } else {
                RelationKind::Table
            };
            let col_name: String = row
                .get_string(3)
                .ok_or_else(|| CatalogError::MalformedRow("column name".into()))?;
            let ordinal: i32 = row.get(4).unwrap_or(0);
            let sql_type_name: String = row.get_string(5).unwrap_or_default();
            let max_length: Option<i32> = row.get(6).ok();
            let precision: Option<u8> = row.get::<i32>(7).ok().map(|p| p as u8);
            let scale: Option<u8> = row.get::<i32>(8).ok().map(|s| s as u8);
            let is_nullable: bool = row.get(9).unwrap_or(false);
            let collation: Option<String> = row.get_string(10);
            let (is_case_sensitive, is_utf8) =
                ColumnDescriptor::derive_collation_flags(collation.as_deref());
            let is_unicode = sql_type_name.starts_with('n') || sql_type_name.starts_with('N');

            let schema_entry = schemas
                .entry(schema_name.clone())
                .or_insert_with(|| SchemaEntry::new(schema_name.clone()));
            schema_entry.tables_state = LoadState::Loaded;
            schema_entry.last_refresh = Some(Instant::now());

            let table_entry = schema_entry
                .tables
                .entry(table_name.clone())
                .or_insert_with(|| TableEntry::new(schema_name.clone(), table_name.clone(), kind));
            table_entry.columns_state = LoadState::Loaded;
            table_entry.last_refresh = Some(Instant::now());
            table_entry.columns.push(ColumnDescriptor {
                name: col_name,
                ordinal: ordinal.max(0) as u32,
                mapped_type: mapped_type_name(&sql_type_name),
                sql_type_name,
                max_length,
                precision,
                scale,
                is_nullable,
                collation,
                is_case_sensitive,
                is_unicode,
                is_utf8,
            });
        }

        *self.schemas.lock() = schemas;
        *self.schemas_refreshed.lock() = Some(Instant::now());
        *self.schemas_state.lock() = LoadState::Loaded;
        Ok(())
    }

    /// Invalidate the whole catalog (flips the schema list to `NotLoaded`).
    pub fn invalidate_all(&self) {
        *self.schemas_state.lock() = LoadState::NotLoaded;
        self.schemas.lock().clear();
    }

    /// Invalidate one schema's table list (e.g. after `CREATE TABLE`).
    pub fn invalidate_schema(&self, schema: &str) {
        if let Some(entry) = self.schemas.lock().get_mut(schema) {
            entry.tables_state = LoadState::NotLoaded;
            entry.tables.clear();
        }
    }

    /// Invalidate one table's column list (e.g. after `ALTER TABLE`).
    pub fn invalidate_table(&self, schema: &str, table: &str) {
        if let Some(entry) = self.schemas.lock().get_mut(schema) {
            if let Some(t) = entry.tables.get_mut(table) {
                t.columns_state = LoadState::NotLoaded;
                t.columns.clear();
            }
        }
    }

    /// Snapshot of currently-known schema names.
    #[must_use]
    pub fn schema_names(&self) -> Vec<String> {
        self.schemas.lock().keys().cloned().collect()
    }

    /// Snapshot of one table's entry, if known.
    #[must_use]
    pub fn table(&self, schema: &str, table: &str) -> Option<TableEntry> {
        self.schemas.lock().get(schema)?.tables.get(table).cloned()
    }

    /// Look up the `rowid` type for a table, distinguishing the view and
    /// no-primary-key cases with dedicated errors per §4.6/§3.
    pub fn rowid_type(&self, schema: &str, table: &str) -> Result<crate::model::RowidType, CatalogError> {
        let entry = self
            .table(schema, table)
            .ok_or_else(|| CatalogError::UnknownTable(schema.to_string(), table.to_string()))?;
        if entry.kind == RelationKind::View {
            return Err(CatalogError::NotATable(schema.to_string(), table.to_string()));
        }
        entry
            .primary_key
            .rowid_type
            .ok_or_else(|| CatalogError::NoPrimaryKey(schema.to_string(), table.to_string()))
    }
}

fn sql_predicate(column: &str, pattern: &str) -> Option<String> {
    match filter::classify(pattern) {
        Pushdown::Equals(v) => Some(format!("{column} = '{v}'")),
        Pushdown::Like(v) => Some(format!("{column} LIKE '{v}' ESCAPE '\\'")),
        Pushdown::In(vs) => {
            let list = vs.iter().map(|v| format!("'{v}'")).collect::<Vec<_>>().join(", ");
            Some(format!("{column} IN ({list})"))
        }
        Pushdown::ClientSide => None,
    }
}

/// When a filter couldn't be pushed down, every discovered row still needs
/// client-side matching against the original regex.
fn matches_client_side(pattern: &Option<String>, name: &str) -> bool {
    match pattern {
        None => true,
        Some(p) => match regex::Regex::new(p) {
            Ok(re) => re.is_match(name),
            Err(_) => true,
        },
    }
}

fn escape_literal(raw: &str) -> String {
    raw.replace('\'', "''")
}

fn mapped_type_name(sql_type: &str) -> String {
    match sql_type.to_ascii_lowercase().as_str() {
        "tinyint" => "u8",
        "bit" => "bool",
        "smallint" => "i16",
        "int" => "i32",
        "bigint" => "i64",
        "real" => "f32",
        "float" => "f64",
        "decimal" | "numeric" | "money" | "smallmoney" => "decimal",
        "varchar" | "char" | "text" | "nvarchar" | "nchar" | "ntext" | "xml" => "string",
        "varbinary" | "binary" | "image" => "bytes",
        "date" | "datetime" | "smalldatetime" | "datetime2" => "timestamp",
        "datetimeoffset" => "timestamp_tz",
        "uniqueidentifier" => "uuid",
        other => other,
    }
    .to_string()
}
