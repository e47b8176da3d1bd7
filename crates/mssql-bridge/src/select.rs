//! SELECT statement generation, including rowid synthesis.

use mssql_catalog::{RelationKind, RowidType, TableEntry};

use crate::error::BridgeError;
use crate::filter::{self, Predicate};
use crate::ident::quote_qualified;

/// A generated SELECT plus the metadata the host needs to interpret it.
#[derive(Debug, Clone)]
pub struct SelectPlan {
    /// The generated SQL text.
    pub sql: String,
    /// Column names in the order they appear in the SELECT list, including
    /// any primary-key columns appended solely to synthesize `rowid`.
    pub projected_columns: Vec<String>,
    /// Whether the host must re-apply filtering locally because part (or
    /// all) of the predicate could not be pushed down.
    pub needs_refilter: bool,
    /// If `rowid` was requested, how to assemble it from `projected_columns`.
    pub rowid: Option<RowidType>,
}

/// Build a `SELECT` for the given columns (by ordinal name), optional
/// pushdown filter, and optional `rowid` request.
pub fn build_select(
    table: &TableEntry,
    requested_columns: &[String],
    predicate: Option<&Predicate>,
    want_rowid: bool,
) -> Result<SelectPlan, BridgeError> {
    let mut projected: Vec<String> = requested_columns.to_vec();
    let rowid = if want_rowid {
        if table.kind == RelationKind::View {
            return Err(BridgeError::Catalog(mssql_catalog::CatalogError::NotATable(
                table.schema.clone(),
                table.name.clone(),
            )));
        }
        let rowid_type = table.primary_key.rowid_type.clone().ok_or_else(|| {
            BridgeError::Catalog(mssql_catalog::CatalogError::NoPrimaryKey(
                table.schema.clone(),
                table.name.clone(),
            ))
        })?;
        for pk_col in &table.primary_key.columns {
            if !projected.contains(pk_col) {
                projected.push(pk_col.clone());
            }
        }
        Some(rowid_type)
    } else {
        None
    };

    let column_list = projected
        .iter()
        .map(|c| crate::ident::quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");

    let mut sql = format!(
        "SELECT {column_list} FROM {}",
        quote_qualified(&table.schema, &table.name)
    );

    let mut needs_refilter = false;
    if let Some(predicate) = predicate {
        let pushdown = filter::lower(predicate)?;
        needs_refilter = pushdown.needs_refilter;
        if let Some(where_sql) = pushdown.sql {
            sql.push_str(" WHERE ");
            sql.push_str(&where_sql);
        } else {
            needs_refilter = true;
        }
    }

    Ok(SelectPlan {
        sql,
        projected_columns: projected,
        needs_refilter,
        rowid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mssql_catalog::PrimaryKeyInfo;

    fn table_with_pk(columns: Vec<&str>) -> TableEntry {
        let mut t = TableEntry::new("dbo", "orders", RelationKind::Table);
        t.primary_key = PrimaryKeyInfo::from_columns(columns.into_iter().map(String::from).collect());
        t
    }

    #[test]
    fn appends_missing_pk_column_for_rowid() {
        let table = table_with_pk(vec!["id"]);
        let plan = build_select(&table, &["name".to_string()], None, true).unwrap();
        assert_eq!(plan.projected_columns, vec!["name", "id"]);
        assert_eq!(plan.rowid, Some(RowidType::Scalar("id".to_string())));
    }

    #[test]
    fn does_not_duplicate_already_projected_pk() {
        let table = table_with_pk(vec!["id"]);
        let plan = build_select(&table, &["id".to_string(), "name".to_string()], None, true).unwrap();
        assert_eq!(plan.projected_columns, vec!["id", "name"]);
    }

    #[test]
    fn rowid_on_view_fails() {
        let mut table = table_with_pk(vec!["id"]);
        table.kind = RelationKind::View;
        let result = build_select(&table, &["name".to_string()], None, true);
        assert!(matches!(
            result,
            Err(BridgeError::Catalog(mssql_catalog::CatalogError::NotATable(_, _)))
        ));
    }

    #[test]
    fn rowid_on_pk_less_table_fails() {
        let table = table_with_pk(vec![]);
        let result = build_select(&table, &["name".to_string()], None, true);
        assert!(matches!(
            result,
            Err(BridgeError::Catalog(mssql_catalog::CatalogError::NoPrimaryKey(_, _)))
        ));
    }
}
