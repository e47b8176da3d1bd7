//! Batched UPDATE/DELETE via a `JOIN (VALUES ...)` pattern, keyed by `rowid`.

use mssql_types::SqlValue;

use crate::error::BridgeError;
use crate::ident::{quote_ident, quote_qualified};
use crate::literal::to_literal;

/// Default parameter ceiling to stay within SQL Server's ~2100-parameter cap.
pub const DEFAULT_PARAMETER_CAP: usize = 2000;

/// Compute the effective batch size for a DML statement, capped by both the
/// configured batch size and the parameter budget.
#[must_use]
pub fn effective_batch_size(configured_batch: usize, params_per_row: usize, parameter_cap: usize) -> usize {
    if params_per_row == 0 {
        return configured_batch;
    }
    configured_batch.min(parameter_cap / params_per_row).max(1)
}

/// One generated UPDATE or DELETE batch.
#[derive(Debug, Clone)]
pub struct DmlBatch {
    /// The generated SQL text.
    pub sql: String,
    /// Number of rows in this batch.
    pub row_count: usize,
}

/// Build batched `UPDATE ... FROM ... JOIN (VALUES ...)` statements.
///
/// `pk_columns` names the primary-key columns (composite-PK aware); each row
/// in `rows` is `(pk_values, new_values)` where `new_values` pairs column
/// names with their new literal values.
pub fn build_update_batches(
    schema: &str,
    table: &str,
    pk_columns: &[String],
    set_columns: &[String],
    rows: &[(Vec<SqlValue>, Vec<SqlValue>)],
    configured_batch: usize,
    parameter_cap: usize,
) -> Result<Vec<DmlBatch>, BridgeError> {
    let params_per_row = pk_columns.len() + set_columns.len();
    let batch_size = effective_batch_size(configured_batch, params_per_row, parameter_cap);

    let qualified = quote_qualified(schema, table);
    let pk_idents: Vec<String> = pk_columns.iter().map(|c| quote_ident(c)).collect();
    let set_idents: Vec<String> = set_columns.iter().map(|c| quote_ident(c)).collect();
    let value_columns: Vec<String> = pk_columns.iter().chain(set_columns.iter()).cloned().collect();

    let join_predicate = pk_idents
        .iter()
        .map(|c| format!("t.{c} = v.{c}"))
        .collect::<Vec<_>>()
        .join(" AND ");
    let set_clause = set_idents
        .iter()
        .map(|c| format!("t.{c} = v.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    let value_column_list = value_columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");

    let mut batches = Vec::new();
    for chunk in rows.chunks(batch_size.max(1)) {
        let mut tuples = Vec::with_capacity(chunk.len());
        for (pk, set) in chunk {
            let mut literals = Vec::with_capacity(pk.len() + set.len());
            for v in pk.iter().chain(set.iter()) {
                literals.push(to_literal(v)?);
            }
            tuples.push(format!("({})", literals.join(", ")));
        }
        let sql = format!(
            "UPDATE t SET {set_clause} FROM {qualified} AS t \
             JOIN (VALUES {}) AS v({value_column_list}) ON {join_predicate}",
            tuples.join(", ")
        );
        batches.push(DmlBatch {
            sql,
            row_count: chunk.len(),
        });
    }
    Ok(batches)
}

/// Build batched `DELETE ... FROM ... JOIN (VALUES ...)` statements keyed by
/// primary key.
pub fn build_delete_batches(
    schema: &str,
    table: &str,
    pk_columns: &[String],
    rows: &[Vec<SqlValue>],
    configured_batch: usize,
    parameter_cap: usize,
) -> Result<Vec<DmlBatch>, BridgeError> {
    let batch_size = effective_batch_size(configured_batch, pk_columns.len(), parameter_cap);

    let qualified = quote_qualified(schema, table);
    let pk_idents: Vec<String> = pk_columns.iter().map(|c| quote_ident(c)).collect();
    let join_predicate = pk_idents
        .iter()
        .map(|c| format!("t.{c} = v.{c}"))
        .collect::<Vec<_>>()
        .join(" AND ");
    let pk_column_list = pk_idents.join(", ");

    let mut batches = Vec::new();
    for chunk in rows.chunks(batch_size.max(1)) {
        let mut tuples = Vec::with_capacity(chunk.len());
        for pk in chunk {
            let literals = pk.iter().map(to_literal).collect::<Result<Vec<_>, _>>()?;
            tuples.push(format!("({})", literals.join(", ")));
        }
        let sql = format!(
            "DELETE t FROM {qualified} AS t \
             JOIN (VALUES {}) AS v({pk_column_list}) ON {join_predicate}",
            tuples.join(", ")
        );
        batches.push(DmlBatch {
            sql,
            row_count: chunk.len(),
        });
    }
    Ok(batches)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_cap_limits_batch_size() {
        assert_eq!(effective_batch_size(500, 3, 2000), 500);
        assert_eq!(effective_batch_size(500, 100, 2000), 20);
    }

    #[test]
    fn update_batch_uses_composite_join() {
        let rows = vec![(vec![SqlValue::Int(1), SqlValue::Int(2)], vec![SqlValue::Int(99)])];
        let batches = build_update_batches(
            "dbo",
            "t",
            &["a".to_string(), "b".to_string()],
            &["c".to_string()],
            &rows,
            500,
            DEFAULT_PARAMETER_CAP,
        )
        .unwrap();
        assert_eq!(batches.len(), 1);
        assert!(batches[0].sql.contains("t.[a] = v.[a] AND t.[b] = v.[b]"));
        assert!(batches[0].sql.contains("SET t.[c] = v.[c]"));
    }

    #[test]
    fn delete_batch_joins_on_pk() {
        let rows = vec![vec![SqlValue::Int(1)], vec![SqlValue::Int(2)]];
        let batches =
            build_delete_batches("dbo", "t", &["id".to_string()], &rows, 500, DEFAULT_PARAMETER_CAP).unwrap();
        assert_eq!(batches[0].row_count, 2);
        assert!(batches[0].sql.starts_with("DELETE t FROM [dbo].[t]"));
    }
}
