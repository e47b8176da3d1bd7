//! Batched INSERT generation.

use mssql_types::SqlValue;

use crate::error::BridgeError;
use crate::ident::{quote_ident, quote_qualified};
use crate::literal::to_literal;

/// Batch-size knobs for INSERT generation (§6 configuration variables).
#[derive(Debug, Clone, Copy)]
pub struct InsertBatchLimits {
    /// Max VALUES-clause rows per statement (SQL Server's hard cap is 1000).
    pub max_rows_per_statement: usize,
    /// Max generated SQL text size, in bytes.
    pub max_sql_bytes: usize,
}

impl Default for InsertBatchLimits {
    fn default() -> Self {
        Self {
            max_rows_per_statement: 1000,
            max_sql_bytes: 8 * 1024 * 1024,
        }
    }
}

/// One generated INSERT batch.
#[derive(Debug, Clone)]
pub struct InsertBatch {
    /// The generated SQL text.
    pub sql: String,
    /// Number of rows in this batch.
    pub row_count: usize,
    /// Whether this statement carries an `OUTPUT INSERTED.*` clause.
    pub has_output: bool,
}

/// Split `rows` into INSERT batches honoring the row and byte caps, emitting
/// `INSERT INTO [s].[t] (cols) [OUTPUT INSERTED.col, ...] VALUES (...), ...;`
/// for each batch.
pub fn build_insert_batches(
    schema: &str,
    table: &str,
    columns: &[String],
    rows: &[Vec<SqlValue>],
    returning: &[String],
    limits: InsertBatchLimits,
) -> Result<Vec<InsertBatch>, BridgeError> {
    if limits.max_rows_per_statement == 0 {
        return Err(BridgeError::BadConfiguration(
            "insert_max_rows_per_statement must be greater than 0".to_string(),
        ));
    }

    let column_list = columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
    let output_clause = if returning.is_empty() {
        String::new()
    } else {
        let cols = returning
            .iter()
            .map(|c| format!("INSERTED.{}", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");
        format!(" OUTPUT {cols}")
    };
    let prefix = format!(
        "INSERT INTO {} ({column_list}){output_clause} VALUES ",
        quote_qualified(schema, table)
    );

    let mut batches = Vec::new();
    let mut current_rows: Vec<String> = Vec::new();
    let mut current_len = prefix.len();

    let flush = |current_rows: &mut Vec<String>, batches: &mut Vec<InsertBatch>| {
        if current_rows.is_empty() {
            return;
        }
        let sql = format!("{prefix}{};", current_rows.join(", "));
        batches.push(InsertBatch {
            sql,
            row_count: current_rows.len(),
            has_output: !returning.is_empty(),
        });
        current_rows.clear();
    };

    for row in rows {
        let values = row.iter().map(to_literal).collect::<Result<Vec<_>, _>>()?;
        let tuple = format!("({})", values.join(", "));

        let would_exceed_bytes = current_len + tuple.len() + 2 > limits.max_sql_bytes;
        let would_exceed_rows = current_rows.len() >= limits.max_rows_per_statement;
        if !current_rows.is_empty() && (would_exceed_bytes || would_exceed_rows) {
            flush(&mut current_rows, &mut batches);
            current_len = prefix.len();
        }

        current_len += tuple.len() + 2;
        current_rows.push(tuple);
    }
    flush(&mut current_rows, &mut batches);

    Ok(batches)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_respect_row_cap() {
        let rows: Vec<Vec<SqlValue>> = (0..2500).map(|i| vec![SqlValue::Int(i)]).collect();
        let batches = build_insert_batches(
            "dbo",
            "t",
            &["id".to_string()],
            &rows,
            &[],
            InsertBatchLimits::default(),
        )
        .unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].row_count, 1000);
        assert_eq!(batches[2].row_count, 500);
    }

    #[test]
    fn output_clause_present_when_returning_requested() {
        let rows = vec![vec![SqlValue::Int(1)]];
        let batches = build_insert_batches(
            "dbo",
            "t",
            &["id".to_string()],
            &rows,
            &["id".to_string()],
            InsertBatchLimits::default(),
        )
        .unwrap();
        assert!(batches[0].sql.contains("OUTPUT INSERTED.[id]"));
    }
}
