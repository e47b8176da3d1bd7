//! Serialize `SqlValue`s to T-SQL literals for generated INSERT/UPDATE/DELETE
//! statements.

use mssql_types::SqlValue;

use crate::error::BridgeError;

/// Serialize one value to the T-SQL literal that reproduces it.
pub fn to_literal(value: &SqlValue) -> Result<String, BridgeError> {
    Ok(match value {
        SqlValue::Null => "NULL".to_string(),
        SqlValue::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        SqlValue::TinyInt(v) => v.to_string(),
        SqlValue::SmallInt(v) => v.to_string(),
        SqlValue::Int(v) => v.to_string(),
        SqlValue::BigInt(v) => v.to_string(),
        SqlValue::Float(v) => float_literal(*v as f64, 9)?,
        SqlValue::Double(v) => float_literal(*v, 17)?,
        SqlValue::String(s) => format!("N'{}'", escape_string(s)),
        SqlValue::Binary(b) => hex_literal(b),
        #[cfg(feature = "decimal")]
        SqlValue::Decimal(d) => d.to_string(),
        #[cfg(feature = "uuid")]
        SqlValue::Uuid(u) => format!("'{u}'"),
        #[cfg(feature = "chrono")]
        SqlValue::Date(d) => format!("CAST('{}' AS DATE)", d.format("%Y-%m-%d")),
        #[cfg(feature = "chrono")]
        SqlValue::Time(t) => format!("CAST('{}' AS TIME(7))", t.format("%H:%M:%S%.7f")),
        #[cfg(feature = "chrono")]
        SqlValue::DateTime(dt) => format!(
            "CAST('{}' AS DATETIME2(7))",
            dt.format("%Y-%m-%dT%H:%M:%S%.7f")
        ),
        #[cfg(feature = "chrono")]
        SqlValue::DateTimeOffset(dt) => format!(
            "CAST('{}' AS DATETIMEOFFSET(7))",
            dt.format("%Y-%m-%dT%H:%M:%S%.7f%:z")
        ),
        #[allow(unreachable_patterns)]
        other => {
            return Err(BridgeError::UnrepresentableLiteral(format!(
                "{other:?} has no T-SQL literal form"
            )));
        }
    })
}

fn float_literal(v: f64, sig_digits: usize) -> Result<String, BridgeError> {
    if !v.is_finite() {
        return Err(BridgeError::UnrepresentableLiteral(
            "NaN/Infinity cannot be represented as a T-SQL literal".to_string(),
        ));
    }
    Ok(format!("{v:.*e}", sig_digits.saturating_sub(1)))
}

fn escape_string(raw: &str) -> String {
    raw.replace('\'', "''")
}

fn hex_literal(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("0x");
    for b in bytes {
        out.push_str(&format!("{b:02X}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_single_quotes() {
        assert_eq!(
            to_literal(&SqlValue::String("O'Brien".to_string())).unwrap(),
            "N'O''Brien'"
        );
    }

    #[test]
    fn encodes_binary_as_hex() {
        assert_eq!(
            to_literal(&SqlValue::Binary(bytes::Bytes::from_static(&[0xDE, 0xAD]))).unwrap(),
            "0xDEAD"
        );
    }

    #[test]
    fn rejects_nan() {
        assert!(to_literal(&SqlValue::Double(f64::NAN)).is_err());
    }

    #[test]
    fn null_is_bare_keyword() {
        assert_eq!(to_literal(&SqlValue::Null).unwrap(), "NULL");
    }
}
