//! Filter and function pushdown: translate a host-side predicate tree into a
//! T-SQL `WHERE` clause, falling back to host-side refiltering for anything
//! that can't be expressed server-side.

use mssql_types::SqlValue;

use crate::error::BridgeError;
use crate::ident::quote_ident;
use crate::literal::to_literal;

/// A comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// `=`
    Eq,
    /// `<>`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl CompareOp {
    fn as_sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

/// A scalar expression: a column reference, a literal, or a recognized
/// function call over other expressions.
#[derive(Debug, Clone)]
pub enum Expr {
    /// A column reference, by name.
    Column(String),
    /// A constant value.
    Literal(SqlValue),
    /// A recognized function call, e.g. `lower(col)`, `date_diff(part, a, b)`.
    Call(String, Vec<Expr>),
}

/// A host-side filter predicate tree, as handed to the bridge for pushdown.
#[derive(Debug, Clone)]
pub enum Predicate {
    /// `expr OP expr`
    Compare(CompareOp, Expr, Expr),
    /// `expr IS NULL`
    IsNull(Expr),
    /// `expr IS NOT NULL`
    IsNotNull(Expr),
    /// `expr IN (values)`
    In(Expr, Vec<SqlValue>),
    /// `expr BETWEEN low AND high`
    Between(Expr, SqlValue, SqlValue),
    /// Conjunction: unsupported children are dropped and `needs_refilter` is
    /// set on the result rather than failing the whole predicate.
    And(Vec<Predicate>),
    /// Disjunction: all-or-nothing. If any child is unsupported, the whole
    /// `OR` is dropped and the host must refilter locally.
    Or(Vec<Predicate>),
}

const FUNCTION_DEPTH_CAP: usize = 100;

/// Recognized scalar function name -> T-SQL rendering.
fn render_function(name: &str, args: &[Expr], depth: usize) -> Result<Option<String>, BridgeError> {
    if depth > FUNCTION_DEPTH_CAP {
        return Ok(None);
    }
    let rendered: Option<Vec<String>> = args
        .iter()
        .map(|a| render_expr(a, depth + 1))
        .collect::<Result<Option<Vec<_>>, _>>()?;
    let Some(rendered) = rendered else {
        return Ok(None);
    };

    let sql = match (name, rendered.as_slice()) {
        ("lower", [a]) => format!("LOWER({a})"),
        ("upper", [a]) => format!("UPPER({a})"),
        ("length", [a]) => format!("LEN({a})"),
        ("trim", [a]) => format!("TRIM({a})"),
        ("ltrim", [a]) => format!("LTRIM({a})"),
        ("rtrim", [a]) => format!("RTRIM({a})"),
        ("year", [a]) => format!("YEAR({a})"),
        ("month", [a]) => format!("MONTH({a})"),
        ("day", [a]) => format!("DAY({a})"),
        ("hour", [a]) => format!("DATEPART(hour, {a})"),
        ("minute", [a]) => format!("DATEPART(minute, {a})"),
        ("second", [a]) => format!("DATEPART(second, {a})"),
        ("date_diff", [part, s, e]) => format!("DATEDIFF({part}, {s}, {e})"),
        ("date_add", [date, part, n]) => format!("DATEADD({part}, {n}, {date})"),
        ("contains", [a, pat]) => format!("{a} LIKE '%' + {pat} + '%'"),
        ("starts_with", [a, pat]) => format!("{a} LIKE {pat} + '%'"),
        ("ends_with", [a, pat]) => format!("{a} LIKE '%' + {pat}"),
        ("add", [a, b]) => format!("({a} + {b})"),
        ("sub", [a, b]) => format!("({a} - {b})"),
        ("mul", [a, b]) => format!("({a} * {b})"),
        ("div", [a, b]) => format!("({a} / {b})"),
        _ => return Ok(None),
    };
    Ok(Some(sql))
}

fn render_expr(expr: &Expr, depth: usize) -> Result<Option<String>, BridgeError> {
    match expr {
        Expr::Column(name) => Ok(Some(quote_ident(name))),
        Expr::Literal(v) => Ok(Some(to_literal(v)?)),
        Expr::Call(name, args) => render_function(name, args, depth),
    }
}

/// The result of lowering a predicate tree to SQL.
#[derive(Debug, Clone)]
pub struct Pushdown {
    /// The `WHERE`-clause fragment (without the `WHERE` keyword), or `None`
    /// if nothing could be pushed down at all.
    pub sql: Option<String>,
    /// Whether the host must still re-apply the original predicate locally,
    /// because part (or all) of it could not be pushed down.
    pub needs_refilter: bool,
}

/// Lower a predicate tree into a SQL `WHERE` fragment, per the AND/OR rules:
/// an `AND` drops unsupported children and flags `needs_refilter`; an `OR` is
/// all-or-nothing.
pub fn lower(predicate: &Predicate) -> Result<Pushdown, BridgeError> {
    Ok(lower_inner(predicate, 0)?.unwrap_or(Pushdown {
        sql: None,
        needs_refilter: true,
    }))
}

fn lower_inner(predicate: &Predicate, depth: usize) -> Result<Option<Pushdown>, BridgeError> {
    if depth > FUNCTION_DEPTH_CAP {
        return Ok(None);
    }
    match predicate {
        Predicate::Compare(op, lhs, rhs) => {
            let (Some(l), Some(r)) = (render_expr(lhs, depth)?, render_expr(rhs, depth)?) else {
                return Ok(None);
            };
            Ok(Some(Pushdown {
                sql: Some(format!("{l} {} {r}", op.as_sql())),
                needs_refilter: false,
            }))
        }
        Predicate::IsNull(e) => Ok(render_expr(e, depth)?.map(|e| Pushdown {
            sql: Some(format!("{e} IS NULL")),
            needs_refilter: false,
        })),
        Predicate::IsNotNull(e) => Ok(render_expr(e, depth)?.map(|e| Pushdown {
            sql: Some(format!("{e} IS NOT NULL")),
            needs_refilter: false,
        })),
        Predicate::In(e, values) => {
            let Some(e) = render_expr(e, depth)? else {
                return Ok(None);
            };
            if values.is_empty() {
                return Ok(Some(Pushdown {
                    sql: Some("1 = 0".to_string()),
                    needs_refilter: false,
                }));
            }
            let list = values
                .iter()
                .map(to_literal)
                .collect::<Result<Vec<_>, _>>()?
                .join(", ");
            Ok(Some(Pushdown {
                sql: Some(format!("{e} IN ({list})")),
                needs_refilter: false,
            }))
        }
        Predicate::Between(e, low, high) => {
            let Some(e) = render_expr(e, depth)? else {
                return Ok(None);
            };
            // Lowered to two comparisons, as required when BETWEEN's bounds
            // carry different literal encodings than a native BETWEEN would.
            Ok(Some(Pushdown {
                sql: Some(format!(
                    "{e} >= {} AND {e} <= {}",
                    to_literal(low)?,
                    to_literal(high)?
                )),
                needs_refilter: false,
            }))
        }
        Predicate::And(children) => {
            let mut parts = Vec::new();
            let mut needs_refilter = false;
            for child in children {
                match lower_inner(child, depth + 1)? {
                    Some(p) => {
                        if let Some(sql) = p.sql {
                            parts.push(sql);
                        }
                        needs_refilter |= p.needs_refilter;
                    }
                    None => needs_refilter = true,
                }
            }
            if parts.is_empty() {
                return Ok(None);
            }
            Ok(Some(Pushdown {
                sql: Some(format!("({})", parts.join(" AND "))),
                needs_refilter,
            }))
        }
        Predicate::Or(children) => {
            let mut parts = Vec::with_capacity(children.len());
            for child in children {
                match lower_inner(child, depth + 1)? {
                    Some(p) if !p.needs_refilter => {
                        if let Some(sql) = p.sql {
                            parts.push(sql);
                        } else {
                            return Ok(None);
                        }
                    }
                    _ => return Ok(None),
                }
            }
            Ok(Some(Pushdown {
                sql: Some(format!("({})", parts.join(" OR "))),
                needs_refilter: false,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_equality_pushes_down() {
        let p = Predicate::Compare(CompareOp::Eq, Expr::Column("id".into()), Expr::Literal(SqlValue::Int(5)));
        let result = lower(&p).unwrap();
        assert_eq!(result.sql.unwrap(), "[id] = 5");
        assert!(!result.needs_refilter);
    }

    #[test]
    fn and_drops_unsupported_child_and_flags_refilter() {
        let supported = Predicate::IsNull(Expr::Column("a".into()));
        let unsupported = Predicate::Compare(
            CompareOp::Eq,
            Expr::Call("unknown_fn".into(), vec![Expr::Column("b".into())]),
            Expr::Literal(SqlValue::Int(1)),
        );
        let p = Predicate::And(vec![supported, unsupported]);
        let result = lower(&p).unwrap();
        assert_eq!(result.sql.unwrap(), "([a] IS NULL)");
        assert!(result.needs_refilter);
    }

    #[test]
    fn or_is_all_or_nothing() {
        let supported = Predicate::IsNull(Expr::Column("a".into()));
        let unsupported = Predicate::Compare(
            CompareOp::Eq,
            Expr::Call("unknown_fn".into(), vec![Expr::Column("b".into())]),
            Expr::Literal(SqlValue::Int(1)),
        );
        let p = Predicate::Or(vec![supported, unsupported]);
        let result = lower(&p).unwrap();
        assert!(result.sql.is_none());
        assert!(result.needs_refilter);
    }

    #[test]
    fn between_lowers_to_two_comparisons() {
        let p = Predicate::Between(Expr::Column("n".into()), SqlValue::Int(1), SqlValue::Int(10));
        let result = lower(&p).unwrap();
        assert_eq!(result.sql.unwrap(), "[n] >= 1 AND [n] <= 10");
    }

    #[test]
    fn in_with_empty_list_is_always_false() {
        let p = Predicate::In(Expr::Column("x".into()), vec![]);
        let result = lower(&p).unwrap();
        assert_eq!(result.sql.unwrap(), "1 = 0");
    }
}
