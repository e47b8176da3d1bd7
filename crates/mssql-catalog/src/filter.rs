//! Convert a name-matching regex into a SQL predicate when the shape allows,
//! so discovery queries can push the filter to the server instead of pulling
//! every schema/table name down to filter client-side.

/// The outcome of attempting to convert a regex into a server-side predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pushdown {
    /// Convertible: a `column = value` equality.
    Equals(String),
    /// Convertible: a `column LIKE pattern` prefix match (pattern already escaped).
    Like(String),
    /// Convertible: a `column IN (v1, v2, ...)` alternation.
    In(Vec<String>),
    /// Not convertible; the caller must run an unrestricted discovery query
    /// and filter the results client-side with the original regex.
    ClientSide,
}

/// Escape `%`, `_`, and `[` for use inside a `LIKE` pattern, and append the
/// SQL Server `ESCAPE` clause character (`\`) convention used by callers.
fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '%' | '_' | '[' | '\\' => {
                out.push('\\');
                out.push(ch);
            }
            other => out.push(other),
        }
    }
    out
}

/// Escape a single-quote for use inside a SQL string literal.
fn escape_literal(raw: &str) -> String {
    raw.replace('\'', "''")
}

/// Classify a regex pattern's shape and produce a pushdown strategy.
///
/// Recognizes three shapes:
/// - Exact match: `^name$` (no other metacharacters) -> `Equals`.
/// - Prefix match: `^prefix` with no other metacharacters after it -> `Like` (prefix%).
/// - Top-level alternation: `^(a|b|c)$` where each alternative is a literal -> `In`.
///
/// Anything else (character classes, quantifiers, nested groups, unanchored
/// patterns) falls back to `ClientSide`.
#[must_use]
pub fn classify(pattern: &str) -> Pushdown {
    if let Some(inner) = exact_match(pattern) {
        return Pushdown::Equals(escape_literal(&inner));
    }
    if let Some(alts) = alternation_match(pattern) {
        return Pushdown::In(alts.into_iter().map(|a| escape_literal(&a)).collect());
    }
    if let Some(prefix) = prefix_match(pattern) {
        return Pushdown::Like(format!("{}%", escape_like(&prefix)));
    }
    Pushdown::ClientSide
}

fn is_plain_literal(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '$' || c == '#')
}

/// `^literal$`
fn exact_match(pattern: &str) -> Option<String> {
    let body = pattern.strip_prefix('^')?.strip_suffix('$')?;
    is_plain_literal(body).then(|| body.to_string())
}

/// `^(a|b|c)$` where each alternative is a plain literal.
fn alternation_match(pattern: &str) -> Option<Vec<String>> {
    let body = pattern.strip_prefix('^')?.strip_suffix('$')?;
    let inner = body.strip_prefix('(')?.strip_suffix(')')?;
    if inner.contains('(') || inner.contains(')') {
        return None;
    }
    let alts: Vec<String> = inner.split('|').map(str::to_string).collect();
    if alts.len() >= 2 && alts.iter().all(|a| is_plain_literal(a)) {
        Some(alts)
    } else {
        None
    }
}

/// `^prefix` with no other anchors/metacharacters in `prefix`.
fn prefix_match(pattern: &str) -> Option<String> {
    let body = pattern.strip_prefix('^')?;
    if body.is_empty() || body.ends_with('$') {
        return None;
    }
    is_plain_literal(body).then(|| body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_becomes_equals() {
        assert_eq!(classify("^widgets$"), Pushdown::Equals("widgets".to_string()));
    }

    #[test]
    fn prefix_becomes_like() {
        assert_eq!(classify("^stg_"), Pushdown::Like("stg\\_%".to_string()));
    }

    #[test]
    fn alternation_becomes_in() {
        assert_eq!(
            classify("^(foo|bar|baz)$"),
            Pushdown::In(vec!["foo".into(), "bar".into(), "baz".into()])
        );
    }

    #[test]
    fn unsupported_shapes_fall_back_client_side() {
        assert_eq!(classify("^[a-z]+$"), Pushdown::ClientSide);
        assert_eq!(classify("foo.*bar"), Pushdown::ClientSide);
        assert_eq!(classify("^a{2,3}$"), Pushdown::ClientSide);
    }

    #[test]
    fn like_escapes_wildcards() {
        assert_eq!(classify("^100%_done"), Pushdown::ClientSide);
    }
}
