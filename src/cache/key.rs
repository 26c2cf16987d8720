//! Cache keys and table dependency extraction.

use once_cell::sync::Lazy;
use regex::Regex;

use super::CacheError;
use crate::value::Value;

/// Normalized statement text plus the canonical encoding of its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    sql: String,
    params: String,
}

impl CacheKey {
    pub fn new(sql: &str, params: &[Value]) -> Result<Self, CacheError> {
        for (index, param) in params.iter().enumerate() {
            if let Value::Float(f) = param {
                if !f.is_finite() {
                    return Err(CacheError::Unkeyable {
                        index,
                        reason: format!("non-finite float {f}"),
                    });
                }
            }
        }

        Ok(Self {
            sql: normalize_sql(sql),
            params: serde_json::to_string(params)?,
        })
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

/// Collapse runs of whitespace outside quoted literals to a single space and
/// trim both ends.
pub fn normalize_sql(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut quote: Option<char> = None;
    let mut pending_space = false;

    for c in sql.chars() {
        match quote {
            Some(q) => {
                out.push(c);
                if c == q {
                    quote = None;
                }
            }
            None if c.is_whitespace() => pending_space = true,
            None => {
                if pending_space && !out.is_empty() {
                    out.push(' ');
                }
                pending_space = false;
                if c == '\'' || c == '"' {
                    quote = Some(c);
                }
                out.push(c);
            }
        }
    }
    out
}

const TABLE_NAME: &str = r#"(?:"[^"]+"|[a-z_][a-z0-9_$]*)(?:\s*\.\s*(?:"[^"]+"|[a-z_][a-z0-9_$]*))*"#;

static TABLE_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!(r"(?i)\b(from|join)\s+({TABLE_NAME})")).expect("valid table pattern"));

/// A further item of a comma separated FROM list.
static LIST_ITEM: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!(r"(?i),\s*({TABLE_NAME})")).expect("valid list pattern"));

/// First clause that can follow a FROM list.
static FROM_END: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:where|group|order|limit|offset|having|union|intersect|except|window|returning|for)\b")
        .expect("valid clause pattern")
});

/// Canonical form of a table name: unquoted, schema qualifier dropped,
/// lowercase.
pub fn normalize_table(name: &str) -> String {
    let last = name.rsplit('.').next().unwrap_or(name);
    last.trim().trim_matches('"').to_lowercase()
}

/// Tables named in FROM lists and JOIN clauses, normalized and
/// deduplicated.
///
/// Subqueries in FROM (`FROM (SELECT ...)`) are skipped; the tables inside
/// them are picked up by their own FROM clauses. Every `, name` up to the
/// end of a FROM list counts as a table, so an expression such as
/// `ON f(a, b)` may add a spurious name. Extra names only cost extra
/// invalidations.
pub fn extract_tables(sql: &str) -> Vec<String> {
    let mut tables: Vec<String> = Vec::new();
    let mut add = |name: &str| {
        let table = normalize_table(name);
        if !table.is_empty() && !tables.contains(&table) {
            tables.push(table);
        }
    };

    for caps in TABLE_REF.captures_iter(sql) {
        add(&caps[2]);
        if !caps[1].eq_ignore_ascii_case("from") {
            continue;
        }
        let Some(matched) = caps.get(0) else { continue };
        let rest = &sql[matched.end()..];
        let list = FROM_END.find(rest).map_or(rest, |end| &rest[..end.start()]);
        for item in LIST_ITEM.captures_iter(list) {
            add(&item[1]);
        }
    }
    tables
}
