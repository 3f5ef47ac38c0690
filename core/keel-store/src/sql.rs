use keel_types::Value;
use rusqlite::types::Value as SqlValue;

/// A parameterized SQL predicate. Placeholders are bare `?` so fragments can
/// be concatenated without renumbering.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlFragment {
    pub sql: String,
    pub params: Vec<Value>,
}

impl SqlFragment {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    /// A predicate that matches every row.
    pub fn always() -> Self {
        Self::new("1 = 1", Vec::new())
    }

    /// A predicate that matches no row.
    pub fn never() -> Self {
        Self::new("1 = 0", Vec::new())
    }

    /// Both predicates.
    pub fn and(self, other: SqlFragment) -> Self {
        let mut params = self.params;
        params.extend(other.params);
        Self::new(format!("({}) AND ({})", self.sql, other.sql), params)
    }

    /// Conjunction of all fragments; empty input matches everything.
    pub fn all(parts: impl IntoIterator<Item = SqlFragment>) -> Self {
        Self::join(parts, " AND ").unwrap_or_else(Self::always)
    }

    /// Disjunction of all fragments; empty input matches nothing.
    pub fn any(parts: impl IntoIterator<Item = SqlFragment>) -> Self {
        Self::join(parts, " OR ").unwrap_or_else(Self::never)
    }

    fn join(parts: impl IntoIterator<Item = SqlFragment>, sep: &str) -> Option<Self> {
        let mut sql = Vec::new();
        let mut params = Vec::new();
        for part in parts {
            sql.push(format!("({})", part.sql));
            params.extend(part.params);
        }
        if sql.is_empty() {
            return None;
        }
        Some(Self::new(sql.join(sep), params))
    }

    pub(crate) fn bound(&self) -> Vec<SqlValue> {
        self.params.iter().map(to_sql_value).collect()
    }
}

/// Converts a field value into a SQLite value. Booleans are stored as 0/1,
/// lists and objects as JSON text.
pub fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Int(i) => SqlValue::Integer(*i),
        Value::Float(f) => SqlValue::Real(*f),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::List(_) | Value::Object(_) => SqlValue::Text(value.to_json().to_string()),
    }
}

/// Double-quotes an identifier for SQLite.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_combinations() {
        assert_eq!(SqlFragment::all(Vec::new()), SqlFragment::always());
        assert_eq!(SqlFragment::any(Vec::new()), SqlFragment::never());
    }

    #[test]
    fn params_follow_sql_order() {
        let a = SqlFragment::new("\"a\" = ?", vec![Value::Int(1)]);
        let b = SqlFragment::new("\"b\" IN (?, ?)", vec![Value::Int(2), Value::Int(3)]);
        let both = SqlFragment::any([a, b]);
        assert_eq!(both.sql, "(\"a\" = ?) OR (\"b\" IN (?, ?))");
        assert_eq!(both.params, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
    }

    #[test]
    fn quoting_escapes_quotes() {
        assert_eq!(quote_ident("items"), "\"items\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
