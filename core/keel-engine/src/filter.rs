//! Compiles declarative conditions into a parameterized SQL predicate and an
//! equivalent in-memory predicate.
//!
//! Both forms agree on nil handling: `eq nil` is `IS NULL`, `neq nil` is
//! `IS NOT NULL`, and every other comparison against a nil column is false.
//! `in []` matches nothing and `not_in []` matches everything.

use crate::{EngineError, EngineResult};
use keel_model::{Condition, EntityDefinition, FilterOperator};
use keel_store::{quote_ident, SqlFragment};
use keel_types::{Record, UserContext, Value};

/// Prefix of condition values that refer to the caller.
const USER_PREFIX: &str = "$user.";

/// The conjunction of a list of conditions, in both forms.
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    sql: SqlFragment,
    conditions: Vec<Condition>,
}

impl CompiledFilter {
    pub fn sql(&self) -> &SqlFragment {
        &self.sql
    }

    pub fn into_sql(self) -> SqlFragment {
        self.sql
    }

    /// Evaluates the conditions against a record. Missing fields are nil.
    pub fn matches(&self, record: &Record) -> bool {
        self.conditions.iter().all(|c| {
            let actual = record.get(&c.field).unwrap_or(&Value::Null);
            condition_holds(c.operator, actual, &c.value)
        })
    }
}

/// Compiles `conditions` on `entity` for `user`. Field names must be columns
/// of the entity.
pub fn compile(
    entity: &EntityDefinition,
    conditions: &[Condition],
    user: &UserContext,
) -> EngineResult<CompiledFilter> {
    let mut resolved = Vec::with_capacity(conditions.len());
    let mut parts = Vec::with_capacity(conditions.len());
    for condition in conditions {
        if !entity.has_column(&condition.field) {
            return Err(EngineError::UnknownField {
                entity: entity.name.clone(),
                field: condition.field.clone(),
            });
        }
        let value = resolve_value(&condition.value, user);
        parts.push(condition_sql(&condition.field, condition.operator, &value)?);
        resolved.push(Condition {
            field: condition.field.clone(),
            operator: condition.operator,
            value,
        });
    }
    Ok(CompiledFilter {
        sql: SqlFragment::all(parts),
        conditions: resolved,
    })
}

/// Substitutes `$user.<path>` values with the caller's attributes.
fn resolve_value(value: &Value, user: &UserContext) -> Value {
    match value {
        Value::Text(s) => match s.strip_prefix(USER_PREFIX) {
            Some(path) => user
                .to_value()
                .as_object()
                .and_then(|u| u.get_path(path))
                .cloned()
                .unwrap_or_default(),
            None => value.clone(),
        },
        Value::List(items) => Value::List(items.iter().map(|v| resolve_value(v, user)).collect()),
        other => other.clone(),
    }
}

fn as_items(value: &Value) -> Vec<Value> {
    match value {
        Value::List(items) => items.iter().filter(|v| !v.is_null()).cloned().collect(),
        Value::Null => Vec::new(),
        other => vec![other.clone()],
    }
}

fn condition_sql(field: &str, op: FilterOperator, value: &Value) -> EngineResult<SqlFragment> {
    let col = quote_ident(field);
    let fragment = match op {
        FilterOperator::Eq if value.is_null() => SqlFragment::new(format!("{col} IS NULL"), vec![]),
        FilterOperator::Neq if value.is_null() => {
            SqlFragment::new(format!("{col} IS NOT NULL"), vec![])
        }
        FilterOperator::Eq => SqlFragment::new(format!("{col} = ?"), vec![value.clone()]),
        FilterOperator::Neq => SqlFragment::new(format!("{col} <> ?"), vec![value.clone()]),
        FilterOperator::Gt | FilterOperator::Gte | FilterOperator::Lt | FilterOperator::Lte
            if value.is_null() =>
        {
            SqlFragment::never()
        }
        FilterOperator::Gt => SqlFragment::new(format!("{col} > ?"), vec![value.clone()]),
        FilterOperator::Gte => SqlFragment::new(format!("{col} >= ?"), vec![value.clone()]),
        FilterOperator::Lt => SqlFragment::new(format!("{col} < ?"), vec![value.clone()]),
        FilterOperator::Lte => SqlFragment::new(format!("{col} <= ?"), vec![value.clone()]),
        FilterOperator::In | FilterOperator::NotIn => {
            let items = as_items(value);
            match (op, items.is_empty()) {
                (FilterOperator::In, true) => SqlFragment::never(),
                (_, true) => SqlFragment::always(),
                (_, false) => {
                    let keyword = if op == FilterOperator::In { "IN" } else { "NOT IN" };
                    let marks = vec!["?"; items.len()].join(", ");
                    SqlFragment::new(format!("{col} {keyword} ({marks})"), items)
                }
            }
        }
        FilterOperator::Like => match value {
            Value::Text(_) => SqlFragment::new(format!("{col} LIKE ?"), vec![value.clone()]),
            other => {
                return Err(EngineError::InvalidPayload(format!(
                    "`like` on `{field}` needs a string pattern, found {}",
                    other.type_name()
                )));
            }
        },
    };
    Ok(fragment)
}

fn condition_holds(op: FilterOperator, actual: &Value, expected: &Value) -> bool {
    match op {
        FilterOperator::Eq if expected.is_null() => actual.is_null(),
        FilterOperator::Neq if expected.is_null() => !actual.is_null(),
        _ if actual.is_null() => op == FilterOperator::NotIn && as_items(expected).is_empty(),
        FilterOperator::Eq => actual.loose_eq(expected),
        FilterOperator::Neq => !actual.loose_eq(expected),
        FilterOperator::Gt => actual.compare(expected).is_some_and(|o| o.is_gt()),
        FilterOperator::Gte => actual.compare(expected).is_some_and(|o| o.is_ge()),
        FilterOperator::Lt => actual.compare(expected).is_some_and(|o| o.is_lt()),
        FilterOperator::Lte => actual.compare(expected).is_some_and(|o| o.is_le()),
        FilterOperator::In => as_items(expected).iter().any(|v| v.loose_eq(actual)),
        FilterOperator::NotIn => !as_items(expected).iter().any(|v| v.loose_eq(actual)),
        FilterOperator::Like => match (actual, expected) {
            (Value::Text(text), Value::Text(pattern)) => like_match(text, pattern),
            _ => false,
        },
    }
}

/// SQL `LIKE`: `%` matches any run, `_` one character, ASCII letters
/// compare case-insensitively.
pub fn like_match(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pat: Vec<char> = pattern.chars().collect();
    let mut ti = 0usize;
    let mut pi = 0usize;
    let mut star_pi: Option<usize> = None;
    let mut star_ti = 0usize;

    while ti < text.len() {
        if pi < pat.len() && pat[pi] == '%' {
            star_pi = Some(pi);
            pi += 1;
            star_ti = ti;
            continue;
        }
        if pi < pat.len() && (pat[pi] == '_' || pat[pi].eq_ignore_ascii_case(&text[ti])) {
            ti += 1;
            pi += 1;
            continue;
        }
        if let Some(saved_pi) = star_pi {
            pi = saved_pi + 1;
            star_ti += 1;
            ti = star_ti;
            continue;
        }
        return false;
    }

    while pi < pat.len() && pat[pi] == '%' {
        pi += 1;
    }
    pi == pat.len()
}
