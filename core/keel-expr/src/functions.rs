//! Built-in functions.

use crate::eval::Environment;
use crate::{ExprError, ExprResult};
use keel_types::Value;

pub(crate) fn call(name: &str, args: Vec<Value>, env: &Environment) -> ExprResult<Value> {
    match name {
        "len" => {
            let [v] = exact(name, args)?;
            len(&v)
        }
        "count" => {
            let [v] = exact(name, args)?;
            match v {
                Value::Null => Ok(Value::Int(0)),
                Value::List(items) => Ok(Value::Int(items.iter().filter(|i| !i.is_null()).count() as i64)),
                other => Err(type_error(name, "a list", &other)),
            }
        }
        "is_nil" => {
            let [v] = exact(name, args)?;
            Ok(Value::Bool(v.is_null()))
        }
        "present" => {
            let [v] = exact(name, args)?;
            Ok(Value::Bool(present(&v)))
        }
        "sum" => sum(name, args),
        "abs" => {
            let [v] = exact(name, args)?;
            match v {
                Value::Null => Ok(Value::Null),
                Value::Int(i) => Ok(i.checked_abs().map_or(Value::Float((i as f64).abs()), Value::Int)),
                Value::Float(f) => Ok(Value::Float(f.abs())),
                other => Err(type_error(name, "a number", &other)),
            }
        }
        "round" => round(name, args),
        "lower" | "upper" => {
            let [v] = exact(name, args)?;
            match v {
                Value::Null => Ok(Value::Null),
                Value::Text(s) if name == "lower" => Ok(Value::Text(s.to_lowercase())),
                Value::Text(s) => Ok(Value::Text(s.to_uppercase())),
                other => Err(type_error(name, "a string", &other)),
            }
        }
        "contains" => {
            let [haystack, needle] = exact(name, args)?;
            match (haystack, needle) {
                (Value::Null, _) => Ok(Value::Bool(false)),
                (Value::List(items), needle) => {
                    Ok(Value::Bool(items.iter().any(|i| i.loose_eq(&needle))))
                }
                (Value::Text(s), Value::Text(sub)) => Ok(Value::Bool(s.contains(sub.as_str()))),
                (Value::Object(record), Value::Text(key)) => {
                    Ok(Value::Bool(record.contains_key(&key)))
                }
                (other, _) => Err(type_error(name, "a list, string, or object", &other)),
            }
        }
        "starts_with" => {
            let [text, prefix] = exact(name, args)?;
            match (text, prefix) {
                (Value::Null, _) => Ok(Value::Bool(false)),
                (Value::Text(s), Value::Text(p)) => Ok(Value::Bool(s.starts_with(p.as_str()))),
                (other, _) => Err(type_error(name, "strings", &other)),
            }
        }
        "coalesce" => Ok(args.into_iter().find(|v| !v.is_null()).unwrap_or_default()),
        "now" => {
            let [] = exact::<0>(name, args)?;
            Ok(env.now().clone())
        }
        other => Err(ExprError::UnknownFunction(other.to_string())),
    }
}

fn exact<const N: usize>(name: &str, args: Vec<Value>) -> ExprResult<[Value; N]> {
    let found = args.len();
    args.try_into().map_err(|_| ExprError::Arity {
        function: name.to_string(),
        expected: arity_label(N),
        found,
    })
}

fn arity_label(n: usize) -> &'static str {
    match n {
        0 => "0",
        1 => "1",
        2 => "2",
        _ => "several",
    }
}

fn type_error(function: &str, wanted: &str, found: &Value) -> ExprError {
    ExprError::Type(format!(
        "`{function}` expects {wanted}, found {}",
        found.type_name()
    ))
}

fn len(v: &Value) -> ExprResult<Value> {
    let n = match v {
        Value::Null => 0,
        Value::Text(s) => s.chars().count(),
        Value::List(items) => items.len(),
        Value::Object(record) => record.len(),
        other => return Err(type_error("len", "a string, list, or object", other)),
    };
    Ok(Value::Int(n as i64))
}

/// Non-nil, and non-empty for strings and collections.
fn present(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Text(s) => !s.trim().is_empty(),
        Value::List(items) => !items.is_empty(),
        Value::Object(record) => !record.is_empty(),
        _ => true,
    }
}

/// `sum(list)` or `sum(list_of_objects, "field")`. Nil elements are skipped.
fn sum(name: &str, args: Vec<Value>) -> ExprResult<Value> {
    let (list, field) = match args.len() {
        1 => {
            let [list] = exact(name, args)?;
            (list, None)
        }
        2 => {
            let [list, field] = exact(name, args)?;
            match field {
                Value::Text(f) => (list, Some(f)),
                other => return Err(type_error(name, "a field name", &other)),
            }
        }
        found => {
            return Err(ExprError::Arity {
                function: name.to_string(),
                expected: "1 or 2",
                found,
            })
        }
    };
    let items = match list {
        Value::Null => return Ok(Value::Int(0)),
        Value::List(items) => items,
        other => return Err(type_error(name, "a list", &other)),
    };

    let mut int_total: Option<i64> = Some(0);
    let mut float_total = 0.0;
    for item in items {
        let v = match &field {
            Some(f) => item.as_object().and_then(|r| r.get(f)).cloned().unwrap_or_default(),
            None => item,
        };
        match v {
            Value::Null => {}
            Value::Int(i) => {
                int_total = int_total.and_then(|t| t.checked_add(i));
                float_total += i as f64;
            }
            Value::Float(f) => {
                int_total = None;
                float_total += f;
            }
            other => return Err(type_error(name, "numbers", &other)),
        }
    }
    Ok(int_total.map_or(Value::Float(float_total), Value::Int))
}

/// `round(x)` to an integer or `round(x, digits)` to a float.
fn round(name: &str, args: Vec<Value>) -> ExprResult<Value> {
    let (value, digits) = match args.len() {
        1 => {
            let [v] = exact(name, args)?;
            (v, None)
        }
        2 => {
            let [v, d] = exact(name, args)?;
            match d {
                Value::Int(d) => (v, Some(d)),
                other => return Err(type_error(name, "integer digits", &other)),
            }
        }
        found => {
            return Err(ExprError::Arity {
                function: name.to_string(),
                expected: "1 or 2",
                found,
            })
        }
    };
    match (value, digits) {
        (Value::Null, _) => Ok(Value::Null),
        (Value::Int(i), _) => Ok(Value::Int(i)),
        (Value::Float(f), None) => Ok(Value::Int(f.round() as i64)),
        (Value::Float(f), Some(d)) => {
            let factor = 10f64.powi(d.clamp(-15, 15) as i32);
            Ok(Value::Float((f * factor).round() / factor))
        }
        (other, _) => Err(type_error(name, "a number", &other)),
    }
}
