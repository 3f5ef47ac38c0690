//! Tree-walking evaluator.

use crate::ast::{BinaryOp, Expr, UnaryOp};
use crate::functions;
use crate::{ExprError, ExprResult};
use keel_types::{Record, UserContext, Value};
use std::cmp::Ordering;

/// Names that resolve to environment roots instead of record fields.
pub const ROOTS: [&str; 6] = ["record", "old", "related", "user", "action", "now"];

/// The values an expression can see.
///
/// `old` is nil on create and `related` is only populated when a rule asks
/// for related records.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    record: Value,
    old: Value,
    related: Value,
    user: Value,
    action: Value,
    now: Value,
}

impl Environment {
    pub fn new(record: &Record) -> Self {
        Self {
            record: Value::Object(record.clone()),
            ..Self::default()
        }
    }

    pub fn with_old(mut self, old: Option<&Record>) -> Self {
        self.old = old.map_or(Value::Null, |r| Value::Object(r.clone()));
        self
    }

    /// Related records keyed by relation name.
    pub fn with_related(mut self, related: Record) -> Self {
        self.related = Value::Object(related);
        self
    }

    pub fn with_user(mut self, user: &UserContext) -> Self {
        self.user = user.to_value();
        self
    }

    pub fn with_action(mut self, action: &str) -> Self {
        self.action = Value::Text(action.to_string());
        self
    }

    /// The evaluation time, already formatted as a stored timestamp.
    pub fn with_now(mut self, now: impl Into<String>) -> Self {
        self.now = Value::Text(now.into());
        self
    }

    pub(crate) fn now(&self) -> &Value {
        &self.now
    }

    fn root(&self, name: &str) -> Option<&Value> {
        match name {
            "record" => Some(&self.record),
            "old" => Some(&self.old),
            "related" => Some(&self.related),
            "user" => Some(&self.user),
            "action" => Some(&self.action),
            "now" => Some(&self.now),
            _ => None,
        }
    }
}

/// Evaluates a parsed expression.
pub fn evaluate(expr: &Expr, env: &Environment) -> ExprResult<Value> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Ident(name) => Ok(match env.root(name) {
            Some(v) => v.clone(),
            None => env
                .record
                .as_object()
                .and_then(|r| r.get(name))
                .cloned()
                .unwrap_or_default(),
        }),
        Expr::Member(target, field) => member(evaluate(target, env)?, field),
        Expr::Index(target, index) => {
            let target = evaluate(target, env)?;
            let index = evaluate(index, env)?;
            index_value(target, &index)
        }
        Expr::List(items) => items
            .iter()
            .map(|e| evaluate(e, env))
            .collect::<ExprResult<Vec<_>>>()
            .map(Value::List),
        Expr::Unary(UnaryOp::Not, inner) => Ok(Value::Bool(!evaluate(inner, env)?.is_truthy())),
        Expr::Unary(UnaryOp::Neg, inner) => match evaluate(inner, env)? {
            Value::Null => Ok(Value::Null),
            Value::Int(i) => Ok(i
                .checked_neg()
                .map_or(Value::Float(-(i as f64)), Value::Int)),
            Value::Float(f) => Ok(Value::Float(-f)),
            other => Err(ExprError::Type(format!("cannot negate {}", other.type_name()))),
        },
        Expr::Binary(BinaryOp::And, left, right) => {
            if !evaluate(left, env)?.is_truthy() {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(evaluate(right, env)?.is_truthy()))
        }
        Expr::Binary(BinaryOp::Or, left, right) => {
            if evaluate(left, env)?.is_truthy() {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(evaluate(right, env)?.is_truthy()))
        }
        Expr::Binary(op, left, right) => {
            let l = evaluate(left, env)?;
            let r = evaluate(right, env)?;
            binary(*op, l, r)
        }
        Expr::Call(name, args) => {
            let args = args
                .iter()
                .map(|e| evaluate(e, env))
                .collect::<ExprResult<Vec<_>>>()?;
            functions::call(name, args, env)
        }
    }
}

fn member(target: Value, field: &str) -> ExprResult<Value> {
    match target {
        Value::Null => Ok(Value::Null),
        Value::Object(record) => Ok(record.get(field).cloned().unwrap_or_default()),
        // `items.price` projects the field out of every element.
        Value::List(items) => items
            .into_iter()
            .map(|item| member(item, field))
            .collect::<ExprResult<Vec<_>>>()
            .map(Value::List),
        other => Err(ExprError::Type(format!(
            "cannot read `.{field}` of {}",
            other.type_name()
        ))),
    }
}

fn index_value(target: Value, index: &Value) -> ExprResult<Value> {
    match (target, index) {
        (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
        (Value::List(items), Value::Int(i)) => {
            let len = items.len() as i64;
            let at = if *i < 0 { len + i } else { *i };
            Ok(usize::try_from(at)
                .ok()
                .and_then(|at| items.into_iter().nth(at))
                .unwrap_or_default())
        }
        (Value::Object(record), Value::Text(key)) => {
            Ok(record.get(key).cloned().unwrap_or_default())
        }
        (target, index) => Err(ExprError::Type(format!(
            "cannot index {} with {}",
            target.type_name(),
            index.type_name()
        ))),
    }
}

fn binary(op: BinaryOp, l: Value, r: Value) -> ExprResult<Value> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(l.loose_eq(&r))),
        BinaryOp::Ne => Ok(Value::Bool(!l.loose_eq(&r))),
        BinaryOp::Lt => Ok(ordered(&l, &r, Ordering::is_lt)),
        BinaryOp::Le => Ok(ordered(&l, &r, Ordering::is_le)),
        BinaryOp::Gt => Ok(ordered(&l, &r, Ordering::is_gt)),
        BinaryOp::Ge => Ok(ordered(&l, &r, Ordering::is_ge)),
        BinaryOp::In => membership(&l, &r).map(Value::Bool),
        BinaryOp::NotIn => membership(&l, &r).map(|found| Value::Bool(!found)),
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            arithmetic(op, l, r)
        }
        BinaryOp::And => Ok(Value::Bool(l.is_truthy() && r.is_truthy())),
        BinaryOp::Or => Ok(Value::Bool(l.is_truthy() || r.is_truthy())),
    }
}

/// Ordering comparisons involving nil or mismatched types are false.
fn ordered(l: &Value, r: &Value, test: fn(Ordering) -> bool) -> Value {
    Value::Bool(l.compare(r).is_some_and(test))
}

fn membership(needle: &Value, haystack: &Value) -> ExprResult<bool> {
    match haystack {
        Value::Null => Ok(false),
        Value::List(items) => Ok(items.iter().any(|item| item.loose_eq(needle))),
        Value::Text(text) => match needle {
            Value::Text(sub) => Ok(text.contains(sub.as_str())),
            Value::Null => Ok(false),
            other => Err(ExprError::Type(format!(
                "cannot search string for {}",
                other.type_name()
            ))),
        },
        Value::Object(record) => Ok(needle.as_str().is_some_and(|k| record.contains_key(k))),
        other => Err(ExprError::Type(format!(
            "`in` needs a list, string, or object, found {}",
            other.type_name()
        ))),
    }
}

fn arithmetic(op: BinaryOp, l: Value, r: Value) -> ExprResult<Value> {
    match (op, l, r) {
        (_, Value::Null, _) | (_, _, Value::Null) => Ok(Value::Null),
        (BinaryOp::Add, Value::Text(a), Value::Text(b)) => Ok(Value::Text(a + &b)),
        (BinaryOp::Add, Value::List(mut a), Value::List(b)) => {
            a.extend(b);
            Ok(Value::List(a))
        }
        (op, Value::Int(a), Value::Int(b)) => int_arithmetic(op, a, b),
        (op, l, r) => match (l.as_f64(), r.as_f64()) {
            (Some(a), Some(b)) => float_arithmetic(op, a, b),
            _ => Err(ExprError::Type(format!(
                "cannot apply {op:?} to {} and {}",
                l.type_name(),
                r.type_name()
            ))),
        },
    }
}

fn int_arithmetic(op: BinaryOp, a: i64, b: i64) -> ExprResult<Value> {
    let checked = match op {
        BinaryOp::Add => a.checked_add(b),
        BinaryOp::Sub => a.checked_sub(b),
        BinaryOp::Mul => a.checked_mul(b),
        BinaryOp::Div => {
            if b == 0 {
                return Err(ExprError::DivisionByZero);
            }
            match a.checked_rem(b) {
                Some(0) => a.checked_div(b),
                Some(_) => return Ok(Value::Float(a as f64 / b as f64)),
                None => None,
            }
        }
        BinaryOp::Rem => {
            if b == 0 {
                return Err(ExprError::DivisionByZero);
            }
            // Only `i64::MIN % -1` wraps, and its remainder is exactly 0.
            Some(a.wrapping_rem(b))
        }
        _ => None,
    };
    match checked {
        Some(v) => Ok(Value::Int(v)),
        // Overflow widens to float.
        None => float_arithmetic(op, a as f64, b as f64),
    }
}

fn float_arithmetic(op: BinaryOp, a: f64, b: f64) -> ExprResult<Value> {
    let v = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div if b == 0.0 => return Err(ExprError::DivisionByZero),
        BinaryOp::Div => a / b,
        BinaryOp::Rem if b == 0.0 => return Err(ExprError::DivisionByZero),
        BinaryOp::Rem => a % b,
        other => return Err(ExprError::Type(format!("{other:?} is not arithmetic"))),
    };
    Ok(Value::Float(v))
}
