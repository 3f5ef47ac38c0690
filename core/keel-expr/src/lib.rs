//! Expression language for Keel.
//!
//! A small, side-effect-free language evaluated against a request
//! [`Environment`] (`record`, `old`, `related`, `user`, `action`, `now`).
//! Rules, state-machine guards, computed fields, and webhook conditions are
//! all written in it:
//!
//! ```
//! use keel_expr::{Environment, Evaluator};
//! use keel_types::{Record, Value};
//!
//! let mut record = Record::new();
//! record.insert("payment_amount", 150);
//! record.insert("total", 100);
//!
//! let evaluator = Evaluator::new(64);
//! let env = Environment::new(&record);
//! assert!(evaluator.evaluate_bool("payment_amount >= total", &env).unwrap());
//! assert_eq!(evaluator.evaluate("len('abc') + 1", &env).unwrap(), Value::Int(4));
//! ```
//!
//! Callers decide what a boolean result means: rules and webhook conditions
//! treat `true` as violated/fire, guards treat `true` as proceed.

mod ast;
mod cache;
mod error;
mod eval;
mod functions;
mod lexer;
mod parser;

pub use ast::{BinaryOp, Expr, UnaryOp};
pub use cache::Evaluator;
pub use error::{ExprError, ExprResult};
pub use eval::{evaluate, Environment, ROOTS};
pub use parser::{parse, MAX_DEPTH};
