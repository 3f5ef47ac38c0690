use crate::ast::Expr;
use crate::eval::{evaluate, Environment};
use crate::parser::parse;
use crate::{ExprError, ExprResult};
use keel_types::Value;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Parses and evaluates expression text, keeping parsed trees in an LRU
/// cache keyed by the source string.
///
/// Shared across requests; parse failures are not cached.
pub struct Evaluator {
    cache: Mutex<LruCache<String, Arc<Expr>>>,
}

impl Evaluator {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Returns the parsed tree for `src`, parsing it on a cache miss.
    pub fn compile(&self, src: &str) -> ExprResult<Arc<Expr>> {
        if let Some(hit) = self.lock().get(src) {
            return Ok(Arc::clone(hit));
        }
        debug!(expression = src, "parsing expression");
        let parsed = Arc::new(parse(src)?);
        self.lock().put(src.to_string(), Arc::clone(&parsed));
        Ok(parsed)
    }

    pub fn evaluate(&self, src: &str, env: &Environment) -> ExprResult<Value> {
        let expr = self.compile(src)?;
        evaluate(&expr, env)
    }

    /// Evaluates `src` as a condition. Nil counts as false; any other
    /// non-boolean result is an error.
    pub fn evaluate_bool(&self, src: &str, env: &Environment) -> ExprResult<bool> {
        match self.evaluate(src, env)? {
            Value::Bool(b) => Ok(b),
            Value::Null => Ok(false),
            other => Err(ExprError::NotBoolean(other.type_name())),
        }
    }

    /// Number of cached trees.
    pub fn cached(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<String, Arc<Expr>>> {
        // The cache holds no invariants a panicking holder could break.
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evaluator")
            .field("cached", &self.cached())
            .finish()
    }
}
