//! Three-phase rule evaluation: field rules, expression rules, computed
//! rules.
//!
//! Field and expression rules are violated when their check fails (for
//! expressions: when the expression is `true`). Computed rules write their
//! result into the record. Rules arrive from the registry already sorted by
//! phase and priority.

use crate::filter;
use crate::{EngineError, EngineResult, ErrorDetail};
use keel_expr::{Environment, Evaluator};
use keel_model::{
    Action, ComputedRule, Condition, EntityDefinition, ExpressionRule, FieldOperator, FieldRule,
    Hook, RelationDefinition, Registry, Rule, RuleDefinition,
};
use keel_store::{quote_ident, rows, SqlFragment, Store};
use keel_types::{Record, UserContext, Value};
use tracing::debug;

/// Loads related rows for `related_load`.
pub trait RelatedSource {
    /// Live rows reachable from `parent` through `relation` that satisfy
    /// `filter`.
    fn load(
        &self,
        relation: &RelationDefinition,
        parent: &Record,
        filter: &[Condition],
    ) -> EngineResult<Vec<Record>>;
}

/// [`RelatedSource`] reading through the store, outside any transaction.
pub struct StoreRelatedSource<'a> {
    store: &'a Store,
    registry: &'a Registry,
    user: &'a UserContext,
}

impl<'a> StoreRelatedSource<'a> {
    pub fn new(store: &'a Store, registry: &'a Registry, user: &'a UserContext) -> Self {
        Self {
            store,
            registry,
            user,
        }
    }
}

impl RelatedSource for StoreRelatedSource<'_> {
    fn load(
        &self,
        relation: &RelationDefinition,
        parent: &Record,
        filter: &[Condition],
    ) -> EngineResult<Vec<Record>> {
        let target = self.registry.require_entity(&relation.target)?;
        let compiled = filter::compile(target, filter, self.user)?;
        let parent_value = match parent.get(&relation.source_key) {
            Some(v) if !v.is_null() => v.clone(),
            // Nothing stored yet (e.g. on create): nothing related.
            _ => return Ok(Vec::new()),
        };

        self.store.read(|conn| {
            if let Some(join) = &relation.join_table {
                let mut out = Vec::new();
                for key in rows::linked_targets(conn, join, &parent_value)? {
                    if let Some(row) = rows::find(conn, target, &key)? {
                        if compiled.matches(&row) {
                            out.push(row);
                        }
                    }
                }
                Ok(out)
            } else {
                let scope = SqlFragment::new(
                    format!("{} = ?", quote_ident(&relation.target_key)),
                    vec![parent_value],
                )
                .and(compiled.into_sql());
                Ok(rows::select(conn, target, Some(&scope))?)
            }
        })
    }
}

/// Inputs to one hook evaluation.
pub struct RuleContext<'a> {
    pub entity: &'a EntityDefinition,
    pub action: Action,
    pub user: &'a UserContext,
    /// The stored row before this request; `None` on create.
    pub old: Option<&'a Record>,
    /// Fields the caller sent. Field rules look only here.
    pub payload: &'a Record,
    pub now: &'a str,
}

/// The record after computed rules, and every violation found.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleOutcome {
    pub record: Record,
    pub violations: Vec<ErrorDetail>,
}

impl RuleOutcome {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }
}

pub struct RuleEngine<'a> {
    registry: &'a Registry,
    evaluator: &'a Evaluator,
    related: &'a dyn RelatedSource,
}

/// Prefetched rows, one entry per distinct (relation, filter).
type Prefetched = Vec<(String, Vec<Condition>, Vec<Record>)>;

impl<'a> RuleEngine<'a> {
    pub fn new(registry: &'a Registry, evaluator: &'a Evaluator, related: &'a dyn RelatedSource) -> Self {
        Self {
            registry,
            evaluator,
            related,
        }
    }

    /// Runs every active rule of `hook` against `record`.
    pub fn run_hooks(&self, hook: Hook, ctx: &RuleContext<'_>, record: Record) -> EngineResult<RuleOutcome> {
        let mut outcome = RuleOutcome {
            record,
            violations: Vec::new(),
        };
        let mut prefetched: Prefetched = Vec::new();

        for rule in self.registry.rules(&ctx.entity.name, hook) {
            let violation = match &rule.definition {
                RuleDefinition::Field(def) => field_violation(rule, def, ctx),
                RuleDefinition::Expression(def) => {
                    self.expression_violation(rule, def, ctx, &outcome.record, &mut prefetched)?
                }
                RuleDefinition::Computed(def) => {
                    self.compute(rule, def, ctx, &mut outcome.record)
                }
            };
            if let Some(detail) = violation {
                debug!(rule = %rule.name, entity = %ctx.entity.name, "rule violated");
                outcome.violations.push(detail);
                if rule.stop_on_fail {
                    break;
                }
            }
        }
        Ok(outcome)
    }

    fn environment(&self, ctx: &RuleContext<'_>, record: &Record) -> Environment {
        Environment::new(record)
            .with_old(ctx.old)
            .with_user(ctx.user)
            .with_action(ctx.action.as_str())
            .with_now(ctx.now)
    }

    fn expression_violation(
        &self,
        rule: &Rule,
        def: &ExpressionRule,
        ctx: &RuleContext<'_>,
        record: &Record,
        prefetched: &mut Prefetched,
    ) -> EngineResult<Option<ErrorDetail>> {
        let mut related = Record::new();
        for load in &def.related_load {
            let relation = self
                .registry
                .relation(&ctx.entity.name, &load.relation)
                .ok_or_else(|| {
                    EngineError::Internal(format!(
                        "rule `{}` loads unknown relation `{}`",
                        rule.name, load.relation
                    ))
                })?;
            let cached = prefetched
                .iter()
                .find(|(name, filter, _)| *name == load.relation && *filter == load.filter);
            let rows = match cached {
                Some((_, _, rows)) => rows.clone(),
                None => {
                    let rows = self.related.load(relation, record, &load.filter)?;
                    prefetched.push((load.relation.clone(), load.filter.clone(), rows.clone()));
                    rows
                }
            };
            related.insert(
                load.relation.clone(),
                Value::List(rows.into_iter().map(Value::Object).collect()),
            );
        }

        let env = self.environment(ctx, record).with_related(related);
        let field = def.field.as_deref();
        Ok(match self.evaluator.evaluate_bool(&def.expression, &env) {
            Ok(false) => None,
            Ok(true) => Some(ErrorDetail::new(field, &rule.name, &def.message)),
            Err(e) => Some(ErrorDetail::new(
                field,
                &rule.name,
                format!("rule `{}` could not be evaluated: {e}", rule.name),
            )),
        })
    }

    fn compute(
        &self,
        rule: &Rule,
        def: &ComputedRule,
        ctx: &RuleContext<'_>,
        record: &mut Record,
    ) -> Option<ErrorDetail> {
        let env = self.environment(ctx, record);
        let value = match self.evaluator.evaluate(&def.expression, &env) {
            Ok(value) => value,
            Err(e) => {
                return Some(ErrorDetail::new(
                    Some(&def.field),
                    &rule.name,
                    format!("rule `{}` could not be evaluated: {e}", rule.name),
                ));
            }
        };
        let coerced = match ctx.entity.field(&def.field) {
            Some(spec) => spec.coerce(value),
            None => Ok(value),
        };
        match coerced {
            Ok(value) => {
                record.insert(def.field.clone(), value);
                None
            }
            Err(message) => Some(ErrorDetail::new(
                Some(&def.field),
                &rule.name,
                format!("computed `{}` {message}", def.field),
            )),
        }
    }
}

/// Checks one field rule against the payload.
fn field_violation(rule: &Rule, def: &FieldRule, ctx: &RuleContext<'_>) -> Option<ErrorDetail> {
    let field = def.field.as_str();
    let Some(actual) = ctx.payload.get(field) else {
        if def.operator == FieldOperator::Required && ctx.action == Action::Create {
            return Some(violation(rule, def, format!("`{field}` is required")));
        }
        return None;
    };
    if actual.is_null() {
        return (def.operator == FieldOperator::Required)
            .then(|| violation(rule, def, format!("`{field}` is required")));
    }

    let failure = match def.operator {
        FieldOperator::Required => None,
        FieldOperator::Min | FieldOperator::Max => match (actual.as_f64(), def.value.as_f64()) {
            (Some(a), Some(bound)) if def.operator == FieldOperator::Min && a < bound => {
                Some(format!("`{field}` must be at least {}", def.value))
            }
            (Some(a), Some(bound)) if def.operator == FieldOperator::Max && a > bound => {
                Some(format!("`{field}` must be at most {}", def.value))
            }
            (Some(_), Some(_)) => None,
            _ => Some(format!("`{field}` must be a number")),
        },
        FieldOperator::MinLength | FieldOperator::MaxLength => {
            let len = match actual {
                Value::Text(s) => Some(s.chars().count()),
                Value::List(items) => Some(items.len()),
                _ => None,
            };
            let bound = def.value.as_i64().and_then(|b| usize::try_from(b).ok());
            match (len, bound) {
                (Some(len), Some(b)) if def.operator == FieldOperator::MinLength && len < b => {
                    Some(format!("`{field}` must have at least {b} characters"))
                }
                (Some(len), Some(b)) if def.operator == FieldOperator::MaxLength && len > b => {
                    Some(format!("`{field}` must have at most {b} characters"))
                }
                (Some(_), Some(_)) => None,
                (None, _) => Some(format!("`{field}` has no length")),
                (_, None) => Some(format!("rule `{}` needs a non-negative length", rule.name)),
            }
        }
        FieldOperator::Pattern => match (actual.as_str(), def.value.as_str()) {
            (Some(text), Some(pattern)) => match regex_lite::Regex::new(pattern) {
                Ok(re) if re.is_match(text) => None,
                Ok(_) => Some(format!("`{field}` does not match `{pattern}`")),
                Err(e) => Some(format!("rule `{}` has an invalid pattern: {e}", rule.name)),
            },
            (None, _) => Some(format!("`{field}` must be a string")),
            (_, None) => Some(format!("rule `{}` needs a string pattern", rule.name)),
        },
        FieldOperator::In | FieldOperator::NotIn => {
            let options = def.value.as_list().unwrap_or_default();
            let found = options.iter().any(|o| o.loose_eq(actual));
            match (def.operator, found) {
                (FieldOperator::In, false) => Some(format!("`{field}` must be one of {}", def.value)),
                (FieldOperator::NotIn, true) => Some(format!("`{field}` must not be {actual}")),
                _ => None,
            }
        }
    };
    failure.map(|message| violation(rule, def, message))
}

/// A detail carrying the rule's custom message when it has one.
fn violation(rule: &Rule, def: &FieldRule, fallback: String) -> ErrorDetail {
    let message = def.message.clone().unwrap_or(fallback);
    ErrorDetail::new(Some(&def.field), &rule.name, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_model::{KeyGeneration, PrimaryKeySpec};

    fn rule(op: FieldOperator, value: Value) -> Rule {
        Rule {
            name: "r".into(),
            entity: "note".into(),
            hook: Hook::BeforeWrite,
            definition: RuleDefinition::Field(FieldRule {
                field: "title".into(),
                operator: op,
                value,
                message: None,
            }),
            priority: 0,
            active: true,
            stop_on_fail: false,
        }
    }

    fn check(op: FieldOperator, value: Value, payload: Record, action: Action) -> Option<ErrorDetail> {
        let entity = EntityDefinition {
            name: "note".into(),
            table: "notes".into(),
            primary_key: PrimaryKeySpec {
                field: "id".into(),
                generation: KeyGeneration::Auto,
            },
            fields: vec![keel_model::FieldSpec::string("title")],
            soft_delete: None,
        };
        let user = UserContext::new("u", ["staff"]);
        let ctx = RuleContext {
            entity: &entity,
            action,
            user: &user,
            old: None,
            payload: &payload,
            now: "2026-01-01T00:00:00.000Z",
        };
        let r = rule(op, value);
        let RuleDefinition::Field(def) = &r.definition else {
            unreachable!()
        };
        field_violation(&r, def, &ctx)
    }

    fn title(v: impl Into<Value>) -> Record {
        let mut r = Record::new();
        r.insert("title", v);
        r
    }

    #[test]
    fn required_only_on_create_when_absent() {
        assert!(check(FieldOperator::Required, Value::Null, Record::new(), Action::Create).is_some());
        assert!(check(FieldOperator::Required, Value::Null, Record::new(), Action::Update).is_none());
        assert!(check(FieldOperator::Required, Value::Null, title(Value::Null), Action::Update).is_some());
    }

    #[test]
    fn absent_fields_skip_other_operators() {
        assert!(check(FieldOperator::MinLength, Value::Int(3), Record::new(), Action::Create).is_none());
    }

    #[test]
    fn length_counts_chars() {
        assert!(check(FieldOperator::MaxLength, Value::Int(3), title("héé"), Action::Create).is_none());
        assert!(check(FieldOperator::MaxLength, Value::Int(2), title("héé"), Action::Create).is_some());
    }

    #[test]
    fn pattern_and_membership() {
        assert!(check(FieldOperator::Pattern, "^[A-Z]".into(), title("Abc"), Action::Create).is_none());
        assert!(check(FieldOperator::Pattern, "^[A-Z]".into(), title("abc"), Action::Create).is_some());
        assert!(check(FieldOperator::Pattern, "(".into(), title("abc"), Action::Create).is_some());

        let opts = Value::List(vec!["a".into(), "b".into()]);
        assert!(check(FieldOperator::In, opts.clone(), title("a"), Action::Create).is_none());
        assert!(check(FieldOperator::NotIn, opts, title("a"), Action::Create).is_some());
    }

    #[test]
    fn min_requires_a_number() {
        let detail = check(FieldOperator::Min, Value::Int(1), title("x"), Action::Create).unwrap();
        assert_eq!(detail.field.as_deref(), Some("title"));
        assert_eq!(detail.rule, "r");
    }
}
