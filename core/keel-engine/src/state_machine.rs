//! State-governed fields.
//!
//! A machine restricts how one field of an entity may change. A guard must
//! evaluate to `true` for its transition to proceed, the opposite polarity
//! of validation rules.

use crate::dispatch::TransitionNotice;
use crate::{EngineError, EngineResult};
use keel_expr::{Environment, Evaluator};
use keel_model::{Action, StateMachineDefinition, TransitionAction};
use keel_types::{Record, UserContext, Value};
use tracing::{debug, info, warn};

/// `set_field` value that resolves to the evaluation time.
const NOW: &str = "now";

/// What the completed transitions left to do after commit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionOutcome {
    /// `webhook`, `create_record` and `send_event` actions, in order.
    pub deferred: Vec<TransitionAction>,
    pub notices: Vec<TransitionNotice>,
}

/// Inputs shared by every machine of one request.
pub struct TransitionContext<'a> {
    pub entity: &'a str,
    pub action: Action,
    pub user: &'a UserContext,
    /// Fields the caller sent.
    pub payload: &'a Record,
    pub old: Option<&'a Record>,
    pub now: &'a str,
}

pub struct StateMachineEngine<'a> {
    evaluator: &'a Evaluator,
    admin_role: &'a str,
}

impl<'a> StateMachineEngine<'a> {
    pub fn new(evaluator: &'a Evaluator, admin_role: &'a str) -> Self {
        Self {
            evaluator,
            admin_role,
        }
    }

    /// Sets each machine's field to its initial state when a new record
    /// leaves it absent or nil.
    pub fn inject_initial(machines: &[StateMachineDefinition], record: &mut Record) {
        for machine in machines {
            if record.get(&machine.field).is_none_or(Value::is_null) {
                record.insert(machine.field.clone(), machine.initial.clone());
            }
        }
    }

    /// Validates and applies every machine's transition to `record`.
    /// Machines run independently in declaration order; the first failure
    /// ends the request.
    pub fn apply(
        &self,
        machines: &[StateMachineDefinition],
        ctx: &TransitionContext<'_>,
        record: &mut Record,
    ) -> EngineResult<TransitionOutcome> {
        let mut outcome = TransitionOutcome::default();
        for machine in machines {
            let Some((from, to)) = requested_change(machine, ctx, record)? else {
                continue;
            };
            self.transition(machine, ctx, record, &from, &to, &mut outcome)?;
        }
        Ok(outcome)
    }

    fn transition(
        &self,
        machine: &StateMachineDefinition,
        ctx: &TransitionContext<'_>,
        record: &mut Record,
        from: &str,
        to: &str,
        outcome: &mut TransitionOutcome,
    ) -> EngineResult<()> {
        let field = machine.field.as_str();
        let Some(transition) = machine.find_transition(from, to) else {
            warn!("Rejected transition of {}.{} from {} to {}", ctx.entity, field, from, to);
            return Err(EngineError::InvalidTransition {
                field: field.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        };

        if !transition.roles.is_empty()
            && !ctx.user.has_role(self.admin_role)
            && !ctx.user.has_any_role(&transition.roles)
        {
            warn!(
                "User {} may not move {}.{} from {} to {}",
                ctx.user.id, ctx.entity, field, from, to
            );
            return Err(EngineError::Forbidden(format!(
                "transition of `{field}` from `{from}` to `{to}` requires one of [{}]",
                transition.roles.join(", ")
            )));
        }

        if let Some(guard) = &transition.guard {
            let env = Environment::new(record)
                .with_old(ctx.old)
                .with_user(ctx.user)
                .with_action(ctx.action.as_str())
                .with_now(ctx.now);
            let reason = match self.evaluator.evaluate_bool(guard, &env) {
                Ok(true) => None,
                Ok(false) => Some(format!("`{guard}` is not true")),
                Err(e) => Some(e.to_string()),
            };
            if let Some(reason) = reason {
                warn!("Guard blocked {}.{} from {} to {}: {}", ctx.entity, field, from, to, reason);
                return Err(EngineError::GuardFailed {
                    field: field.to_string(),
                    from: from.to_string(),
                    to: to.to_string(),
                    reason,
                });
            }
        }

        for action in &transition.actions {
            match action {
                TransitionAction::SetField { field, value } => {
                    let value = match value {
                        Value::Text(s) if s == NOW => Value::Text(ctx.now.to_string()),
                        other => other.clone(),
                    };
                    record.insert(field.clone(), value);
                }
                deferred => outcome.deferred.push(deferred.clone()),
            }
        }

        info!("Transition {}.{}: {} -> {}", ctx.entity, field, from, to);
        outcome.notices.push(TransitionNotice {
            entity: ctx.entity.to_string(),
            field: field.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            record: record.clone(),
        });
        Ok(())
    }
}

/// The `(from, to)` pair this request asks for, or `None` when the field
/// does not change.
fn requested_change(
    machine: &StateMachineDefinition,
    ctx: &TransitionContext<'_>,
    record: &Record,
) -> EngineResult<Option<(String, String)>> {
    let field = machine.field.as_str();
    let (from, requested) = match ctx.action {
        Action::Create => (machine.initial.clone(), record.get(field)),
        Action::Update => {
            let Some(requested) = ctx.payload.get(field) else {
                return Ok(None);
            };
            let from = ctx
                .old
                .and_then(|old| old.get(field))
                .and_then(Value::as_str)
                .unwrap_or(&machine.initial)
                .to_string();
            (from, Some(requested))
        }
        Action::Read | Action::Delete => return Ok(None),
    };
    let to = match requested {
        None | Some(Value::Null) => {
            return Err(EngineError::validation(
                Some(field),
                "state_machine",
                format!("`{field}` cannot be cleared"),
            ));
        }
        Some(Value::Text(s)) => s.clone(),
        Some(other) => {
            return Err(EngineError::InvalidTransition {
                field: field.to_string(),
                from,
                to: other.to_string(),
            });
        }
    };
    if from == to {
        debug!(field, state = %to, "state unchanged");
        return Ok(None);
    }
    Ok(Some((from, to)))
}
