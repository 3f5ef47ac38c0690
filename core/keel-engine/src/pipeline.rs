//! The per-request write pipeline.
//!
//! Order of a mutating request:
//! 1. permission gate (roles first, then conditions on the stored row)
//! 2. load the stored row for update/delete and merge the payload onto it
//! 3. state machines
//! 4. defaults, required fields, then the three rule phases
//! 5. one transaction: execute the write plan, pass `before_*` webhooks
//!    through the gate, read the written tree back, commit
//! 6. after commit, hand `after_*` webhooks, transition notices and
//!    deferred actions to the follow-up sink
//!
//! Every failure before step 5 leaves the store untouched; every failure in
//! step 5 rolls the transaction back and nothing is enqueued.

use crate::dispatch::{
    changed_fields, select_webhooks, AllowAllGate, DeferredAction, DiscardSink, FollowUp,
    FollowUpSink, HookContext, WebhookGate,
};
use crate::filter;
use crate::permission::{PermissionEvaluator, ReadScope};
use crate::rules::{RuleContext, RuleEngine, StoreRelatedSource};
use crate::state_machine::{StateMachineEngine, TransitionContext, TransitionOutcome};
use crate::write::{
    apply_defaults, missing_required, read_tree, shape_error, Executor, OpKind, Planner,
};
use crate::{EngineConfig, EngineError, EngineResult};
use keel_expr::Evaluator;
use keel_model::{Action, Condition, EntityDefinition, Hook, Registry, RegistryHandle, WebhookHook};
use keel_store::{rows, SqlFragment, Store};
use keel_types::{format_timestamp, Clock, Record, RequestId, SystemClock, UserContext, Value};
use rusqlite::Connection;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One invocation of the pipeline.
#[derive(Debug, Clone)]
pub struct Request {
    pub entity: String,
    pub action: Action,
    pub payload: Record,
    /// Key of the target row; required for everything but create.
    pub id: Option<Value>,
    pub user: UserContext,
}

impl Request {
    pub fn create(entity: impl Into<String>, payload: Record, user: UserContext) -> Self {
        Self {
            entity: entity.into(),
            action: Action::Create,
            payload,
            id: None,
            user,
        }
    }

    pub fn update(entity: impl Into<String>, id: impl Into<Value>, payload: Record, user: UserContext) -> Self {
        Self {
            entity: entity.into(),
            action: Action::Update,
            payload,
            id: Some(id.into()),
            user,
        }
    }

    pub fn delete(entity: impl Into<String>, id: impl Into<Value>, user: UserContext) -> Self {
        Self {
            entity: entity.into(),
            action: Action::Delete,
            payload: Record::new(),
            id: Some(id.into()),
            user,
        }
    }
}

/// State a single request carries between steps.
struct Prepared<'r> {
    registry: &'r Registry,
    entity: &'r EntityDefinition,
    key: Option<Value>,
    old: Option<Record>,
    now: String,
}

/// Runs requests against one store with a swappable registry.
pub struct Pipeline {
    registry: Arc<RegistryHandle>,
    store: Store,
    config: EngineConfig,
    evaluator: Evaluator,
    clock: Arc<dyn Clock>,
    gate: Arc<dyn WebhookGate>,
    sink: Arc<dyn FollowUpSink>,
}

impl Pipeline {
    pub fn new(registry: Arc<RegistryHandle>, store: Store, config: EngineConfig) -> Self {
        let evaluator = Evaluator::new(config.expression_cache_capacity);
        Self {
            registry,
            store,
            config,
            evaluator,
            clock: Arc::new(SystemClock),
            gate: Arc::new(AllowAllGate),
            sink: Arc::new(DiscardSink),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_gate(mut self, gate: Arc<dyn WebhookGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn FollowUpSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Handles one request and returns the written record tree (the deleted
    /// row for deletes).
    pub fn handle(&self, request: Request) -> EngineResult<Record> {
        let request_id = RequestId::new();
        debug!(
            request = %request_id,
            entity = %request.entity,
            action = %request.action,
            user = %request.user.id,
            "handling request"
        );
        let registry = self.registry.snapshot();
        if request.action == Action::Read {
            let id = request
                .id
                .as_ref()
                .ok_or_else(|| EngineError::InvalidPayload("read requires an id".into()))?;
            return self.get_in(&registry, &request.entity, id, &request.user);
        }

        let prepared = self.authorize(&registry, &request)?;
        let result = match request.action {
            Action::Delete => self.delete(&prepared, &request),
            _ => self.write(&prepared, &request),
        };
        match &result {
            Ok(_) => info!("Request {} committed: {} {}", request_id, request.action, request.entity),
            Err(e) => info!("Request {} failed with {}: {}", request_id, e.code(), e),
        }
        result
    }

    /// Reads one visible row.
    pub fn get(&self, entity: &str, id: &Value, user: &UserContext) -> EngineResult<Record> {
        let registry = self.registry.snapshot();
        self.get_in(&registry, entity, id, user)
    }

    /// Lists visible rows matching `conditions`.
    pub fn list(&self, entity: &str, user: &UserContext, conditions: &[Condition]) -> EngineResult<Vec<Record>> {
        let registry = self.registry.snapshot();
        let def = registry.require_entity(entity)?;
        let scope = self.read_scope(&registry, def, user)?;
        let filter = filter::compile(def, conditions, user)?.into_sql();
        let filter = match scope {
            Some(scope) => filter.and(scope),
            None => filter,
        };
        self.store
            .read(|conn| Ok(rows::select(conn, def, Some(&filter))?))
    }

    fn get_in(&self, registry: &Registry, entity: &str, id: &Value, user: &UserContext) -> EngineResult<Record> {
        let def = registry.require_entity(entity)?;
        let key = coerce_id(def, id)?;
        let filter = rows::key_predicate(def, &key);
        let filter = match self.read_scope(registry, def, user)? {
            Some(scope) => filter.and(scope),
            None => filter,
        };
        self.store
            .read(|conn| Ok::<_, EngineError>(rows::select(conn, def, Some(&filter))?))?
            .pop()
            .ok_or_else(|| EngineError::not_found(&def.name, &key))
    }

    /// The permission predicate for reads; `None` when unrestricted.
    fn read_scope(&self, registry: &Registry, def: &EntityDefinition, user: &UserContext) -> EngineResult<Option<SqlFragment>> {
        match PermissionEvaluator::new(registry, &self.config.admin_role).read_filter(user, def)? {
            ReadScope::Unrestricted => Ok(None),
            ReadScope::Restricted(scope) => Ok(Some(scope)),
            ReadScope::DenyAll => Err(EngineError::Forbidden(format!(
                "{} may not read {}",
                user.id, def.name
            ))),
        }
    }

    /// Steps 1 and 2: the permission gate and loading the stored row.
    fn authorize<'r>(&self, registry: &'r Registry, request: &Request) -> EngineResult<Prepared<'r>> {
        let entity = registry.require_entity(&request.entity)?;
        let user = &request.user;
        let permissions = PermissionEvaluator::new(registry, &self.config.admin_role);
        let forbidden = || {
            EngineError::Forbidden(format!("{} may not {} {}", user.id, request.action, entity.name))
        };
        if !permissions.has_role_grant(user, &entity.name, request.action) {
            warn!("Denied {} on {} for user {}: no policy", request.action, entity.name, user.id);
            return Err(forbidden());
        }

        let (key, old) = match request.action {
            Action::Create => (None, None),
            _ => {
                let id = request.id.as_ref().ok_or_else(|| {
                    EngineError::InvalidPayload(format!("{} requires an id", request.action))
                })?;
                let key = coerce_id(entity, id)?;
                let old = self
                    .store
                    .read(|conn| Ok::<_, EngineError>(rows::find(conn, entity, &key)?))?
                    .ok_or_else(|| EngineError::not_found(&entity.name, &key))?;
                (Some(key), Some(old))
            }
        };
        if !permissions
            .authorize(user, entity, request.action, old.as_ref())?
            .is_allowed()
        {
            return Err(forbidden());
        }

        Ok(Prepared {
            registry,
            entity,
            key,
            old,
            now: format_timestamp(self.clock.now()),
        })
    }

    fn write(&self, prepared: &Prepared<'_>, request: &Request) -> EngineResult<Record> {
        let Prepared {
            registry,
            entity,
            ..
        } = *prepared;
        let now = prepared.now.as_str();
        let old = prepared.old.as_ref();
        let user = &request.user;
        let planner = Planner::new(registry, &self.config, now);

        let (fields, nested) = planner.split(entity, &request.payload)?;
        let mut payload = entity.check_shape(fields).map_err(|e| shape_error(entity, e))?;
        if let Some(key) = &prepared.key {
            if let Some(sent) = payload.remove(entity.pk()) {
                if !sent.is_null() && !sent.loose_eq(key) {
                    return Err(EngineError::InvalidPayload(format!(
                        "`{}` cannot change from {key} to {sent}",
                        entity.pk()
                    )));
                }
            }
        }
        let mut record = match old {
            Some(old) => {
                let mut merged = old.clone();
                merged.merge(&payload);
                merged
            }
            None => payload.clone(),
        };

        // Step 3.
        let machines = registry.state_machines(&entity.name);
        let mut rule_payload = payload.clone();
        if request.action == Action::Create {
            StateMachineEngine::inject_initial(machines, &mut record);
            for machine in machines {
                if !rule_payload.contains_key(&machine.field) {
                    if let Some(initial) = record.get(&machine.field) {
                        rule_payload.insert(machine.field.clone(), initial.clone());
                    }
                }
            }
        }
        let transitions = StateMachineEngine::new(&self.evaluator, &self.config.admin_role).apply(
            machines,
            &TransitionContext {
                entity: &entity.name,
                action: request.action,
                user,
                payload: &payload,
                old,
                now,
            },
            &mut record,
        )?;

        // Step 4.
        let mut violations = match old {
            None => {
                apply_defaults(entity, &mut record);
                missing_required(entity, &record, &[])
            }
            Some(_) => missing_required(entity, &record, &[])
                .into_iter()
                .filter(|d| d.field.as_deref().is_some_and(|f| payload.contains_key(f)))
                .collect(),
        };
        let related = StoreRelatedSource::new(&self.store, registry, user);
        let outcome = RuleEngine::new(registry, &self.evaluator, &related).run_hooks(
            Hook::BeforeWrite,
            &RuleContext {
                entity,
                action: request.action,
                user,
                old,
                payload: &rule_payload,
                now,
            },
            record,
        )?;
        violations.extend(outcome.violations);
        if !violations.is_empty() {
            warn!("Rejected {} on {}: {} violation(s)", request.action, entity.name, violations.len());
            return Err(EngineError::Validation { details: violations });
        }
        let record = entity
            .check_shape(outcome.record)
            .map_err(|e| shape_error(entity, e))?;

        // Step 5.
        let (kind, values) = match (&prepared.key, old) {
            (Some(key), Some(old)) => {
                let mut changes = changed_fields(&record, Some(old));
                changes.remove(entity.pk());
                (OpKind::Update { key: key.clone() }, changes)
            }
            _ => (OpKind::Insert, record),
        };
        let plan = planner.plan(entity, kind, values, &nested)?;

        let (key, tree) = self.store.transaction(|tx| {
            let conn: &Connection = tx;
            let key = Executor::new(registry, conn, now).execute(&plan)?;
            let written = rows::find(conn, entity, &key)?
                .ok_or_else(|| EngineError::not_found(&entity.name, &key))?;
            self.pass_gate(registry, WebhookHook::BeforeWrite, &HookContext {
                entity: &entity.name,
                action: request.action,
                record: &written,
                old,
                user,
                now,
            })?;
            let tree = read_tree(conn, registry, entity, written, plan.shape())?;
            Ok::<_, EngineError>((key, tree))
        })?;

        // Step 6.
        self.enqueue_webhooks(registry, WebhookHook::AfterWrite, &HookContext {
            entity: &entity.name,
            action: request.action,
            record: &tree,
            old,
            user,
            now,
        });
        self.enqueue_transitions(&entity.name, &key, &tree, transitions);
        Ok(tree)
    }

    fn delete(&self, prepared: &Prepared<'_>, request: &Request) -> EngineResult<Record> {
        let Prepared {
            registry,
            entity,
            ..
        } = *prepared;
        let now = prepared.now.as_str();
        let user = &request.user;
        let (Some(key), Some(old)) = (&prepared.key, &prepared.old) else {
            return Err(EngineError::Internal("delete without a loaded row".into()));
        };

        let related = StoreRelatedSource::new(&self.store, registry, user);
        let empty = Record::new();
        let outcome = RuleEngine::new(registry, &self.evaluator, &related).run_hooks(
            Hook::BeforeDelete,
            &RuleContext {
                entity,
                action: Action::Delete,
                user,
                old: Some(old),
                payload: &empty,
                now,
            },
            old.clone(),
        )?;
        if !outcome.is_valid() {
            warn!("Rejected delete on {}: {} violation(s)", entity.name, outcome.violations.len());
            return Err(EngineError::Validation {
                details: outcome.violations,
            });
        }

        let plan = Planner::new(registry, &self.config, now).plan(
            entity,
            OpKind::Delete { key: key.clone() },
            Record::new(),
            &empty,
        )?;
        let ctx = HookContext {
            entity: &entity.name,
            action: Action::Delete,
            record: old,
            old: Some(old),
            user,
            now,
        };
        self.store.transaction(|tx| {
            let conn: &Connection = tx;
            Executor::new(registry, conn, now).execute(&plan)?;
            self.pass_gate(registry, WebhookHook::BeforeDelete, &ctx)
        })?;

        self.enqueue_webhooks(registry, WebhookHook::AfterDelete, &ctx);
        Ok(old.clone())
    }

    /// Synchronous `before_*` delivery. The first veto fails the request.
    /// Runs inside the write transaction, with the store lock held.
    fn pass_gate(&self, registry: &Registry, hook: WebhookHook, ctx: &HookContext<'_>) -> EngineResult<()> {
        for request in select_webhooks(registry, &self.evaluator, hook, ctx) {
            if let Err(reason) = self.gate.check(&request) {
                warn!("Webhook {} vetoed {}: {}", request.url, request.event, reason);
                return Err(EngineError::validation(
                    None,
                    "webhook",
                    format!("{} rejected the change: {reason}", request.url),
                ));
            }
        }
        Ok(())
    }

    fn enqueue_webhooks(&self, registry: &Registry, hook: WebhookHook, ctx: &HookContext<'_>) {
        for request in select_webhooks(registry, &self.evaluator, hook, ctx) {
            self.sink.enqueue(FollowUp::Webhook(request));
        }
    }

    fn enqueue_transitions(&self, entity: &str, key: &Value, tree: &Record, outcome: TransitionOutcome) {
        for mut notice in outcome.notices {
            notice.record = tree.clone();
            self.sink.enqueue(FollowUp::Transition(notice));
        }
        for action in outcome.deferred {
            self.sink.enqueue(FollowUp::Action(DeferredAction {
                entity: entity.to_string(),
                key: key.clone(),
                action,
            }));
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("store", &self.store)
            .field("config", &self.config)
            .field("evaluator", &self.evaluator)
            .finish_non_exhaustive()
    }
}

/// Normalizes a request id to the entity's key type.
fn coerce_id(entity: &EntityDefinition, id: &Value) -> EngineResult<Value> {
    match entity.column_type(entity.pk()) {
        Some(ty) if !id.is_null() => ty.coerce(id.clone()).map_err(|message| {
            EngineError::InvalidPayload(format!("id for {}: {message}", entity.name))
        }),
        _ => Err(EngineError::InvalidPayload(format!("id for {} is missing", entity.name))),
    }
}
