//! Immutable registry snapshots and their atomic publication.

use crate::{
    Action, EntityDefinition, Hook, ModelError, ModelResult, PermissionPolicy, RelationDefinition,
    Rule, RuleDefinition, StateMachineDefinition, WebhookDefinition, WebhookHook,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::info;

/// Serialized form of a registry: flat lists of every definition kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryDocument {
    #[serde(default)]
    pub entities: Vec<EntityDefinition>,
    #[serde(default)]
    pub relations: Vec<RelationDefinition>,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub state_machines: Vec<StateMachineDefinition>,
    #[serde(default)]
    pub permissions: Vec<PermissionPolicy>,
    #[serde(default)]
    pub webhooks: Vec<WebhookDefinition>,
}

impl RegistryDocument {
    pub fn from_json_str(s: &str) -> ModelResult<Self> {
        Ok(serde_json::from_str(s)?)
    }

    /// Reads a registry document from a JSON file.
    pub fn load_from(path: &Path) -> ModelResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }
}

/// A validated, read-only view of every definition, indexed for the
/// lookups the engine performs per request.
#[derive(Debug, Default)]
pub struct Registry {
    entities: HashMap<String, EntityDefinition>,
    relations: HashMap<String, Vec<RelationDefinition>>,
    rules: HashMap<(String, Hook), Vec<Rule>>,
    machines: HashMap<String, Vec<StateMachineDefinition>>,
    policies: HashMap<(String, Action), Vec<PermissionPolicy>>,
    webhooks: HashMap<String, Vec<WebhookDefinition>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Validates and indexes a document.
    pub fn from_document(doc: RegistryDocument) -> ModelResult<Self> {
        RegistryBuilder { doc }.build()
    }

    pub fn entity(&self, name: &str) -> Option<&EntityDefinition> {
        self.entities.get(name)
    }

    pub fn require_entity(&self, name: &str) -> ModelResult<&EntityDefinition> {
        self.entity(name)
            .ok_or_else(|| ModelError::UnknownEntity(name.to_string()))
    }

    pub fn entity_names(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    /// Relations whose source is `entity`, in declaration order.
    pub fn relations_of(&self, entity: &str) -> &[RelationDefinition] {
        self.relations.get(entity).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn relation(&self, entity: &str, name: &str) -> Option<&RelationDefinition> {
        self.relations_of(entity).iter().find(|r| r.name == name)
    }

    /// Relations whose target is `entity`, from any source.
    pub fn relations_targeting(&self, entity: &str) -> Vec<&RelationDefinition> {
        let mut found: Vec<&RelationDefinition> = self
            .relations
            .values()
            .flatten()
            .filter(|r| r.target == entity)
            .collect();
        // HashMap order is arbitrary; keep results stable.
        found.sort_by(|a, b| (&a.source, &a.name).cmp(&(&b.source, &b.name)));
        found
    }

    /// Active rules for a hook, ordered by phase then priority. Ties keep
    /// declaration order.
    pub fn rules(&self, entity: &str, hook: Hook) -> &[Rule] {
        self.rules
            .get(&(entity.to_string(), hook))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// State machines for `entity`, in declaration order.
    pub fn state_machines(&self, entity: &str) -> &[StateMachineDefinition] {
        self.machines.get(entity).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn policies(&self, entity: &str, action: Action) -> &[PermissionPolicy] {
        self.policies
            .get(&(entity.to_string(), action))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Active webhooks subscribed to `hook` on `entity`.
    pub fn webhooks(&self, entity: &str, hook: WebhookHook) -> impl Iterator<Item = &WebhookDefinition> {
        self.webhooks
            .get(entity)
            .into_iter()
            .flatten()
            .filter(move |w| w.active && w.hook == hook)
    }
}

/// Collects definitions and validates them into a [`Registry`].
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    doc: RegistryDocument,
}

impl RegistryBuilder {
    pub fn entity(mut self, entity: EntityDefinition) -> Self {
        self.doc.entities.push(entity);
        self
    }

    pub fn relation(mut self, relation: RelationDefinition) -> Self {
        self.doc.relations.push(relation);
        self
    }

    pub fn rule(mut self, rule: Rule) -> Self {
        self.doc.rules.push(rule);
        self
    }

    pub fn state_machine(mut self, machine: StateMachineDefinition) -> Self {
        self.doc.state_machines.push(machine);
        self
    }

    pub fn permission(mut self, policy: PermissionPolicy) -> Self {
        self.doc.permissions.push(policy);
        self
    }

    pub fn webhook(mut self, webhook: WebhookDefinition) -> Self {
        self.doc.webhooks.push(webhook);
        self
    }

    pub fn build(self) -> ModelResult<Registry> {
        let doc = self.doc;
        let mut registry = Registry::default();

        for entity in doc.entities {
            validate_entity(&entity)?;
            if registry.entities.contains_key(&entity.name) {
                return Err(invalid(format!("duplicate entity `{}`", entity.name)));
            }
            registry.entities.insert(entity.name.clone(), entity);
        }

        for relation in doc.relations {
            validate_relation(&registry, &relation)?;
            let siblings = registry.relations.entry(relation.source.clone()).or_default();
            if siblings.iter().any(|r| r.name == relation.name) {
                return Err(invalid(format!(
                    "duplicate relation `{}` on `{}`",
                    relation.name, relation.source
                )));
            }
            siblings.push(relation);
        }

        for rule in doc.rules {
            validate_rule(&registry, &rule)?;
            if rule.active {
                registry
                    .rules
                    .entry((rule.entity.clone(), rule.hook))
                    .or_default()
                    .push(rule);
            }
        }
        for rules in registry.rules.values_mut() {
            // Stable: equal (phase, priority) keeps declaration order.
            rules.sort_by_key(|r| (r.phase(), r.priority));
        }

        for machine in doc.state_machines {
            let entity = known_entity(&registry, &machine.entity)?;
            if entity.field(&machine.field).is_none() {
                return Err(invalid(format!(
                    "state machine field `{}.{}` is not declared",
                    machine.entity, machine.field
                )));
            }
            if machine.initial.is_empty() {
                return Err(invalid(format!(
                    "state machine on `{}.{}` has no initial state",
                    machine.entity, machine.field
                )));
            }
            let siblings = registry.machines.entry(machine.entity.clone()).or_default();
            if siblings.iter().any(|m| m.field == machine.field) {
                return Err(invalid(format!(
                    "field `{}.{}` has more than one state machine",
                    machine.entity, machine.field
                )));
            }
            siblings.push(machine);
        }

        for policy in doc.permissions {
            let entity = known_entity(&registry, &policy.entity)?;
            for condition in &policy.conditions {
                if !entity.has_column(&condition.field) {
                    return Err(invalid(format!(
                        "policy condition on unknown field `{}.{}`",
                        policy.entity, condition.field
                    )));
                }
            }
            registry
                .policies
                .entry((policy.entity.clone(), policy.action))
                .or_default()
                .push(policy);
        }

        for webhook in doc.webhooks {
            known_entity(&registry, &webhook.entity)?;
            registry
                .webhooks
                .entry(webhook.entity.clone())
                .or_default()
                .push(webhook);
        }

        Ok(registry)
    }
}

/// Process-wide holder of the current registry snapshot.
///
/// Readers clone the `Arc` and keep using it for the whole request;
/// `publish` swaps the pointer and never touches the old snapshot, which is
/// dropped once the last in-flight request releases it.
#[derive(Debug)]
pub struct RegistryHandle {
    current: RwLock<Arc<Registry>>,
}

impl RegistryHandle {
    pub fn new(registry: Registry) -> Self {
        Self {
            current: RwLock::new(Arc::new(registry)),
        }
    }

    /// Returns the snapshot current at the time of the call.
    pub fn snapshot(&self) -> Arc<Registry> {
        let guard = self.current.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&*guard)
    }

    /// Replaces the current snapshot, returning the previous one.
    pub fn publish(&self, registry: Registry) -> Arc<Registry> {
        let next = Arc::new(registry);
        let mut guard = self.current.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        info!(entities = next.entities.len(), "Publishing registry snapshot");
        std::mem::replace(&mut *guard, next)
    }
}

/// True for names safe to splice into SQL as identifiers.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn invalid(message: String) -> ModelError {
    ModelError::InvalidDefinition(message)
}

fn known_entity<'a>(registry: &'a Registry, name: &str) -> ModelResult<&'a EntityDefinition> {
    registry
        .entity(name)
        .ok_or_else(|| invalid(format!("reference to unknown entity `{name}`")))
}

fn require_identifier(kind: &str, name: &str) -> ModelResult<()> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(invalid(format!("{kind} `{name}` is not a valid identifier")))
    }
}

fn validate_entity(entity: &EntityDefinition) -> ModelResult<()> {
    require_identifier("entity", &entity.name)?;
    require_identifier("table", &entity.table)?;
    require_identifier("primary key", entity.pk())?;
    let mut seen = Vec::new();
    for field in &entity.fields {
        require_identifier("field", &field.name)?;
        if seen.contains(&field.name.as_str()) {
            return Err(invalid(format!(
                "duplicate field `{}.{}`",
                entity.name, field.name
            )));
        }
        seen.push(field.name.as_str());
    }
    if let Some(marker) = entity.soft_delete_field() {
        require_identifier("soft-delete field", marker)?;
        if entity.field(marker).is_some() {
            return Err(invalid(format!(
                "soft-delete field `{}.{marker}` must not be a declared field",
                entity.name
            )));
        }
    }
    Ok(())
}

fn validate_relation(registry: &Registry, relation: &RelationDefinition) -> ModelResult<()> {
    require_identifier("relation", &relation.name)?;
    let source = known_entity(registry, &relation.source)?;
    let target = known_entity(registry, &relation.target)?;
    if source.field(&relation.name).is_some() {
        return Err(invalid(format!(
            "relation `{}` shadows a field of `{}`",
            relation.name, relation.source
        )));
    }
    if !source.has_column(&relation.source_key) {
        return Err(invalid(format!(
            "relation `{}`: source key `{}` is not a column of `{}`",
            relation.name, relation.source_key, relation.source
        )));
    }
    if relation.is_many_to_many() {
        let join = relation.join_table.as_ref().ok_or_else(|| {
            invalid(format!(
                "many-to-many relation `{}` needs a join table",
                relation.name
            ))
        })?;
        require_identifier("join table", &join.table)?;
        require_identifier("join column", &join.source_column)?;
        require_identifier("join column", &join.target_column)?;
    } else if !target.has_column(&relation.target_key) {
        return Err(invalid(format!(
            "relation `{}`: target key `{}` is not a column of `{}`",
            relation.name, relation.target_key, relation.target
        )));
    }
    Ok(())
}

fn validate_rule(registry: &Registry, rule: &Rule) -> ModelResult<()> {
    let entity = known_entity(registry, &rule.entity)?;
    let field = match &rule.definition {
        RuleDefinition::Field(f) => Some(&f.field),
        RuleDefinition::Computed(c) => Some(&c.field),
        RuleDefinition::Expression(e) => {
            for load in &e.related_load {
                if registry.relation(&rule.entity, &load.relation).is_none() {
                    return Err(invalid(format!(
                        "rule `{}` loads unknown relation `{}`",
                        rule.name, load.relation
                    )));
                }
            }
            None
        }
    };
    if let Some(field) = field {
        if !entity.has_column(field) {
            return Err(invalid(format!(
                "rule `{}` targets unknown field `{}.{field}`",
                rule.name, rule.entity
            )));
        }
    }
    Ok(())
}
