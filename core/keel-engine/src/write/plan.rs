//! Turns a nested payload into a flat arena of operations. Every shape,
//! nesting and cycle check happens here, before any statement runs.

use super::{apply_defaults, missing_required, shape_error, stamp};
use crate::state_machine::StateMachineEngine;
use crate::{EngineConfig, EngineError, EngineResult};
use keel_model::{
    EntityDefinition, JoinTable, Registry, RelationDefinition, RelationKind, WriteMode,
};
use keel_types::{Record, Value};
use tracing::debug;

/// Payload keys of the long relation form `{write_mode?, data}`.
const DATA_KEY: &str = "data";
const MODE_KEY: &str = "write_mode";

/// What one operation does to its table.
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    Insert,
    /// Update the live row with `key`, scoped to the parent for children.
    Update { key: Value },
    Delete { key: Value },
    /// Delete the parent's live children whose keys are not in `keep`.
    DeleteUnmentioned { keep: Vec<Value> },
    Link { target: Value },
    Unlink { target: Value },
    /// Remove the parent's join rows whose target is not in `keep`.
    UnlinkUnmentioned { keep: Vec<Value> },
}

/// How an operation's row hangs off its parent.
#[derive(Debug, Clone)]
pub enum ParentLink {
    /// `column` on the child holds the parent's `source_key` value.
    ForeignKey { column: String, source_key: String },
    /// Join rows pair the parent's `source_key` value with a target key.
    Join { join: JoinTable, source_key: String },
}

impl ParentLink {
    pub fn source_key(&self) -> &str {
        match self {
            Self::ForeignKey { source_key, .. } | Self::Join { source_key, .. } => source_key,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Operation {
    pub entity: String,
    pub table: String,
    pub kind: OpKind,
    pub values: Record,
    pub parent: Option<usize>,
    pub link: Option<ParentLink>,
    pub relation: Option<String>,
    pub children: Vec<usize>,
}

/// Relations a write touched, nested the way they were written. Used to
/// read the written tree back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeShape {
    pub relations: Vec<(String, TreeShape)>,
}

impl TreeShape {
    fn add(&mut self, name: &str, shape: TreeShape) {
        match self.relations.iter_mut().find(|(n, _)| n == name) {
            Some((_, existing)) => {
                for (child, sub) in shape.relations {
                    existing.add(&child, sub);
                }
            }
            None => self.relations.push((name.to_string(), shape)),
        }
    }
}

/// An arena of operations. Index 0 is the root; children are listed in
/// execution order.
#[derive(Debug, Clone)]
pub struct WritePlan {
    ops: Vec<Operation>,
    shape: TreeShape,
}

impl WritePlan {
    pub fn root(&self) -> &Operation {
        &self.ops[0]
    }

    pub fn get(&self, index: usize) -> Option<&Operation> {
        self.ops.get(index)
    }

    pub fn operations(&self) -> &[Operation] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn shape(&self) -> &TreeShape {
        &self.shape
    }
}

/// Child items of one relation, after mode resolution.
struct RelationWrite<'r> {
    relation: &'r RelationDefinition,
    target: &'r EntityDefinition,
    mode: WriteMode,
    items: Vec<Value>,
}

/// Builds write plans against one registry snapshot.
pub struct Planner<'a> {
    registry: &'a Registry,
    config: &'a EngineConfig,
    now: &'a str,
}

impl<'a> Planner<'a> {
    pub fn new(registry: &'a Registry, config: &'a EngineConfig, now: &'a str) -> Self {
        Self {
            registry,
            config,
            now,
        }
    }

    /// Splits a top-level payload into entity fields and relation values.
    pub fn split(&self, entity: &EntityDefinition, payload: &Record) -> EngineResult<(Record, Record)> {
        self.split_keys(entity, payload, false)
    }

    /// Plans the write of one root row and everything nested under it.
    /// `values` are the root's already validated field values.
    pub fn plan(
        &self,
        entity: &EntityDefinition,
        kind: OpKind,
        mut values: Record,
        nested: &Record,
    ) -> EngineResult<WritePlan> {
        match kind {
            OpKind::Insert => stamp(entity, &mut values, self.now, true),
            OpKind::Update { .. } => stamp(entity, &mut values, self.now, false),
            _ => {}
        }
        let mut ops = vec![Operation {
            entity: entity.name.clone(),
            table: entity.table.clone(),
            kind,
            values,
            parent: None,
            link: None,
            relation: None,
            children: Vec::new(),
        }];
        let mut path = vec![entity.name.clone()];
        let shape = self.plan_relations(&mut ops, 0, entity, nested, &mut path, 1)?;
        debug!(entity = %entity.name, operations = ops.len(), "planned write");
        Ok(WritePlan { ops, shape })
    }

    fn split_keys(
        &self,
        entity: &EntityDefinition,
        payload: &Record,
        allow_flag: bool,
    ) -> EngineResult<(Record, Record)> {
        let mut fields = Record::new();
        let mut nested = Record::new();
        for (key, value) in payload {
            if entity.has_column(key) {
                fields.insert(key.clone(), value.clone());
            } else if self.registry.relation(&entity.name, key).is_some() {
                nested.insert(key.clone(), value.clone());
            } else if !(allow_flag && *key == self.config.delete_flag) {
                return Err(EngineError::UnknownField {
                    entity: entity.name.clone(),
                    field: key.clone(),
                });
            }
        }
        Ok((fields, nested))
    }

    fn plan_relations(
        &self,
        ops: &mut Vec<Operation>,
        parent: usize,
        entity: &EntityDefinition,
        nested: &Record,
        path: &mut Vec<String>,
        depth: usize,
    ) -> EngineResult<TreeShape> {
        let mut shape = TreeShape::default();
        let mut joins = Vec::new();

        for (name, value) in nested {
            let relation = self.registry.relation(&entity.name, name).ok_or_else(|| {
                EngineError::UnknownField {
                    entity: entity.name.clone(),
                    field: name.clone(),
                }
            })?;
            if !relation.accepts_nested_writes() {
                return Err(EngineError::InvalidPayload(format!(
                    "relation `{name}` is not owned by `{}` and cannot be written through it",
                    entity.name
                )));
            }
            if depth > self.config.max_nesting_depth {
                return Err(EngineError::InvalidPayload(format!(
                    "nesting deeper than {} levels at `{name}`",
                    self.config.max_nesting_depth
                )));
            }
            let target = self.registry.require_entity(&relation.target)?;
            let (mode, items) = relation_items(relation, value)?;
            let write = RelationWrite {
                relation,
                target,
                mode,
                items,
            };

            if relation.is_many_to_many() {
                joins.push(write);
                shape.add(name, TreeShape::default());
                continue;
            }
            if path.contains(&target.name) {
                return Err(EngineError::InvalidPayload(format!(
                    "circular nesting: `{}` recurs through `{name}`",
                    target.name
                )));
            }
            path.push(target.name.clone());
            let child_shape = self.plan_children(ops, parent, &write, path, depth)?;
            path.pop();
            shape.add(name, child_shape);
        }

        for write in &joins {
            self.plan_links(ops, parent, write)?;
        }
        Ok(shape)
    }

    fn plan_children(
        &self,
        ops: &mut Vec<Operation>,
        parent: usize,
        write: &RelationWrite<'_>,
        path: &mut Vec<String>,
        depth: usize,
    ) -> EngineResult<TreeShape> {
        let RelationWrite {
            relation,
            target,
            mode,
            ..
        } = *write;
        let link = ParentLink::ForeignKey {
            column: relation.target_key.clone(),
            source_key: relation.source_key.clone(),
        };

        let mut keep = Vec::new();
        let mut planned = Vec::new();
        for item in &write.items {
            let Value::Object(item) = item else {
                return Err(EngineError::InvalidPayload(format!(
                    "items of `{}` must be objects, found {}",
                    relation.name,
                    item.type_name()
                )));
            };
            let flagged = self.is_flagged(item)?;
            let key = match item.get(target.pk()) {
                Some(v) if !v.is_null() => Some(coerce_key(target, v)?),
                _ => None,
            };
            match (flagged, key) {
                (true, None) => {
                    return Err(EngineError::InvalidPayload(format!(
                        "item of `{}` flagged for deletion has no `{}`",
                        relation.name,
                        target.pk()
                    )));
                }
                (_, Some(_)) if mode == WriteMode::Append => {}
                (true, Some(key)) => {
                    keep.push(key.clone());
                    planned.push((OpKind::Delete { key }, Record::new(), Record::new()));
                }
                (false, key) => {
                    let (mut fields, nested) = self.split_keys(target, item, true)?;
                    self.check_nested_states(target, &fields, key.is_none())?;
                    if key.is_none() {
                        StateMachineEngine::inject_initial(self.registry.state_machines(&target.name), &mut fields);
                        apply_defaults(target, &mut fields);
                    }
                    let mut values = target.check_shape(fields).map_err(|e| shape_error(target, e))?;
                    let kind = match key {
                        Some(key) => {
                            values.remove(target.pk());
                            keep.push(key.clone());
                            stamp(target, &mut values, self.now, false);
                            OpKind::Update { key }
                        }
                        None => {
                            stamp(target, &mut values, self.now, true);
                            let missing = missing_required(target, &values, &[relation.target_key.as_str()]);
                            if !missing.is_empty() {
                                return Err(EngineError::Validation { details: missing });
                            }
                            OpKind::Insert
                        }
                    };
                    planned.push((kind, values, nested));
                }
            }
        }

        if relation.kind == RelationKind::OneToOne
            && planned.iter().filter(|(k, _, _)| !matches!(k, OpKind::Delete { .. })).count() > 1
        {
            return Err(EngineError::InvalidPayload(format!(
                "one-to-one relation `{}` takes a single item",
                relation.name
            )));
        }

        if mode == WriteMode::Replace {
            // Runs before the new rows exist so they are never swept up.
            push_child(ops, parent, target, relation, &link, OpKind::DeleteUnmentioned { keep }, Record::new());
        }

        let mut shape = TreeShape::default();
        for (kind, values, nested) in planned {
            let index = push_child(ops, parent, target, relation, &link, kind, values);
            if !nested.is_empty() {
                let sub = self.plan_relations(ops, index, target, &nested, path, depth + 1)?;
                for (name, s) in sub.relations {
                    shape.add(&name, s);
                }
            }
        }
        Ok(shape)
    }

    fn plan_links(&self, ops: &mut Vec<Operation>, parent: usize, write: &RelationWrite<'_>) -> EngineResult<()> {
        let RelationWrite {
            relation,
            target,
            mode,
            ..
        } = *write;
        let join = relation.join_table.clone().ok_or_else(|| {
            EngineError::Internal(format!("relation `{}` has no join table", relation.name))
        })?;
        let link = ParentLink::Join {
            join,
            source_key: relation.source_key.clone(),
        };

        let mut keep = Vec::new();
        let mut planned = Vec::new();
        for item in &write.items {
            let (key, flagged) = match item {
                Value::Object(fields) => {
                    if let Some(extra) = fields
                        .keys()
                        .find(|k| k.as_str() != target.pk() && **k != self.config.delete_flag)
                    {
                        return Err(EngineError::InvalidPayload(format!(
                            "items of `{}` carry only the target key, found `{extra}`",
                            relation.name
                        )));
                    }
                    let key = fields.get(target.pk()).filter(|v| !v.is_null()).ok_or_else(|| {
                        EngineError::InvalidPayload(format!(
                            "items of `{}` must identify the target by `{}`",
                            relation.name,
                            target.pk()
                        ))
                    })?;
                    (coerce_key(target, key)?, self.is_flagged(fields)?)
                }
                Value::Null | Value::List(_) => {
                    return Err(EngineError::InvalidPayload(format!(
                        "items of `{}` must be target keys",
                        relation.name
                    )));
                }
                scalar => (coerce_key(target, scalar)?, false),
            };
            match (flagged, mode) {
                (true, WriteMode::Append) => {}
                (true, _) => planned.push(OpKind::Unlink { target: key }),
                (false, _) => {
                    keep.push(key.clone());
                    planned.push(OpKind::Link { target: key });
                }
            }
        }

        if mode == WriteMode::Replace {
            planned.insert(0, OpKind::UnlinkUnmentioned { keep });
        }
        for kind in planned {
            push_child(ops, parent, target, relation, &link, kind, Record::new());
        }
        Ok(())
    }

    /// Nested rows skip the transition checks of their own requests, so a
    /// governed field may only take its initial state on insert and may not
    /// be written on update.
    fn check_nested_states(&self, target: &EntityDefinition, fields: &Record, inserting: bool) -> EngineResult<()> {
        for machine in self.registry.state_machines(&target.name) {
            let allowed = match fields.get(&machine.field) {
                None => true,
                Some(Value::Null) => inserting,
                Some(value) => inserting && value.as_str() == Some(machine.initial.as_str()),
            };
            if !allowed {
                return Err(EngineError::InvalidPayload(format!(
                    "`{}.{}` can only change through a request on `{}` itself",
                    target.name, machine.field, target.name
                )));
            }
        }
        Ok(())
    }

    fn is_flagged(&self, item: &Record) -> EngineResult<bool> {
        match item.get(&self.config.delete_flag) {
            None | Some(Value::Null) => Ok(false),
            Some(Value::Bool(flag)) => Ok(*flag),
            Some(other) => Err(EngineError::InvalidPayload(format!(
                "`{}` must be a boolean, found {}",
                self.config.delete_flag,
                other.type_name()
            ))),
        }
    }
}

fn push_child(
    ops: &mut Vec<Operation>,
    parent: usize,
    target: &EntityDefinition,
    relation: &RelationDefinition,
    link: &ParentLink,
    kind: OpKind,
    values: Record,
) -> usize {
    let index = ops.len();
    ops.push(Operation {
        entity: target.name.clone(),
        table: target.table.clone(),
        kind,
        values,
        parent: Some(parent),
        link: Some(link.clone()),
        relation: Some(relation.name.clone()),
        children: Vec::new(),
    });
    ops[parent].children.push(index);
    index
}

/// Resolves a relation value into its write mode and items.
fn relation_items(relation: &RelationDefinition, value: &Value) -> EngineResult<(WriteMode, Vec<Value>)> {
    let malformed = |what: &str| {
        EngineError::InvalidPayload(format!("relation `{}`: {what}", relation.name))
    };
    match value {
        Value::List(items) => Ok((relation.default_write_mode, items.clone())),
        Value::Object(obj) if obj.contains_key(DATA_KEY) => {
            if let Some(extra) = obj.keys().find(|k| *k != DATA_KEY && *k != MODE_KEY) {
                return Err(malformed(&format!("unexpected key `{extra}`")));
            }
            let mode = match obj.get(MODE_KEY) {
                None | Some(Value::Null) => relation.default_write_mode,
                Some(Value::Text(s)) => WriteMode::parse(s)
                    .ok_or_else(|| malformed(&format!("unknown write mode `{s}`")))?,
                Some(other) => return Err(malformed(&format!("write mode must be a string, found {}", other.type_name()))),
            };
            let items = match obj.get(DATA_KEY) {
                Some(Value::List(items)) => items.clone(),
                Some(item @ Value::Object(_)) => vec![item.clone()],
                _ => return Err(malformed("`data` must be a list or an object")),
            };
            Ok((mode, items))
        }
        Value::Object(_) => Ok((relation.default_write_mode, vec![value.clone()])),
        other => Err(malformed(&format!("expected a list or an object, found {}", other.type_name()))),
    }
}

/// Normalizes a client-supplied key to the target's key type.
fn coerce_key(target: &EntityDefinition, key: &Value) -> EngineResult<Value> {
    match target.column_type(target.pk()) {
        Some(ty) => ty.coerce(key.clone()).map_err(|message| {
            EngineError::InvalidPayload(format!("`{}.{}` {message}", target.name, target.pk()))
        }),
        None => Ok(key.clone()),
    }
}
