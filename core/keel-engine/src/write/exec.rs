//! Transactional execution of write plans, plus the on-delete policies
//! applied whenever a row is removed.

use super::plan::{OpKind, Operation, ParentLink, TreeShape, WritePlan};
use crate::{EngineError, EngineResult};
use keel_model::{EntityDefinition, OnDelete, Registry, RelationKind};
use keel_store::{quote_ident, rows, SqlFragment};
use keel_types::{Record, Value};
use rusqlite::Connection;
use std::collections::HashSet;
use tracing::{debug, info};

/// Runs a [`WritePlan`] on a connection, normally a transaction the caller
/// owns. Operations run depth first: a row, then its children in order.
pub struct Executor<'a> {
    registry: &'a Registry,
    conn: &'a Connection,
    now: &'a str,
}

impl<'a> Executor<'a> {
    pub fn new(registry: &'a Registry, conn: &'a Connection, now: &'a str) -> Self {
        Self {
            registry,
            conn,
            now,
        }
    }

    /// Executes every operation and returns the root row's key.
    pub fn execute(&self, plan: &WritePlan) -> EngineResult<Value> {
        let mut keys: Vec<Option<Value>> = vec![None; plan.len()];
        self.run(plan, 0, &mut keys)?;
        info!(entity = %plan.root().entity, operations = plan.len(), "executed write plan");
        keys.first()
            .cloned()
            .flatten()
            .ok_or_else(|| EngineError::Internal("write plan produced no root key".into()))
    }

    fn run(&self, plan: &WritePlan, index: usize, keys: &mut [Option<Value>]) -> EngineResult<()> {
        let op = plan
            .get(index)
            .ok_or_else(|| EngineError::Internal(format!("write plan has no operation {index}")))?;
        let def = self.registry.require_entity(&op.entity)?;
        let parent_value = match (op.parent, &op.link) {
            (Some(parent), Some(link)) => Some(self.parent_value(plan, parent, link, keys)?),
            _ => None,
        };
        let scope = match (&op.link, &parent_value) {
            (Some(ParentLink::ForeignKey { column, .. }), Some(value)) => Some(SqlFragment::new(
                format!("{} = ?", quote_ident(column)),
                vec![value.clone()],
            )),
            _ => None,
        };

        match &op.kind {
            OpKind::Insert => {
                let mut values = op.values.clone();
                if let (Some(ParentLink::ForeignKey { column, .. }), Some(value)) = (&op.link, &parent_value) {
                    check_parent_column(op, column, &values, value)?;
                    values.insert(column.clone(), value.clone());
                }
                keys[index] = Some(rows::insert(self.conn, def, &values)?);
            }
            OpKind::Update { key } => {
                if let (Some(ParentLink::ForeignKey { column, .. }), Some(value)) = (&op.link, &parent_value) {
                    check_parent_column(op, column, &op.values, value)?;
                }
                if rows::update(self.conn, def, key, &op.values, scope.as_ref())? == 0 {
                    return Err(missing(op, def, key));
                }
                keys[index] = Some(key.clone());
            }
            OpKind::Delete { key } => {
                let target = rows::key_predicate(def, key);
                let target = match scope {
                    Some(scope) => target.and(scope),
                    None => target,
                };
                let row = rows::select(self.conn, def, Some(&target))?
                    .pop()
                    .ok_or_else(|| missing(op, def, key))?;
                self.delete_row(def, &row, &mut HashSet::new())?;
                keys[index] = Some(key.clone());
            }
            OpKind::DeleteUnmentioned { keep } => {
                let mut filter = scope.unwrap_or_else(SqlFragment::always);
                if !keep.is_empty() {
                    let marks = vec!["?"; keep.len()].join(", ");
                    filter = filter.and(SqlFragment::new(
                        format!("{} NOT IN ({marks})", quote_ident(def.pk())),
                        keep.clone(),
                    ));
                }
                let mut visited = HashSet::new();
                for row in rows::select(self.conn, def, Some(&filter))? {
                    self.delete_row(def, &row, &mut visited)?;
                }
            }
            OpKind::Link { target } => {
                let join = join_of(op)?;
                let source = parent_value.as_ref().ok_or_else(|| orphan(op))?;
                if rows::find(self.conn, def, target)?.is_none() {
                    return Err(EngineError::not_found(&def.name, target));
                }
                rows::link(self.conn, join, source, target)?;
            }
            OpKind::Unlink { target } => {
                let join = join_of(op)?;
                let source = parent_value.as_ref().ok_or_else(|| orphan(op))?;
                rows::unlink(self.conn, join, source, target)?;
            }
            OpKind::UnlinkUnmentioned { keep } => {
                let join = join_of(op)?;
                let source = parent_value.as_ref().ok_or_else(|| orphan(op))?;
                rows::unlink_except(self.conn, join, source, keep)?;
            }
        }

        for &child in &op.children {
            self.run(plan, child, keys)?;
        }
        Ok(())
    }

    /// The value children of `parent` link to: its key, or another column
    /// read back from the stored row.
    fn parent_value(
        &self,
        plan: &WritePlan,
        parent: usize,
        link: &ParentLink,
        keys: &[Option<Value>],
    ) -> EngineResult<Value> {
        let parent_op = plan
            .get(parent)
            .ok_or_else(|| EngineError::Internal(format!("write plan has no operation {parent}")))?;
        let parent_def = self.registry.require_entity(&parent_op.entity)?;
        let key = keys
            .get(parent)
            .cloned()
            .flatten()
            .ok_or_else(|| EngineError::Internal(format!("`{}` ran before its parent", parent_op.entity)))?;
        let source_key = link.source_key();
        if source_key == parent_def.pk() {
            return Ok(key);
        }
        let row = rows::find(self.conn, parent_def, &key)?
            .ok_or_else(|| EngineError::not_found(&parent_def.name, &key))?;
        match row.get(source_key) {
            Some(value) if !value.is_null() => Ok(value.clone()),
            _ => Err(EngineError::InvalidPayload(format!(
                "`{}` has no `{source_key}` for its children to reference",
                parent_def.name
            ))),
        }
    }

    /// Deletes one row after applying the on-delete policy of every relation
    /// it is the source of, and drops every join row that mentions it.
    pub fn delete_row(
        &self,
        def: &EntityDefinition,
        row: &Record,
        visited: &mut HashSet<(String, String)>,
    ) -> EngineResult<()> {
        let key = row.get(def.pk()).cloned().unwrap_or_default();
        if !visited.insert((def.name.clone(), key.to_string())) {
            return Ok(());
        }

        for relation in self.registry.relations_of(&def.name) {
            let source_value = match row.get(&relation.source_key) {
                Some(v) if !v.is_null() => v.clone(),
                _ => continue,
            };
            if let Some(join) = &relation.join_table {
                rows::unlink_all(self.conn, join, &join.source_column, &source_value)?;
                continue;
            }
            let child_def = self.registry.require_entity(&relation.target)?;
            let children = SqlFragment::new(
                format!("{} = ?", quote_ident(&relation.target_key)),
                vec![source_value.clone()],
            );
            match relation.on_delete {
                OnDelete::Cascade => {
                    for child in rows::select(self.conn, child_def, Some(&children))? {
                        self.delete_row(child_def, &child, visited)?;
                    }
                }
                OnDelete::SetNull => {
                    rows::set_null(self.conn, child_def, &relation.target_key, &source_value)?;
                }
                OnDelete::Restrict => {
                    let live = rows::count_where(self.conn, child_def, &children)?;
                    if live > 0 {
                        return Err(EngineError::Conflict(format!(
                            "{} `{key}` still has {live} `{}` row(s)",
                            def.name, relation.name
                        )));
                    }
                }
                OnDelete::Detach => {}
            }
        }

        for relation in self.registry.relations_targeting(&def.name) {
            if let Some(join) = &relation.join_table {
                rows::unlink_all(self.conn, join, &join.target_column, &key)?;
            }
        }

        rows::delete(self.conn, def, &key, None, self.now)?;
        debug!(entity = %def.name, key = %key, "deleted with dependents");
        Ok(())
    }
}

fn join_of(op: &Operation) -> EngineResult<&keel_model::JoinTable> {
    match &op.link {
        Some(ParentLink::Join { join, .. }) => Ok(join),
        _ => Err(EngineError::Internal(format!(
            "link operation on `{}` has no join table",
            op.entity
        ))),
    }
}

/// A nested row may restate its foreign key but never point it at another
/// parent.
fn check_parent_column(op: &Operation, column: &str, values: &Record, parent: &Value) -> EngineResult<()> {
    match values.get(column) {
        Some(given) if !given.is_null() && !given.loose_eq(parent) => Err(EngineError::InvalidPayload(format!(
            "`{column}` of a `{}` item must match its parent ({parent}), found {given}",
            op.relation.as_deref().unwrap_or(&op.entity)
        ))),
        _ => Ok(()),
    }
}

fn orphan(op: &Operation) -> EngineError {
    EngineError::Internal(format!("`{}` operation has no parent", op.entity))
}

fn missing(op: &Operation, def: &EntityDefinition, key: &Value) -> EngineError {
    match &op.relation {
        Some(relation) => EngineError::NotFound {
            entity: def.name.clone(),
            key: format!("{key} (in `{relation}`)"),
        },
        None => EngineError::not_found(&def.name, key),
    }
}

/// Reads `record`'s children back along `shape`. One-to-one relations
/// become an object or nil, the others a list.
pub fn read_tree(
    conn: &Connection,
    registry: &Registry,
    def: &EntityDefinition,
    mut record: Record,
    shape: &TreeShape,
) -> EngineResult<Record> {
    for (name, sub) in &shape.relations {
        let Some(relation) = registry.relation(&def.name, name) else {
            continue;
        };
        let target = registry.require_entity(&relation.target)?;
        let source_value = record.get(&relation.source_key).cloned().unwrap_or_default();
        let children = if source_value.is_null() {
            Vec::new()
        } else if let Some(join) = &relation.join_table {
            let mut linked = Vec::new();
            for key in rows::linked_targets(conn, join, &source_value)? {
                if let Some(row) = rows::find(conn, target, &key)? {
                    linked.push(row);
                }
            }
            linked
        } else {
            let filter = SqlFragment::new(
                format!("{} = ?", quote_ident(&relation.target_key)),
                vec![source_value],
            );
            rows::select(conn, target, Some(&filter))?
        };

        let mut loaded = Vec::with_capacity(children.len());
        for child in children {
            loaded.push(read_tree(conn, registry, target, child, sub)?);
        }
        let value = if relation.kind == RelationKind::OneToOne {
            loaded.into_iter().next().map_or(Value::Null, Value::Object)
        } else {
            Value::List(loaded.into_iter().map(Value::Object).collect())
        };
        record.insert(name.clone(), value);
    }
    Ok(record)
}
