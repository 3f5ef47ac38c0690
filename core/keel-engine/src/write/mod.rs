//! Nested writes: a payload tree becomes a [`WritePlan`], an arena of
//! operations linked by index, which the [`Executor`] runs inside one
//! transaction.
//!
//! Planning does every check that needs no database access (shape,
//! defaults, timestamps, relation ownership, cycles, depth), so a rejected
//! payload never reaches the store.

mod exec;
mod plan;

pub use exec::{read_tree, Executor};
pub use plan::{OpKind, Operation, ParentLink, Planner, TreeShape, WritePlan};

use crate::{EngineError, ErrorDetail};
use keel_model::{AutoTimestamp, EntityDefinition, ShapeError};
use keel_types::{Record, Value};

/// Maps a shape check failure onto the error a caller sees.
pub(crate) fn shape_error(entity: &EntityDefinition, err: ShapeError) -> EngineError {
    match err {
        ShapeError::UnknownField(field) => EngineError::UnknownField {
            entity: entity.name.clone(),
            field,
        },
        ShapeError::InvalidValue { field, message } => EngineError::Validation {
            details: vec![ErrorDetail::new(Some(&field), "type", message)],
        },
    }
}

/// Fills absent fields that declare a default.
pub fn apply_defaults(entity: &EntityDefinition, record: &mut Record) {
    for spec in &entity.fields {
        if let Some(default) = &spec.default {
            if !record.contains_key(&spec.name) {
                record.insert(spec.name.clone(), default.clone());
            }
        }
    }
}

/// Stamps auto-timestamp fields with `now`.
pub fn stamp(entity: &EntityDefinition, record: &mut Record, now: &str, inserting: bool) {
    for spec in &entity.fields {
        match spec.auto {
            Some(AutoTimestamp::OnCreate) if inserting => {
                record.insert(spec.name.clone(), now);
            }
            Some(AutoTimestamp::OnUpdate) => {
                record.insert(spec.name.clone(), now);
            }
            _ => {}
        }
    }
}

/// Required fields that are absent or nil. Auto-maintained fields and the
/// names in `skip` are filled in later and never reported.
pub fn missing_required(entity: &EntityDefinition, record: &Record, skip: &[&str]) -> Vec<ErrorDetail> {
    entity
        .fields
        .iter()
        .filter(|spec| spec.required && spec.auto.is_none() && !skip.contains(&spec.name.as_str()))
        .filter(|spec| record.get(&spec.name).is_none_or(Value::is_null))
        .map(|spec| {
            ErrorDetail::new(
                Some(&spec.name),
                "required",
                format!("`{}` is required", spec.name),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_model::{FieldSpec, KeyGeneration, PrimaryKeySpec};

    fn note() -> EntityDefinition {
        EntityDefinition {
            name: "note".into(),
            table: "notes".into(),
            primary_key: PrimaryKeySpec {
                field: "id".into(),
                generation: KeyGeneration::Auto,
            },
            fields: vec![
                FieldSpec::string("title").required(),
                FieldSpec::string("state").with_default("open"),
                FieldSpec::timestamp("created_at").with_auto(AutoTimestamp::OnCreate),
                FieldSpec::timestamp("updated_at").with_auto(AutoTimestamp::OnUpdate).required(),
            ],
            soft_delete: None,
        }
    }

    #[test]
    fn defaults_fill_only_absent_fields() {
        let mut record = Record::new();
        record.insert("state", Value::Null);
        apply_defaults(&note(), &mut record);
        assert_eq!(record.get("state"), Some(&Value::Null));

        let mut record = Record::new();
        apply_defaults(&note(), &mut record);
        assert_eq!(record.get("state"), Some(&Value::from("open")));
    }

    #[test]
    fn stamps_follow_insert_or_update() {
        let mut record = Record::new();
        stamp(&note(), &mut record, "T1", true);
        assert_eq!(record.get("created_at"), Some(&Value::from("T1")));

        let mut record = Record::new();
        stamp(&note(), &mut record, "T2", false);
        assert!(record.get("created_at").is_none());
        assert_eq!(record.get("updated_at"), Some(&Value::from("T2")));
    }

    #[test]
    fn required_skips_auto_and_named_fields() {
        let missing = missing_required(&note(), &Record::new(), &[]);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].field.as_deref(), Some("title"));
        assert!(missing_required(&note(), &Record::new(), &["title"]).is_empty());
    }
}
