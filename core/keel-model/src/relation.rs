use serde::{Deserialize, Serialize};
use std::fmt;

/// A declared association between two entities.
///
/// For one-to-many and one-to-one relations owned by the source, the child
/// row in `target` carries `target_key`, a foreign key holding the parent's
/// `source_key` value. Many-to-many relations go through `join_table`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: RelationKind,
    pub source: String,
    pub target: String,
    #[serde(default = "default_source_key")]
    pub source_key: String,
    #[serde(default)]
    pub target_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_table: Option<JoinTable>,
    #[serde(default)]
    pub ownership: Ownership,
    #[serde(default)]
    pub on_delete: OnDelete,
    #[serde(default)]
    pub default_write_mode: WriteMode,
}

fn default_source_key() -> String {
    "id".to_string()
}

impl RelationDefinition {
    pub fn is_many_to_many(&self) -> bool {
        self.kind == RelationKind::ManyToMany
    }

    /// Whether nested payloads may write through this relation from the
    /// source side.
    pub fn accepts_nested_writes(&self) -> bool {
        self.is_many_to_many() || self.ownership == Ownership::Source
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    OneToMany,
    OneToOne,
    ManyToMany,
}

/// Join table for many-to-many relations. Join rows carry no business data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinTable {
    pub table: String,
    pub source_column: String,
    pub target_column: String,
}

/// Which side owns the foreign key and therefore the nested write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ownership {
    #[default]
    Source,
    Target,
    None,
}

/// What happens to children when their parent row is deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnDelete {
    /// Delete children too (soft or hard per the child entity).
    Cascade,
    /// Clear the children's foreign key.
    SetNull,
    /// Refuse the delete while live children exist.
    #[default]
    Restrict,
    /// Leave children as they are.
    Detach,
}

/// How a nested child collection reconciles against payload data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Update keyed items, insert unkeyed ones, delete flagged ones.
    #[default]
    Diff,
    /// Diff, then delete every existing child the payload did not mention.
    Replace,
    /// Insert unkeyed items only.
    Append,
}

impl WriteMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "diff" => Some(Self::Diff),
            "replace" => Some(Self::Replace),
            "append" => Some(Self::Append),
            _ => None,
        }
    }
}

impl fmt::Display for WriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Diff => "diff",
            Self::Replace => "replace",
            Self::Append => "append",
        })
    }
}
