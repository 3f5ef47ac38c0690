use crate::Condition;
use keel_types::Value;
use serde::{Deserialize, Serialize};

/// A declarative business rule attached to an entity hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub entity: String,
    pub hook: Hook,
    pub definition: RuleDefinition,
    /// Lower runs first within a phase.
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_active")]
    pub active: bool,
    /// A violation of this rule halts its phase and every later phase.
    #[serde(default)]
    pub stop_on_fail: bool,
}

fn default_active() -> bool {
    true
}

impl Rule {
    pub fn phase(&self) -> RulePhase {
        match self.definition {
            RuleDefinition::Field(_) => RulePhase::Field,
            RuleDefinition::Expression(_) => RulePhase::Expression,
            RuleDefinition::Computed(_) => RulePhase::Computed,
        }
    }
}

/// Attachment points evaluated before the write transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hook {
    BeforeWrite,
    BeforeDelete,
}

/// Rule phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RulePhase {
    Field,
    Expression,
    Computed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleDefinition {
    Field(FieldRule),
    Expression(ExpressionRule),
    Computed(ComputedRule),
}

/// A per-field operator check on the incoming payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldRule {
    pub field: String,
    pub operator: FieldOperator,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Constraint a field value must satisfy; failing it is a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldOperator {
    Required,
    Min,
    Max,
    MinLength,
    MaxLength,
    Pattern,
    In,
    NotIn,
}

/// An expression that is violated when it evaluates to `true`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpressionRule {
    pub expression: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_load: Vec<RelatedLoad>,
}

/// Related rows fetched into `related.<relation>` before evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedLoad {
    pub relation: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filter: Vec<Condition>,
}

/// An expression whose result is written into `field`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputedRule {
    pub field: String,
    pub expression: String,
}
