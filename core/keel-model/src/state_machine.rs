use keel_types::{Record, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Governs the allowed values of one field of an entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMachineDefinition {
    pub entity: String,
    pub field: String,
    pub initial: String,
    /// Ordered; the first matching transition wins.
    pub transitions: Vec<Transition>,
}

impl StateMachineDefinition {
    /// Finds the transition from `from` to `to`, if one is declared.
    pub fn find_transition(&self, from: &str, to: &str) -> Option<&Transition> {
        self.transitions
            .iter()
            .find(|t| t.to == to && t.from.contains(from))
    }

    /// Every state named anywhere in the machine.
    pub fn states(&self) -> Vec<&str> {
        let mut states = vec![self.initial.as_str()];
        for t in &self.transitions {
            for s in t.from.iter().chain(std::iter::once(t.to.as_str())) {
                if !states.contains(&s) {
                    states.push(s);
                }
            }
        }
        states
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub from: FromStates,
    pub to: String,
    /// Roles allowed to take this transition. Empty means any caller.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Must evaluate to `true` for the transition to proceed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,
    #[serde(default)]
    pub actions: Vec<TransitionAction>,
}

/// A transition source: one state or several.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FromStates {
    One(String),
    Many(Vec<String>),
}

impl FromStates {
    pub fn contains(&self, state: &str) -> bool {
        match self {
            Self::One(s) => s == state,
            Self::Many(states) => states.iter().any(|s| s == state),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let slice: &[String] = match self {
            Self::One(s) => std::slice::from_ref(s),
            Self::Many(states) => states,
        };
        slice.iter().map(String::as_str)
    }
}

/// Effects of a completed transition. `set_field` applies in place; the
/// others are handed to external collaborators after commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransitionAction {
    SetField {
        field: String,
        /// The text `"now"` resolves to the evaluation time.
        value: Value,
    },
    Webhook {
        url: String,
        #[serde(default = "default_method")]
        method: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
    },
    CreateRecord {
        entity: String,
        #[serde(default)]
        data: Record,
    },
    SendEvent {
        event: String,
        #[serde(default)]
        payload: Record,
    },
}

fn default_method() -> String {
    "POST".to_string()
}
