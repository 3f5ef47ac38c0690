use crate::{Record, Value};
use serde::{Deserialize, Serialize};

/// The authenticated caller a request runs as.
///
/// Identity and roles are supplied by the outer HTTP layer; token mechanics
/// live there, not here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContext {
    pub id: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl UserContext {
    pub fn new(id: impl Into<String>, roles: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            id: id.into(),
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// True when any of `roles` is held by this user.
    pub fn has_any_role(&self, roles: &[String]) -> bool {
        roles.iter().any(|r| self.has_role(r))
    }

    /// The `user` root of the expression environment: `{id, roles}`.
    pub fn to_value(&self) -> Value {
        let mut record = Record::new();
        record.insert("id", self.id.clone());
        record.insert(
            "roles",
            Value::List(self.roles.iter().cloned().map(Value::Text).collect()),
        );
        Value::Object(record)
    }
}
