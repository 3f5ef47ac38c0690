use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An outbound webhook subscription on an entity hook.
///
/// Delivery and retry belong to the webhook subsystem; the engine only
/// decides whether a hook fires and builds its payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDefinition {
    pub entity: String,
    pub hook: WebhookHook,
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Fires only when this expression evaluates to `true`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookHook {
    BeforeWrite,
    AfterWrite,
    BeforeDelete,
    AfterDelete,
}

impl WebhookHook {
    /// `before_*` hooks are dispatched synchronously and may veto the write.
    pub fn is_blocking(self) -> bool {
        matches!(self, Self::BeforeWrite | Self::BeforeDelete)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::BeforeWrite => "before_write",
            Self::AfterWrite => "after_write",
            Self::BeforeDelete => "before_delete",
            Self::AfterDelete => "after_delete",
        }
    }
}
