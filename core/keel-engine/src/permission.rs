//! Whitelist permission evaluation.
//!
//! Access exists only where a policy grants it. Policies for an
//! (entity, action) pair apply when their roles intersect the caller's; the
//! decision is the OR of every applicable policy. The admin role bypasses
//! all checks.

use crate::filter;
use crate::EngineResult;
use keel_model::{Action, EntityDefinition, PermissionPolicy, Registry};
use keel_store::SqlFragment;
use keel_types::{Record, UserContext};
use tracing::{debug, warn};

/// Outcome of an authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        self == Decision::Allow
    }
}

/// Row visibility for reads.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadScope {
    /// Every live row is visible.
    Unrestricted,
    /// Only rows matching this predicate are visible.
    Restricted(SqlFragment),
    /// No policy grants read access.
    DenyAll,
}

/// Evaluates policies from one registry snapshot.
pub struct PermissionEvaluator<'a> {
    registry: &'a Registry,
    admin_role: &'a str,
}

impl<'a> PermissionEvaluator<'a> {
    pub fn new(registry: &'a Registry, admin_role: &'a str) -> Self {
        Self {
            registry,
            admin_role,
        }
    }

    pub fn is_admin(&self, user: &UserContext) -> bool {
        user.has_role(self.admin_role)
    }

    /// Policies for `(entity, action)` whose roles intersect the caller's.
    pub fn matching(&self, user: &UserContext, entity: &str, action: Action) -> Vec<&'a PermissionPolicy> {
        self.registry
            .policies(entity, action)
            .iter()
            .filter(|p| user.has_any_role(&p.roles))
            .collect()
    }

    /// Role-only check: does any policy for this action apply to the caller?
    /// Runs before the current row is loaded.
    pub fn has_role_grant(&self, user: &UserContext, entity: &str, action: Action) -> bool {
        self.is_admin(user) || !self.matching(user, entity, action).is_empty()
    }

    /// Full check. Create ignores policy conditions; for other actions a
    /// conditional policy passes only when `current` satisfies it.
    pub fn authorize(
        &self,
        user: &UserContext,
        entity: &EntityDefinition,
        action: Action,
        current: Option<&Record>,
    ) -> EngineResult<Decision> {
        if self.is_admin(user) {
            return Ok(Decision::Allow);
        }
        let policies = self.matching(user, &entity.name, action);
        let decision = if policies.is_empty() {
            Decision::Deny
        } else if action == Action::Create || policies.iter().any(|p| !p.is_conditional()) {
            Decision::Allow
        } else {
            match current {
                Some(record) => {
                    let mut allowed = false;
                    for policy in &policies {
                        if filter::compile(entity, &policy.conditions, user)?.matches(record) {
                            allowed = true;
                            break;
                        }
                    }
                    if allowed { Decision::Allow } else { Decision::Deny }
                }
                // Conditions cannot be checked without the row; reads of
                // collections go through `read_filter` instead.
                None if action == Action::Read => Decision::Allow,
                None => Decision::Deny,
            }
        };
        if decision == Decision::Deny {
            warn!("Policy denied {} on {} for user {}", action, entity.name, user.id);
        }
        Ok(decision)
    }

    /// The extra predicate a read by `user` must carry.
    pub fn read_filter(&self, user: &UserContext, entity: &EntityDefinition) -> EngineResult<ReadScope> {
        if self.is_admin(user) {
            return Ok(ReadScope::Unrestricted);
        }
        let policies = self.matching(user, &entity.name, Action::Read);
        if policies.is_empty() {
            warn!("Policy denied read on {} for user {}", entity.name, user.id);
            return Ok(ReadScope::DenyAll);
        }
        if policies.iter().any(|p| !p.is_conditional()) {
            return Ok(ReadScope::Unrestricted);
        }
        let mut alternatives = Vec::with_capacity(policies.len());
        for policy in policies {
            alternatives.push(filter::compile(entity, &policy.conditions, user)?.into_sql());
        }
        debug!(entity = %entity.name, policies = alternatives.len(), "restricting read");
        Ok(ReadScope::Restricted(SqlFragment::any(alternatives)))
    }
}
