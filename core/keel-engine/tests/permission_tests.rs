mod common;

use common::*;
use keel_engine::{Decision, PermissionEvaluator, ReadScope};
use keel_model::Action;
use keel_types::{Record, UserContext};
use pretty_assertions::assert_eq;
use serde_json::json;

const ADMIN: &str = "admin";

// ── Role grants ──────────────────────────────────────────────────

#[test]
fn grants_are_a_whitelist() {
    let registry = registry();
    let permissions = PermissionEvaluator::new(&registry, ADMIN);

    assert!(permissions.has_role_grant(&staff(), "invoice", Action::Delete));
    assert!(!permissions.has_role_grant(&manager(), "invoice", Action::Delete));
    assert!(!permissions.has_role_grant(&staff(), "tag", Action::Delete));
    assert!(!permissions.has_role_grant(&nobody(), "invoice", Action::Read));
    assert!(permissions.has_role_grant(&admin(), "tag", Action::Delete));
}

#[test]
fn matching_policies_intersect_roles() {
    let registry = registry();
    let permissions = PermissionEvaluator::new(&registry, ADMIN);
    let both = UserContext::new("u-both", ["staff", "accountant"]);

    assert_eq!(permissions.matching(&both, "invoice", Action::Read).len(), 2);
    assert_eq!(permissions.matching(&accountant(), "invoice", Action::Read).len(), 1);
    assert!(permissions.matching(&accountant(), "invoice", Action::Update).is_empty());
}

// ── Full checks ──────────────────────────────────────────────────

#[test]
fn create_ignores_conditions() {
    let registry = registry();
    let permissions = PermissionEvaluator::new(&registry, ADMIN);
    let invoice = registry.require_entity("invoice").unwrap();
    let clerk = UserContext::new("u-clerk", ["clerk"]);

    let decision = permissions.authorize(&clerk, invoice, Action::Create, None).unwrap();
    assert_eq!(decision, Decision::Allow);
}

#[test]
fn conditional_policies_check_the_current_row() {
    let registry = registry();
    let permissions = PermissionEvaluator::new(&registry, ADMIN);
    let invoice = registry.require_entity("invoice").unwrap();
    let clerk = UserContext::new("u-clerk", ["clerk"]);
    let own = record(json!({"id": 1, "created_by": "u-clerk"}));
    let other = record(json!({"id": 2, "created_by": "u-staff"}));

    let check = |row: Option<&Record>| permissions.authorize(&clerk, invoice, Action::Update, row).unwrap();
    assert_eq!(check(Some(&own)), Decision::Allow);
    assert_eq!(check(Some(&other)), Decision::Deny);
    assert_eq!(check(None), Decision::Deny);
}

#[test]
fn unconditional_policy_wins_over_conditional() {
    let registry = registry();
    let permissions = PermissionEvaluator::new(&registry, ADMIN);
    let invoice = registry.require_entity("invoice").unwrap();
    let clerk_and_manager = UserContext::new("u-cm", ["clerk", "manager"]);
    let other = record(json!({"id": 2, "created_by": "u-staff"}));

    let decision = permissions
        .authorize(&clerk_and_manager, invoice, Action::Update, Some(&other))
        .unwrap();
    assert!(decision.is_allowed());
}

#[test]
fn admin_bypasses_everything() {
    let registry = registry();
    let permissions = PermissionEvaluator::new(&registry, ADMIN);
    let tag = registry.require_entity("tag").unwrap();
    assert_eq!(permissions.authorize(&admin(), tag, Action::Delete, None).unwrap(), Decision::Allow);
    assert_eq!(permissions.read_filter(&admin(), tag).unwrap(), ReadScope::Unrestricted);
}

#[test]
fn admin_role_is_configurable() {
    let registry = registry();
    let permissions = PermissionEvaluator::new(&registry, "root");
    let invoice = registry.require_entity("invoice").unwrap();
    assert!(!permissions.is_admin(&admin()));
    assert_eq!(
        permissions.authorize(&admin(), invoice, Action::Delete, None).unwrap(),
        Decision::Deny
    );
}

// ── Read scopes ──────────────────────────────────────────────────

#[test]
fn read_scopes() {
    let registry = registry();
    let permissions = PermissionEvaluator::new(&registry, ADMIN);
    let invoice = registry.require_entity("invoice").unwrap();

    assert_eq!(permissions.read_filter(&staff(), invoice).unwrap(), ReadScope::Unrestricted);
    assert_eq!(permissions.read_filter(&nobody(), invoice).unwrap(), ReadScope::DenyAll);

    let ReadScope::Restricted(scope) = permissions.read_filter(&accountant(), invoice).unwrap() else {
        panic!("accountant reads should be restricted");
    };
    assert_eq!(scope.sql, "((\"status\" IN (?, ?, ?)))");
    assert_eq!(scope.params.len(), 3);
}

#[test]
fn conditional_read_of_a_row_is_checked_in_memory() {
    let registry = registry();
    let permissions = PermissionEvaluator::new(&registry, ADMIN);
    let invoice = registry.require_entity("invoice").unwrap();
    let void = record(json!({"id": 1, "status": "void"}));
    let sent = record(json!({"id": 2, "status": "sent"}));

    let read = |row: Option<&Record>| permissions.authorize(&accountant(), invoice, Action::Read, row).unwrap();
    assert_eq!(read(Some(&void)), Decision::Deny);
    assert_eq!(read(Some(&sent)), Decision::Allow);
    assert_eq!(read(None), Decision::Allow);
}
