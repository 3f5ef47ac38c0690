mod common;

use common::*;
use keel_engine::filter::{compile, like_match};
use keel_engine::ErrorCode;
use keel_model::{Condition, FilterOperator, Registry};
use keel_store::{rows, Store};
use keel_types::{UserContext, Value};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde_json::json;

/// Four invoices with a mix of present and nil columns.
fn seeded() -> (Registry, Store) {
    let registry = registry();
    let store = store();
    let invoice = registry.require_entity("invoice").unwrap();
    store
        .transaction(|tx| {
            for row in [
                json!({"number": "INV-1", "status": "draft", "total": 10.0, "created_by": "u-staff"}),
                json!({"number": "INV-2", "status": "sent", "total": 20.5}),
                json!({"number": "inv-3", "status": "paid"}),
                json!({"number": "INV-4", "status": "void", "total": 0.0, "created_by": "u-acct"}),
            ] {
                rows::insert(tx, invoice, &record(row))?;
            }
            Ok::<_, keel_store::StoreError>(())
        })
        .unwrap();
    (registry, store)
}

/// Runs `conditions` through SQL and through the in-memory predicate and
/// returns the matching keys after checking that both agree.
fn agree(registry: &Registry, store: &Store, user: &UserContext, conditions: &[Condition]) -> Vec<i64> {
    let invoice = registry.require_entity("invoice").unwrap();
    let filter = compile(invoice, conditions, user).unwrap();
    let ids = |rows: Vec<keel_types::Record>| -> Vec<i64> {
        rows.iter().filter_map(|r| r.get("id").and_then(Value::as_i64)).collect()
    };

    let by_sql = ids(store.read(|conn| rows::select(conn, invoice, Some(filter.sql()))).unwrap());
    let everything = store.read(|conn| rows::select(conn, invoice, None)).unwrap();
    let in_memory = ids(everything.into_iter().filter(|r| filter.matches(r)).collect());
    assert_eq!(by_sql, in_memory, "conditions {conditions:?}");
    by_sql
}

fn cond(field: &str, op: FilterOperator, value: serde_json::Value) -> Condition {
    Condition::new(field, op, Value::from_json(value))
}

// ── SQL and memory agree ─────────────────────────────────────────

#[test]
fn comparisons() {
    let (registry, store) = seeded();
    let user = staff();
    let check = |c: Condition| agree(&registry, &store, &user, &[c]);

    assert_eq!(check(cond("status", FilterOperator::Eq, json!("sent"))), vec![2]);
    assert_eq!(check(cond("status", FilterOperator::Neq, json!("sent"))), vec![1, 3, 4]);
    assert_eq!(check(cond("total", FilterOperator::Gt, json!(10))), vec![2]);
    assert_eq!(check(cond("total", FilterOperator::Gte, json!(10))), vec![1, 2]);
    assert_eq!(check(cond("total", FilterOperator::Lt, json!(5))), vec![4]);
    assert_eq!(check(cond("total", FilterOperator::Lte, json!(20.5))), vec![1, 2, 4]);
}

#[test]
fn nil_handling() {
    let (registry, store) = seeded();
    let user = staff();
    let check = |c: Condition| agree(&registry, &store, &user, &[c]);

    assert_eq!(check(cond("created_by", FilterOperator::Eq, json!(null))), vec![2, 3]);
    assert_eq!(check(cond("created_by", FilterOperator::Neq, json!(null))), vec![1, 4]);
    assert_eq!(check(cond("created_by", FilterOperator::Neq, json!("u-staff"))), vec![4]);
    assert_eq!(check(cond("total", FilterOperator::Gt, json!(null))), Vec::<i64>::new());
}

#[test]
fn membership() {
    let (registry, store) = seeded();
    let user = staff();
    let check = |c: Condition| agree(&registry, &store, &user, &[c]);

    assert_eq!(check(cond("status", FilterOperator::In, json!(["draft", "void"]))), vec![1, 4]);
    assert_eq!(check(cond("status", FilterOperator::NotIn, json!(["draft", "void"]))), vec![2, 3]);
    assert_eq!(check(cond("status", FilterOperator::In, json!([]))), Vec::<i64>::new());
    assert_eq!(check(cond("created_by", FilterOperator::NotIn, json!([]))), vec![1, 2, 3, 4]);
    assert_eq!(check(cond("created_by", FilterOperator::In, json!(["u-staff", null]))), vec![1]);
}

#[test]
fn like_ignores_ascii_case() {
    let (registry, store) = seeded();
    let user = staff();
    let check = |c: Condition| agree(&registry, &store, &user, &[c]);

    assert_eq!(check(cond("number", FilterOperator::Like, json!("inv-%"))), vec![1, 2, 3, 4]);
    assert_eq!(check(cond("number", FilterOperator::Like, json!("INV-_"))), vec![1, 2, 3, 4]);
    assert_eq!(check(cond("number", FilterOperator::Like, json!("%3"))), vec![3]);
}

#[test]
fn conditions_are_a_conjunction() {
    let (registry, store) = seeded();
    let both = [
        cond("status", FilterOperator::In, json!(["draft", "sent", "paid"])),
        cond("total", FilterOperator::Gte, json!(0)),
    ];
    assert_eq!(agree(&registry, &store, &staff(), &both), vec![1, 2]);
    assert_eq!(agree(&registry, &store, &staff(), &[]), vec![1, 2, 3, 4]);
}

#[test]
fn user_references_resolve_per_caller() {
    let (registry, store) = seeded();
    let mine = [cond("created_by", FilterOperator::Eq, json!("$user.id"))];
    assert_eq!(agree(&registry, &store, &staff(), &mine), vec![1]);
    assert_eq!(agree(&registry, &store, &accountant(), &mine), vec![4]);

    // An unknown attribute resolves to nil.
    let missing = [cond("created_by", FilterOperator::Eq, json!("$user.department"))];
    assert_eq!(agree(&registry, &store, &staff(), &missing), vec![2, 3]);
}

// ── Rejections ───────────────────────────────────────────────────

#[test]
fn unknown_columns_are_rejected() {
    let registry = registry();
    let invoice = registry.require_entity("invoice").unwrap();
    let err = compile(invoice, &[cond("colour", FilterOperator::Eq, json!("red"))], &staff()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::UnknownField);
}

#[test]
fn like_needs_a_string_pattern() {
    let registry = registry();
    let invoice = registry.require_entity("invoice").unwrap();
    let err = compile(invoice, &[cond("number", FilterOperator::Like, json!(5))], &staff()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidPayload);
}

// ── like_match ───────────────────────────────────────────────────

#[test]
fn like_match_basics() {
    assert!(like_match("invoice", "inv%"));
    assert!(like_match("Invoice", "%VOICE"));
    assert!(like_match("abc", "a_c"));
    assert!(like_match("", "%"));
    assert!(!like_match("", "_"));
    assert!(!like_match("abc", "ab"));
    assert!(like_match("a%c", "a%%c"));
}

proptest! {
    #[test]
    fn like_match_agrees_with_sqlite(text in "[aAbB%_]{0,6}", pattern in "[aAbB%_]{0,5}") {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let sqlite: bool = conn
            .query_row("SELECT ?1 LIKE ?2", rusqlite::params![text, pattern], |row| row.get(0))
            .unwrap();
        prop_assert_eq!(like_match(&text, &pattern), sqlite);
    }
}
