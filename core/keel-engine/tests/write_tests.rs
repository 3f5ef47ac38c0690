mod common;

use common::*;
use keel_engine::{EngineConfig, ErrorCode, Executor, OpKind, Planner, Request, TreeShape};
use keel_engine::write::read_tree;
use keel_model::{Registry, RegistryDocument};
use keel_store::{rows, Store};
use keel_types::{Record, Value};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde_json::json;
use std::collections::HashSet;

fn kinds(plan: &keel_engine::WritePlan) -> Vec<OpKind> {
    plan.operations().iter().map(|op| op.kind.clone()).collect()
}

// ── Planning ─────────────────────────────────────────────────────

#[test]
fn insert_plan_lists_children_then_links() {
    let registry = registry();
    let config = EngineConfig::default();
    let planner = Planner::new(&registry, &config, NOW);
    let invoice = registry.require_entity("invoice").unwrap();
    let payload = record(json!({
        "number": "INV-1",
        "tags": [7, {"id": 8}],
        "items": [{"description": "A"}, {"description": "B", "quantity": 2}]
    }));

    let (fields, nested) = planner.split(invoice, &payload).unwrap();
    assert_eq!(fields, record(json!({"number": "INV-1"})));
    let plan = planner.plan(invoice, OpKind::Insert, fields, &nested).unwrap();

    assert_eq!(
        kinds(&plan),
        vec![
            OpKind::Insert,
            OpKind::Insert,
            OpKind::Insert,
            OpKind::Link { target: Value::Int(7) },
            OpKind::Link { target: Value::Int(8) },
        ]
    );
    assert_eq!(plan.root().children, vec![1, 2, 3, 4]);
    assert_eq!(plan.root().values.get("created_at"), Some(&Value::from(NOW)));
    assert_eq!(plan.get(1).unwrap().values.get("quantity"), Some(&Value::Int(1)));
    assert_eq!(plan.get(2).unwrap().relation.as_deref(), Some("items"));
    assert_eq!(
        plan.shape(),
        &TreeShape {
            relations: vec![("items".into(), TreeShape::default()), ("tags".into(), TreeShape::default())]
        }
    );
}

#[test]
fn replace_sweeps_before_writing() {
    let registry = registry();
    let config = EngineConfig::default();
    let planner = Planner::new(&registry, &config, NOW);
    let invoice = registry.require_entity("invoice").unwrap();
    let nested = record(json!({
        "items": {"write_mode": "replace", "data": [{"id": 5, "quantity": 2}, {"description": "new"}]},
        "tags": {"write_mode": "replace", "data": [3]}
    }));

    let plan = planner
        .plan(invoice, OpKind::Update { key: Value::Int(1) }, Record::new(), &nested)
        .unwrap();
    assert_eq!(
        kinds(&plan),
        vec![
            OpKind::Update { key: Value::Int(1) },
            OpKind::DeleteUnmentioned { keep: vec![Value::Int(5)] },
            OpKind::Update { key: Value::Int(5) },
            OpKind::Insert,
            OpKind::UnlinkUnmentioned { keep: vec![Value::Int(3)] },
            OpKind::Link { target: Value::Int(3) },
        ]
    );
    assert_eq!(plan.get(2).unwrap().values, record(json!({"quantity": 2})));
    assert_eq!(plan.root().values.get("updated_at"), Some(&Value::from(NOW)));
}

#[test]
fn malformed_items_are_rejected() {
    let registry = registry();
    let config = EngineConfig::default();
    let planner = Planner::new(&registry, &config, NOW);
    let invoice = registry.require_entity("invoice").unwrap();
    let plan = |nested: serde_json::Value| {
        planner
            .plan(invoice, OpKind::Insert, record(json!({"number": "INV-1"})), &record(nested))
            .unwrap_err()
            .code()
    };

    assert_eq!(plan(json!({"items": [{"_delete": true}]})), ErrorCode::InvalidPayload);
    assert_eq!(plan(json!({"items": [{"id": 1, "_delete": "yes"}]})), ErrorCode::InvalidPayload);
    assert_eq!(plan(json!({"items": [{"colour": "red"}]})), ErrorCode::UnknownField);
    assert_eq!(plan(json!({"items": [{"quantity": 2}]})), ErrorCode::ValidationFailed);
    assert_eq!(plan(json!({"items": [{"description": "A", "quantity": "two"}]})), ErrorCode::ValidationFailed);
    assert_eq!(plan(json!({"tags": [{"id": 1, "label": "x"}]})), ErrorCode::InvalidPayload);
    assert_eq!(plan(json!({"tags": [{"label": "x"}]})), ErrorCode::InvalidPayload);
    assert_eq!(plan(json!({"tags": [[1]]})), ErrorCode::InvalidPayload);
    assert_eq!(plan(json!({"items": {"data": [], "extra": 1}})), ErrorCode::InvalidPayload);
}

#[test]
fn custom_delete_flag() {
    let registry = registry();
    let config = EngineConfig {
        delete_flag: "$remove".into(),
        ..EngineConfig::default()
    };
    let planner = Planner::new(&registry, &config, NOW);
    let invoice = registry.require_entity("invoice").unwrap();
    let nested = record(json!({"items": [{"id": 4, "$remove": true}]}));
    let plan = planner
        .plan(invoice, OpKind::Update { key: Value::Int(1) }, Record::new(), &nested)
        .unwrap();
    assert_eq!(kinds(&plan)[1], OpKind::Delete { key: Value::Int(4) });

    let nested = record(json!({"items": [{"id": 4, "_delete": true}]}));
    let err = planner
        .plan(invoice, OpKind::Update { key: Value::Int(1) }, Record::new(), &nested)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::UnknownField);
}

// ── Library fixture: depth, cycles and delete policies ───────────

const LIBRARY_DDL: &str = "
    CREATE TABLE authors (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT);
    CREATE TABLE profiles (id INTEGER PRIMARY KEY AUTOINCREMENT, author_id INTEGER, bio TEXT);
    CREATE TABLE books (id INTEGER PRIMARY KEY AUTOINCREMENT, author_id INTEGER, title TEXT);
    CREATE TABLE reviews (id INTEGER PRIMARY KEY AUTOINCREMENT, book_id INTEGER, body TEXT);
    CREATE TABLE shelves (id INTEGER PRIMARY KEY AUTOINCREMENT, label TEXT);
    CREATE TABLE book_shelves (book_id INTEGER NOT NULL, shelf_id INTEGER NOT NULL);
";

fn library_document() -> RegistryDocument {
    serde_json::from_value(json!({
        "entities": [
            {"name": "author", "table": "authors", "primary_key": {"field": "id"},
             "fields": [{"name": "name", "type": "string"}]},
            {"name": "profile", "table": "profiles", "primary_key": {"field": "id"},
             "fields": [{"name": "author_id", "type": "int"}, {"name": "bio", "type": "text"}]},
            {"name": "book", "table": "books", "primary_key": {"field": "id"},
             "fields": [{"name": "author_id", "type": "int"}, {"name": "title", "type": "string"}]},
            {"name": "review", "table": "reviews", "primary_key": {"field": "id"},
             "fields": [{"name": "book_id", "type": "int"}, {"name": "body", "type": "text"}]},
            {"name": "shelf", "table": "shelves", "primary_key": {"field": "id"},
             "fields": [{"name": "label", "type": "string"}]}
        ],
        "relations": [
            {"name": "books", "type": "one_to_many", "source": "author", "target": "book",
             "target_key": "author_id", "on_delete": "set_null"},
            {"name": "profile", "type": "one_to_one", "source": "author", "target": "profile",
             "target_key": "author_id", "on_delete": "detach"},
            {"name": "reviews", "type": "one_to_many", "source": "book", "target": "review",
             "target_key": "book_id", "on_delete": "cascade"},
            {"name": "shelves", "type": "many_to_many", "source": "book", "target": "shelf",
             "join_table": {"table": "book_shelves", "source_column": "book_id", "target_column": "shelf_id"}},
            {"name": "author", "type": "one_to_one", "source": "book", "target": "author",
             "source_key": "author_id", "target_key": "id", "ownership": "target"}
        ]
    }))
    .unwrap()
}

fn library() -> (Registry, Store) {
    let store = Store::open_in_memory().unwrap();
    store.execute_batch(LIBRARY_DDL).unwrap();
    (Registry::from_document(library_document()).unwrap(), store)
}

/// Plans and executes an insert of `payload` as `entity`, returning the
/// written tree.
fn write(registry: &Registry, store: &Store, config: &EngineConfig, entity: &str, payload: serde_json::Value) -> Record {
    let def = registry.require_entity(entity).unwrap();
    let planner = Planner::new(registry, config, NOW);
    let (fields, nested) = planner.split(def, &record(payload)).unwrap();
    let plan = planner.plan(def, OpKind::Insert, fields, &nested).unwrap();
    store
        .transaction(|tx| {
            let key = Executor::new(registry, tx, NOW).execute(&plan)?;
            let row = rows::find(tx, def, &key)?.unwrap();
            read_tree(tx, registry, def, row, plan.shape())
        })
        .unwrap()
}

fn count(store: &Store, table: &str) -> i64 {
    store
        .read(|conn| {
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                .map_err(keel_store::StoreError::from)
        })
        .unwrap()
}

#[test]
fn nesting_depth_is_capped() {
    let (registry, store) = library();
    let shallow = EngineConfig {
        max_nesting_depth: 1,
        ..EngineConfig::default()
    };
    let payload = json!({"name": "Le Guin", "books": [{"title": "Lathe", "reviews": [{"body": "yes"}]}]});

    let def = registry.require_entity("author").unwrap();
    let planner = Planner::new(&registry, &shallow, NOW);
    let (fields, nested) = planner.split(def, &record(payload.clone())).unwrap();
    let err = planner.plan(def, OpKind::Insert, fields, &nested).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidPayload);

    let tree = write(&registry, &store, &EngineConfig::default(), "author", payload);
    let books = tree.get("books").and_then(Value::as_list).unwrap();
    let reviews = books[0].as_object().unwrap().get("reviews").and_then(Value::as_list).unwrap();
    assert_eq!(reviews.len(), 1);
}

#[test]
fn relations_not_owned_by_the_source_are_refused() {
    let (registry, _) = library();
    let config = EngineConfig::default();
    let planner = Planner::new(&registry, &config, NOW);
    let book = registry.require_entity("book").unwrap();
    let err = planner
        .plan(book, OpKind::Insert, Record::new(), &record(json!({"author": {"name": "x"}})))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidPayload);
}

#[test]
fn circular_nesting_is_refused() {
    let mut doc = library_document();
    doc.relations.push(
        serde_json::from_value(json!({
            "name": "books_by_author", "type": "one_to_many", "source": "profile", "target": "book",
            "source_key": "author_id", "target_key": "author_id"
        }))
        .unwrap(),
    );
    doc.relations.push(
        serde_json::from_value(json!({
            "name": "profiles", "type": "one_to_many", "source": "book", "target": "profile",
            "source_key": "author_id", "target_key": "author_id"
        }))
        .unwrap(),
    );
    let registry = Registry::from_document(doc).unwrap();
    let config = EngineConfig::default();
    let planner = Planner::new(&registry, &config, NOW);
    let profile = registry.require_entity("profile").unwrap();
    let nested = record(json!({"books_by_author": [{"title": "t", "profiles": [{"bio": "again"}]}]}));

    let err = planner.plan(profile, OpKind::Insert, Record::new(), &nested).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidPayload);
    assert!(err.to_string().contains("circular"));
}

#[test]
fn one_to_one_reads_back_as_an_object() {
    let (registry, store) = library();
    let config = EngineConfig::default();
    let with = write(&registry, &store, &config, "author", json!({"name": "A", "profile": {"bio": "hi"}}));
    let profile = with.get("profile").and_then(Value::as_object).unwrap();
    assert_eq!(profile.get("bio"), Some(&Value::from("hi")));
    assert_eq!(profile.get("author_id"), Some(&key(&with)));

    let without = write(&registry, &store, &config, "author", json!({"name": "B", "profile": []}));
    assert_eq!(without.get("profile"), Some(&Value::Null));

    let planner = Planner::new(&registry, &config, NOW);
    let author = registry.require_entity("author").unwrap();
    let err = planner
        .plan(author, OpKind::Insert, Record::new(), &record(json!({"profile": [{"bio": "a"}, {"bio": "b"}]})))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidPayload);
}

#[test]
fn delete_policies() {
    let (registry, store) = library();
    let config = EngineConfig::default();
    let shelf = write(&registry, &store, &config, "shelf", json!({"label": "fiction"}));
    let author = write(
        &registry,
        &store,
        &config,
        "author",
        json!({
            "name": "Le Guin",
            "profile": {"bio": "writer"},
            "books": [{"title": "Lathe", "reviews": [{"body": "good"}, {"body": "great"}], "shelves": [key(&shelf)]}]
        }),
    );
    let book_key = author.get("books").and_then(Value::as_list).unwrap()[0]
        .as_object()
        .unwrap()
        .get("id")
        .cloned()
        .unwrap();
    assert_eq!(count(&store, "book_shelves"), 1);

    // set_null on books, detach on profile.
    let author_def = registry.require_entity("author").unwrap();
    store
        .transaction(|tx| {
            let row = rows::find(tx, author_def, &key(&author))?.unwrap();
            Executor::new(&registry, tx, NOW).delete_row(author_def, &row, &mut HashSet::new())
        })
        .unwrap();
    let book_def = registry.require_entity("book").unwrap();
    let book = store.read(|conn| rows::find(conn, book_def, &book_key)).unwrap().unwrap();
    assert_eq!(book.get("author_id"), Some(&Value::Null));
    assert_eq!(count(&store, "profiles"), 1);

    // cascade to reviews, join rows dropped.
    store
        .transaction(|tx| Executor::new(&registry, tx, NOW).delete_row(book_def, &book, &mut HashSet::new()))
        .unwrap();
    assert_eq!(count(&store, "reviews"), 0);
    assert_eq!(count(&store, "book_shelves"), 0);
    assert_eq!(count(&store, "shelves"), 1);
}

#[test]
fn deleting_a_link_target_drops_its_join_rows() {
    let (registry, store) = library();
    let config = EngineConfig::default();
    let shelf = write(&registry, &store, &config, "shelf", json!({"label": "fiction"}));
    write(&registry, &store, &config, "book", json!({"title": "Lathe", "shelves": [key(&shelf)]}));
    assert_eq!(count(&store, "book_shelves"), 1);

    let shelf_def = registry.require_entity("shelf").unwrap();
    store
        .transaction(|tx| {
            Executor::new(&registry, tx, NOW).delete_row(shelf_def, &shelf, &mut HashSet::new())
        })
        .unwrap();
    assert_eq!(count(&store, "book_shelves"), 0);
    assert_eq!(count(&store, "books"), 1);
}

// ── Write modes through the pipeline ─────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Mention {
    Omit,
    Keep,
    Flag,
}

fn mention() -> impl Strategy<Value = Mention> {
    prop_oneof![Just(Mention::Omit), Just(Mention::Keep), Just(Mention::Flag)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn write_modes_reconcile_children(
        mentions in prop::collection::vec(mention(), 1..5),
        added in 0usize..3,
        mode in prop_oneof![Just("diff"), Just("replace"), Just("append")],
    ) {
        let (pipeline, _) = pipeline();
        let existing: Vec<serde_json::Value> = (0..mentions.len())
            .map(|i| json!({"description": format!("old {i}")}))
            .collect();
        let invoice = pipeline
            .handle(Request::create("invoice", record(json!({"number": "INV-1", "items": existing})), staff()))
            .unwrap();
        let ids: Vec<Value> = invoice.get("items").and_then(Value::as_list).unwrap()
            .iter()
            .map(|i| i.as_object().unwrap().get("id").cloned().unwrap())
            .collect();

        let mut data = Vec::new();
        let mut expected = Vec::new();
        for (i, (m, id)) in mentions.iter().zip(&ids).enumerate() {
            let survives = match (m, mode) {
                (_, "append") => true,
                (Mention::Flag, _) => false,
                (Mention::Omit, "replace") => false,
                _ => true,
            };
            match m {
                Mention::Omit => {}
                Mention::Keep => data.push(json!({"id": id})),
                Mention::Flag => data.push(json!({"id": id, "_delete": true})),
            }
            if survives {
                expected.push(format!("old {i}"));
            }
        }
        for n in 0..added {
            data.push(json!({"description": format!("new {n}")}));
            expected.push(format!("new {n}"));
        }

        let tree = pipeline
            .handle(Request::update(
                "invoice",
                key(&invoice),
                record(json!({"items": {"write_mode": mode, "data": data}})),
                staff(),
            ))
            .unwrap();
        let remaining: Vec<String> = tree.get("items").and_then(Value::as_list).unwrap()
            .iter()
            .map(|i| i.as_object().unwrap().get("description").unwrap().to_string())
            .collect();
        prop_assert_eq!(remaining, expected);
    }
}
