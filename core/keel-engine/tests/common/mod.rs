//! Shared invoicing fixture: customers, invoices with line items and tags,
//! an invoice status workflow, and role-based policies.

#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use keel_engine::{EngineConfig, Pipeline, RecordingSink, WebhookGate, WebhookRequest};
use keel_model::{Registry, RegistryDocument, RegistryHandle};
use keel_store::Store;
use keel_types::{FixedClock, Record, UserContext, Value};
use serde_json::json;
use std::sync::{Arc, Mutex};

pub const NOW: &str = "2026-03-01T12:00:00.000Z";

pub const DDL: &str = "
    CREATE TABLE customers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL
    );
    CREATE TABLE invoices (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        number TEXT NOT NULL UNIQUE,
        customer_id INTEGER,
        status TEXT NOT NULL,
        total REAL,
        payment_amount REAL,
        balance REAL,
        paid_at TEXT,
        created_by TEXT,
        created_at TEXT,
        updated_at TEXT,
        deleted_at TEXT
    );
    CREATE TABLE items (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        invoice_id INTEGER,
        description TEXT NOT NULL,
        quantity INTEGER,
        unit_price REAL
    );
    CREATE TABLE tags (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        label TEXT NOT NULL
    );
    CREATE TABLE invoice_tags (
        invoice_id INTEGER NOT NULL,
        tag_id INTEGER NOT NULL
    );
";

pub fn document() -> RegistryDocument {
    serde_json::from_value(json!({
        "entities": [
            {"name": "customer", "table": "customers", "primary_key": {"field": "id"},
             "fields": [{"name": "name", "type": "string", "required": true}]},
            {"name": "invoice", "table": "invoices", "primary_key": {"field": "id"},
             "soft_delete": {"field": "deleted_at"},
             "fields": [
                {"name": "number", "type": "string", "required": true, "unique": true},
                {"name": "customer_id", "type": "int"},
                {"name": "status", "type": "string", "enum": ["draft", "sent", "paid", "void"]},
                {"name": "total", "type": "decimal", "precision": 2, "default": 0},
                {"name": "payment_amount", "type": "decimal", "precision": 2},
                {"name": "balance", "type": "decimal", "precision": 2},
                {"name": "paid_at", "type": "timestamp"},
                {"name": "created_by", "type": "string"},
                {"name": "created_at", "type": "timestamp", "auto": "on_create"},
                {"name": "updated_at", "type": "timestamp", "auto": "on_update"}
             ]},
            {"name": "item", "table": "items", "primary_key": {"field": "id"},
             "fields": [
                {"name": "invoice_id", "type": "int", "required": true},
                {"name": "description", "type": "string", "required": true},
                {"name": "quantity", "type": "int", "default": 1},
                {"name": "unit_price", "type": "float"}
             ]},
            {"name": "tag", "table": "tags", "primary_key": {"field": "id"},
             "fields": [{"name": "label", "type": "string", "required": true}]}
        ],
        "relations": [
            {"name": "items", "type": "one_to_many", "source": "invoice", "target": "item",
             "target_key": "invoice_id", "on_delete": "cascade"},
            {"name": "tags", "type": "many_to_many", "source": "invoice", "target": "tag",
             "join_table": {"table": "invoice_tags", "source_column": "invoice_id", "target_column": "tag_id"}},
            {"name": "invoices", "type": "one_to_many", "source": "customer", "target": "invoice",
             "target_key": "customer_id", "on_delete": "restrict"}
        ],
        "rules": [
            {"name": "total_not_negative", "entity": "invoice", "hook": "before_write", "priority": 1,
             "definition": {"type": "field", "field": "total", "operator": "min", "value": 0}},
            {"name": "number_format", "entity": "invoice", "hook": "before_write", "priority": 2,
             "definition": {"type": "field", "field": "number", "operator": "pattern",
                            "value": "^INV-[0-9]+$", "message": "number must look like INV-123"}},
            {"name": "number_length", "entity": "invoice", "hook": "before_write", "priority": 3,
             "definition": {"type": "field", "field": "number", "operator": "max_length", "value": 12}},
            {"name": "overpaid", "entity": "invoice", "hook": "before_write",
             "definition": {"type": "expression", "field": "payment_amount",
                            "expression": "payment_amount > total * 2",
                            "message": "payment is more than twice the total"}},
            {"name": "balance", "entity": "invoice", "hook": "before_write",
             "definition": {"type": "computed", "field": "balance",
                            "expression": "total - coalesce(payment_amount, 0)"}},
            {"name": "paid_invoices_stay", "entity": "invoice", "hook": "before_delete",
             "definition": {"type": "expression", "expression": "status == 'paid'",
                            "message": "paid invoices cannot be deleted"}}
        ],
        "state_machines": [
            {"entity": "invoice", "field": "status", "initial": "draft",
             "transitions": [
                {"from": "draft", "to": "sent"},
                {"from": "sent", "to": "paid", "guard": "payment_amount >= total",
                 "actions": [
                    {"type": "set_field", "field": "paid_at", "value": "now"},
                    {"type": "send_event", "event": "invoice_paid"}
                 ]},
                {"from": ["draft", "sent"], "to": "void", "roles": ["manager"]}
             ]}
        ],
        "permissions": [
            {"entity": "invoice", "action": "create", "roles": ["staff", "clerk"]},
            {"entity": "invoice", "action": "read", "roles": ["staff"]},
            {"entity": "invoice", "action": "update", "roles": ["staff", "manager"]},
            {"entity": "invoice", "action": "delete", "roles": ["staff"]},
            {"entity": "invoice", "action": "read", "roles": ["accountant"],
             "conditions": [{"field": "status", "operator": "in", "value": ["draft", "sent", "paid"]}]},
            {"entity": "invoice", "action": "update", "roles": ["clerk"],
             "conditions": [{"field": "created_by", "operator": "eq", "value": "$user.id"}]},
            {"entity": "customer", "action": "create", "roles": ["staff"]},
            {"entity": "customer", "action": "read", "roles": ["staff"]},
            {"entity": "customer", "action": "delete", "roles": ["staff"]},
            {"entity": "tag", "action": "create", "roles": ["staff"]},
            {"entity": "item", "action": "read", "roles": ["staff"]}
        ],
        "webhooks": [
            {"entity": "invoice", "hook": "after_write", "url": "https://hooks.example/paid",
             "condition": "record.status == 'paid'"},
            {"entity": "invoice", "hook": "before_delete", "url": "https://hooks.example/guard"},
            {"entity": "invoice", "hook": "after_delete", "url": "https://hooks.example/deleted"}
        ]
    }))
    .expect("fixture registry document")
}

pub fn registry() -> Registry {
    Registry::from_document(document()).expect("fixture registry")
}

pub fn store() -> Store {
    let store = Store::open_in_memory().unwrap();
    store.execute_batch(DDL).unwrap();
    store
}

pub fn clock() -> Arc<FixedClock> {
    Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()))
}

/// A pipeline over a fresh database, and the sink it reports follow-ups to.
pub fn pipeline() -> (Pipeline, Arc<RecordingSink>) {
    pipeline_with(EngineConfig::default())
}

pub fn pipeline_with(config: EngineConfig) -> (Pipeline, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::new());
    let pipeline = Pipeline::new(Arc::new(RegistryHandle::new(registry())), store(), config)
        .with_clock(clock())
        .with_sink(sink.clone());
    (pipeline, sink)
}

pub fn staff() -> UserContext {
    UserContext::new("u-staff", ["staff"])
}

pub fn accountant() -> UserContext {
    UserContext::new("u-acct", ["accountant"])
}

pub fn manager() -> UserContext {
    UserContext::new("u-mgr", ["manager"])
}

pub fn admin() -> UserContext {
    UserContext::new("root", ["admin"])
}

pub fn nobody() -> UserContext {
    UserContext::new("u-guest", ["guest"])
}

pub fn record(json: serde_json::Value) -> Record {
    Record::from_json(json).unwrap()
}

pub fn key(record: &Record) -> Value {
    record.get("id").cloned().unwrap()
}

/// Number of rows in `table`, deleted or not.
pub fn count_rows(pipeline: &Pipeline, table: &str) -> i64 {
    pipeline
        .store()
        .read(|conn| {
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                .map_err(keel_store::StoreError::from)
        })
        .unwrap()
}

/// A gate that vetoes every request and remembers what it saw.
#[derive(Default)]
pub struct VetoGate {
    pub seen: Mutex<Vec<WebhookRequest>>,
}

impl WebhookGate for VetoGate {
    fn check(&self, request: &WebhookRequest) -> Result<(), String> {
        self.seen.lock().unwrap().push(request.clone());
        Err("503 from receiver".into())
    }
}
