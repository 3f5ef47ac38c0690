//! Operator front end for Keel: registry checks and one-shot requests
//! against a SQLite database.
//!
//! The binary in `main.rs` is a thin clap layer over these functions so the
//! behavior can be exercised without spawning a process.

use anyhow::{bail, Context, Result};
use keel_engine::{ChannelSink, EngineConfig, FollowUp, Pipeline, Request};
use keel_model::{Action, Condition, Registry, RegistryDocument, RegistryHandle};
use keel_store::Store;
use keel_types::{Record, UserContext, Value};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info};

/// Summary printed by `keel check`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub entities: Vec<String>,
    pub relations: usize,
    pub rules: usize,
    pub state_machines: usize,
    pub permissions: usize,
    pub webhooks: usize,
}

/// Loads and validates the registry at `path`.
pub fn check(path: &Path) -> Result<CheckReport> {
    let document = load_document(path)?;
    let report = CheckReport {
        entities: document.entities.iter().map(|e| e.name.clone()).collect(),
        relations: document.relations.len(),
        rules: document.rules.len(),
        state_machines: document.state_machines.len(),
        permissions: document.permissions.len(),
        webhooks: document.webhooks.len(),
    };
    Registry::from_document(document).with_context(|| format!("Invalid registry {}", path.display()))?;
    Ok(report)
}

fn load_document(path: &Path) -> Result<RegistryDocument> {
    RegistryDocument::load_from(path).with_context(|| format!("Failed to load registry {}", path.display()))
}

/// Write verbs accepted by `keel apply`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Verb {
    Create,
    Update,
    Delete,
}

impl From<Verb> for Action {
    fn from(verb: Verb) -> Self {
        match verb {
            Verb::Create => Action::Create,
            Verb::Update => Action::Update,
            Verb::Delete => Action::Delete,
        }
    }
}

/// Reads a payload given inline as JSON or as `@path` to a JSON file.
pub fn parse_payload(arg: &str) -> Result<Record> {
    let text = match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("Failed to read payload {path}"))?,
        None => arg.to_string(),
    };
    Record::from_json_str(&text).context("Payload must be a JSON object")
}

/// Interprets a key argument as JSON when it parses, otherwise as text, so
/// `42` is an integer key and `inv-7` a string key.
pub fn parse_key(arg: &str) -> Value {
    match serde_json::from_str::<serde_json::Value>(arg) {
        Ok(json) => Value::from_json(json),
        Err(_) => Value::from(arg),
    }
}

/// Parses a JSON array of `{field, operator, value}` conditions.
pub fn parse_conditions(arg: &str) -> Result<Vec<Condition>> {
    serde_json::from_str(arg).context("Conditions must be a JSON array of {field, operator, value}")
}

/// Assembles a request, checking that each verb got the arguments it needs.
pub fn build_request(
    entity: &str,
    verb: Verb,
    id: Option<&str>,
    payload: Option<&str>,
    user: UserContext,
) -> Result<Request> {
    let payload = payload.map(parse_payload).transpose()?;
    let request = match (verb, id) {
        (Verb::Create, None) => Request::create(entity, payload.unwrap_or_default(), user),
        (Verb::Create, Some(_)) => bail!("create takes no --id; put the key in the payload"),
        (Verb::Update, Some(id)) => match payload {
            Some(payload) => Request::update(entity, parse_key(id), payload, user),
            None => bail!("update needs --payload"),
        },
        (Verb::Delete, Some(id)) => {
            if payload.is_some() {
                bail!("delete takes no --payload");
            }
            Request::delete(entity, parse_key(id), user)
        }
        (verb, None) => bail!("{} needs --id", Action::from(verb)),
    };
    Ok(request)
}

/// What a command prints. Engine failures are reported as their error
/// response rather than as a process error.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub ok: bool,
    pub body: serde_json::Value,
}

impl Outcome {
    fn from_result<T>(result: keel_engine::EngineResult<T>, render: impl FnOnce(T) -> serde_json::Value) -> Result<Self> {
        match result {
            Ok(value) => Ok(Self { ok: true, body: render(value) }),
            Err(e) => {
                info!("Request rejected: {}", e);
                Ok(Self {
                    ok: false,
                    body: serde_json::to_value(e.to_response()).context("Failed to encode error response")?,
                })
            }
        }
    }
}

/// A pipeline over one registry file and one database.
#[derive(Debug)]
pub struct Session {
    pipeline: Pipeline,
}

impl Session {
    /// Opens the database and registry. Follow-ups from committed writes
    /// arrive on the returned receiver; it closes once the session drops.
    pub fn open(
        registry: &Path,
        database: &Path,
        config: EngineConfig,
    ) -> Result<(Self, UnboundedReceiver<FollowUp>)> {
        let document = load_document(registry)?;
        let registry = Registry::from_document(document)
            .with_context(|| format!("Invalid registry {}", registry.display()))?;
        let store = Store::open(database).with_context(|| format!("Failed to open database {}", database.display()))?;
        info!("Opened database {}", database.display());

        let (sink, follow_ups) = ChannelSink::new();
        let pipeline = Pipeline::new(Arc::new(RegistryHandle::new(registry)), store, config).with_sink(Arc::new(sink));
        Ok((Self { pipeline }, follow_ups))
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn apply(&self, request: Request) -> Result<Outcome> {
        debug!(entity = %request.entity, action = %request.action, "applying request");
        Outcome::from_result(self.pipeline.handle(request), |tree| tree.to_json())
    }

    pub fn list(&self, entity: &str, user: &UserContext, conditions: &[Condition]) -> Result<Outcome> {
        Outcome::from_result(self.pipeline.list(entity, user, conditions), |rows| {
            serde_json::Value::Array(rows.iter().map(Record::to_json).collect())
        })
    }
}

/// One-line summary of a follow-up for the log.
pub fn describe(follow_up: &FollowUp) -> String {
    match follow_up {
        FollowUp::Webhook(request) => format!("webhook {} {} ({})", request.method, request.url, request.event),
        FollowUp::Transition(notice) => {
            format!("transition {}.{}: {} -> {}", notice.entity, notice.field, notice.from, notice.to)
        }
        FollowUp::Action(deferred) => format!("action on {} {}: {:?}", deferred.entity, deferred.key, deferred.action),
    }
}

/// Logs follow-ups until the sending session is dropped. Returns how many
/// were seen.
pub async fn log_follow_ups(mut follow_ups: UnboundedReceiver<FollowUp>) -> usize {
    let mut seen = 0;
    while let Some(follow_up) = follow_ups.recv().await {
        info!("Follow-up: {}", describe(&follow_up));
        seen += 1;
    }
    seen
}
