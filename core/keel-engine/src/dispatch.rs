//! Webhook selection and post-commit follow-ups.
//!
//! `before_*` webhooks are handed to a [`WebhookGate`] inside the write
//! transaction and may veto it. Everything that happens after commit
//! (`after_*` webhooks, transition notices, deferred transition actions) is
//! pushed to a [`FollowUpSink`]; delivery and retries belong to whoever
//! drains the sink.

use keel_expr::{Environment, Evaluator};
use keel_model::{Action, Registry, TransitionAction, WebhookHook};
use keel_types::{Record, UserContext, Value};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// One webhook call, ready for delivery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookRequest {
    pub url: String,
    pub method: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// `<entity>.<hook>`, e.g. `invoice.after_write`.
    pub event: String,
    pub entity: String,
    pub action: Action,
    pub record: Record,
    pub old: Option<Record>,
    /// Fields whose value differs from `old`; every written field on create.
    pub changes: Record,
    pub user: UserContext,
    pub timestamp: String,
}

/// Emitted once per completed state transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionNotice {
    pub entity: String,
    pub field: String,
    pub from: String,
    pub to: String,
    pub record: Record,
}

/// A transition action executed by an outside collaborator after commit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeferredAction {
    pub entity: String,
    pub key: Value,
    pub action: TransitionAction,
}

/// Work handed off after a successful commit.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FollowUp {
    Webhook(WebhookRequest),
    Transition(TransitionNotice),
    Action(DeferredAction),
}

/// Synchronous `before_*` webhook delivery. An `Err` vetoes the write.
///
/// Called inside the write transaction while the [`Store`](keel_store::Store)
/// lock is held. An implementation must not read or write through the same
/// store; doing so deadlocks. The request already carries the written row.
pub trait WebhookGate: Send + Sync {
    fn check(&self, request: &WebhookRequest) -> Result<(), String>;
}

/// Receives post-commit follow-ups. Must not block.
pub trait FollowUpSink: Send + Sync {
    fn enqueue(&self, follow_up: FollowUp);
}

/// Lets every `before_*` webhook pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllGate;

impl WebhookGate for AllowAllGate {
    fn check(&self, request: &WebhookRequest) -> Result<(), String> {
        debug!(event = %request.event, url = %request.url, "webhook gate passed");
        Ok(())
    }
}

/// Drops follow-ups, logging each one.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardSink;

impl FollowUpSink for DiscardSink {
    fn enqueue(&self, follow_up: FollowUp) {
        debug!(?follow_up, "discarding follow-up");
    }
}

/// Forwards follow-ups to an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<FollowUp>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FollowUp>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl FollowUpSink for ChannelSink {
    fn enqueue(&self, follow_up: FollowUp) {
        if let Err(e) = self.tx.send(follow_up) {
            warn!("Follow-up receiver dropped, losing {:?}", e.0);
        }
    }
}

/// Keeps follow-ups in memory until taken.
#[derive(Debug, Default)]
pub struct RecordingSink {
    seen: Mutex<Vec<FollowUp>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns everything recorded so far.
    pub fn take(&self) -> Vec<FollowUp> {
        let mut seen = self.seen.lock().unwrap_or_else(|p| p.into_inner());
        std::mem::take(&mut *seen)
    }
}

impl FollowUpSink for RecordingSink {
    fn enqueue(&self, follow_up: FollowUp) {
        self.seen
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(follow_up);
    }
}

/// Everything a webhook payload is built from.
pub(crate) struct HookContext<'a> {
    pub entity: &'a str,
    pub action: Action,
    pub record: &'a Record,
    pub old: Option<&'a Record>,
    pub user: &'a UserContext,
    pub now: &'a str,
}

/// Builds requests for the active webhooks on `hook` whose condition holds.
/// A condition that fails to evaluate skips its webhook.
pub(crate) fn select_webhooks(
    registry: &Registry,
    evaluator: &Evaluator,
    hook: WebhookHook,
    ctx: &HookContext<'_>,
) -> Vec<WebhookRequest> {
    let env = Environment::new(ctx.record)
        .with_old(ctx.old)
        .with_user(ctx.user)
        .with_action(ctx.action.as_str())
        .with_now(ctx.now);
    let changes = changed_fields(ctx.record, ctx.old);

    registry
        .webhooks(ctx.entity, hook)
        .filter(|webhook| match &webhook.condition {
            None => true,
            Some(condition) => match evaluator.evaluate_bool(condition, &env) {
                Ok(fire) => fire,
                Err(e) => {
                    warn!("Skipping webhook {} on {}: condition failed: {}", webhook.url, ctx.entity, e);
                    false
                }
            },
        })
        .map(|webhook| WebhookRequest {
            url: webhook.url.clone(),
            method: webhook.method.clone(),
            headers: webhook.headers.clone(),
            event: format!("{}.{}", ctx.entity, hook.as_str()),
            entity: ctx.entity.to_string(),
            action: ctx.action,
            record: ctx.record.clone(),
            old: ctx.old.cloned(),
            changes: changes.clone(),
            user: ctx.user.clone(),
            timestamp: ctx.now.to_string(),
        })
        .collect()
}

/// Fields of `record` that are new or differ from `old`.
pub(crate) fn changed_fields(record: &Record, old: Option<&Record>) -> Record {
    match old {
        None => record.clone(),
        Some(old) => record
            .iter()
            .filter(|(k, v)| old.get(k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    }
}
