//! Keel's per-request mutation engine.
//!
//! Takes a create/update/delete request for a registered entity and runs it
//! through permission checks, state machines, validation and computed
//! rules, then writes the record and any nested children in one
//! transaction.
//!
//! # Architecture
//!
//! - [`filter`] compiles declarative conditions to SQL and in-memory
//!   predicates
//! - [`permission`] decides whitelist access and read visibility
//! - [`rules`] runs field, expression and computed rules
//! - [`state_machine`] validates and applies transitions of governed fields
//! - [`write`] plans and executes nested writes
//! - [`dispatch`] builds webhook requests and post-commit follow-ups
//! - [`pipeline`] orders all of the above for one request
//!
//! Every request works against one [`Registry`](keel_model::Registry)
//! snapshot taken when it starts.

mod config;
pub mod dispatch;
mod error;
pub mod filter;
pub mod permission;
pub mod pipeline;
pub mod rules;
pub mod state_machine;
pub mod write;

pub use config::EngineConfig;
pub use dispatch::{
    AllowAllGate, ChannelSink, DeferredAction, DiscardSink, FollowUp, FollowUpSink, RecordingSink,
    TransitionNotice, WebhookGate, WebhookRequest,
};
pub use error::{EngineError, EngineResult, ErrorCode, ErrorDetail, ErrorResponse};
pub use filter::{compile, CompiledFilter};
pub use permission::{Decision, PermissionEvaluator, ReadScope};
pub use pipeline::{Pipeline, Request};
pub use rules::{RelatedSource, RuleContext, RuleEngine, RuleOutcome, StoreRelatedSource};
pub use state_machine::{StateMachineEngine, TransitionContext, TransitionOutcome};
pub use write::{Executor, OpKind, Operation, ParentLink, Planner, TreeShape, WritePlan};
