//! Metadata model for Keel.
//!
//! Defines the declarative definitions the engine interprets at request time:
//! - [`EntityDefinition`]: table, primary key, typed field specs, soft delete
//! - [`RelationDefinition`]: one-to-many / one-to-one / many-to-many links
//! - [`Rule`]: field, expression, and computed rules attached to hooks
//! - [`StateMachineDefinition`]: governed field, initial state, transitions
//! - [`PermissionPolicy`]: whitelist grants per entity, action, and role
//! - [`WebhookDefinition`]: outbound hook subscriptions
//!
//! Definitions are assembled into an immutable [`Registry`] snapshot and
//! published through a [`RegistryHandle`]. In-flight requests keep the
//! snapshot they started with; a new registry never mutates an old one.

mod condition;
mod entity;
mod error;
mod permission;
mod registry;
mod relation;
mod rule;
mod state_machine;
mod webhook;

pub use condition::{Condition, FilterOperator};
pub use entity::{
    AutoTimestamp, EntityDefinition, FieldSpec, FieldType, KeyGeneration, PrimaryKeySpec,
    ShapeError, SoftDeleteSpec,
};
pub use error::{ModelError, ModelResult};
pub use permission::{Action, PermissionPolicy};
pub use registry::{is_identifier, Registry, RegistryBuilder, RegistryDocument, RegistryHandle};
pub use relation::{JoinTable, OnDelete, Ownership, RelationDefinition, RelationKind, WriteMode};
pub use rule::{
    ComputedRule, ExpressionRule, FieldOperator, FieldRule, Hook, RelatedLoad, Rule,
    RuleDefinition, RulePhase,
};
pub use state_machine::{FromStates, StateMachineDefinition, Transition, TransitionAction};
pub use webhook::{WebhookDefinition, WebhookHook};
