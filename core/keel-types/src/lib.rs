//! Core type definitions for Keel.
//!
//! This crate defines the registry-agnostic types used throughout the engine:
//! - [`Value`]: the tagged scalar/JSON union every field value is held in
//! - [`Record`]: an ordered map of field name to [`Value`]
//! - [`UserContext`]: the caller identity and roles a request runs as
//! - [`Clock`]: the source of "now" for timestamps and expressions
//! - Request identifiers and generated record keys (UUID v7)
//!
//! Record shape is never assumed here; it is validated against an entity
//! definition by the model and engine crates.

mod clock;
mod ids;
mod record;
mod user;
mod value;

pub use clock::{format_timestamp, Clock, FixedClock, SystemClock};
pub use ids::{generate_key, RequestId};
pub use record::Record;
pub use user::UserContext;
pub use value::Value;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, TypesError>;

/// Errors that can occur in type conversions.
#[derive(Debug, thiserror::Error)]
pub enum TypesError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("expected a JSON object, found {0}")]
    NotAnObject(&'static str),
}
