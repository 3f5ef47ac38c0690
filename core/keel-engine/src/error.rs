//! Error types for the engine, and their wire form.

use keel_model::ModelError;
use keel_store::StoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Stable error codes returned to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidPayload,
    UnknownField,
    UnknownEntity,
    ValidationFailed,
    InvalidTransition,
    GuardFailed,
    Forbidden,
    Conflict,
    NotFound,
    Internal,
}

impl ErrorCode {
    /// HTTP status the outer layer should answer with.
    pub fn status(self) -> u16 {
        match self {
            Self::InvalidPayload | Self::UnknownField => 400,
            Self::Forbidden => 403,
            Self::UnknownEntity | Self::NotFound => 404,
            Self::Conflict => 409,
            Self::ValidationFailed | Self::InvalidTransition | Self::GuardFailed => 422,
            Self::Internal => 500,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidPayload => "INVALID_PAYLOAD",
            Self::UnknownField => "UNKNOWN_FIELD",
            Self::UnknownEntity => "UNKNOWN_ENTITY",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::InvalidTransition => "INVALID_TRANSITION",
            Self::GuardFailed => "GUARD_FAILED",
            Self::Forbidden => "FORBIDDEN",
            Self::Conflict => "CONFLICT",
            Self::NotFound => "NOT_FOUND",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One violated rule or constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub rule: String,
    pub message: String,
}

impl ErrorDetail {
    pub fn new(field: Option<&str>, rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.map(str::to_string),
            rule: rule.into(),
            message: message.into(),
        }
    }
}

/// Errors that end a request.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("unknown field `{field}` on `{entity}`")]
    UnknownField { entity: String, field: String },

    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    #[error("validation failed with {} violation(s)", .details.len())]
    Validation { details: Vec<ErrorDetail> },

    #[error("no transition of `{field}` from `{from}` to `{to}`")]
    InvalidTransition { field: String, from: String, to: String },

    #[error("transition of `{field}` from `{from}` to `{to}` blocked by guard: {reason}")]
    GuardFailed {
        field: String,
        from: String,
        to: String,
        reason: String,
    },

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{entity} `{key}` not found")]
    NotFound { entity: String, key: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// A validation failure with a single detail.
    pub fn validation(field: Option<&str>, rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            details: vec![ErrorDetail::new(field, rule, message)],
        }
    }

    pub fn not_found(entity: &str, key: impl fmt::Display) -> Self {
        Self::NotFound {
            entity: entity.to_string(),
            key: key.to_string(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidPayload(_) => ErrorCode::InvalidPayload,
            Self::UnknownField { .. } => ErrorCode::UnknownField,
            Self::UnknownEntity(_) => ErrorCode::UnknownEntity,
            Self::Validation { .. } => ErrorCode::ValidationFailed,
            Self::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            Self::GuardFailed { .. } => ErrorCode::GuardFailed,
            Self::Forbidden(_) => ErrorCode::Forbidden,
            Self::Conflict(_) => ErrorCode::Conflict,
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::Config(_) | Self::Internal(_) => ErrorCode::Internal,
        }
    }

    pub fn details(&self) -> &[ErrorDetail] {
        match self {
            Self::Validation { details } => details,
            _ => &[],
        }
    }

    /// The `{code, message, details}` body returned to callers.
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            code: self.code(),
            message: self.to_string(),
            details: self.details().to_vec(),
        }
    }
}

/// Serialized error body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default)]
    pub details: Vec<ErrorDetail>,
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(message) => Self::Conflict(message),
            StoreError::InvalidData(message) => Self::InvalidPayload(message),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<ModelError> for EngineError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::UnknownEntity(name) => Self::UnknownEntity(name),
            other => Self::Internal(other.to_string()),
        }
    }
}
