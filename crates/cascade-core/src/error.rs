use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

use crate::EntityKey;

/// Error codes surfaced to callers in the `errors` list of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    NotFound,
    Unauthorized,
    Forbidden,
    Conflict,
    TransactionFailed,
    Timeout,
    RateLimited,
    ServiceUnavailable,
    InternalError,

    /// Deprecated: kept for payloads produced by older servers.
    NoTransaction,
    /// Deprecated: kept for payloads produced by older servers.
    TransactionInProgress,
    /// Deprecated: kept for payloads produced by older servers.
    MissingId,
    /// Deprecated: kept for payloads produced by older servers.
    SerializationError,
}

impl ErrorCode {
    /// Transport level conditions a caller may decide to retry.
    /// Nothing in this workspace retries on its own.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::Timeout | ErrorCode::RateLimited | ErrorCode::ServiceUnavailable
        )
    }

    pub fn is_deprecated(self) -> bool {
        matches!(
            self,
            ErrorCode::NoTransaction
                | ErrorCode::TransactionInProgress
                | ErrorCode::MissingId
                | ErrorCode::SerializationError
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::TransactionFailed => "TRANSACTION_FAILED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::NoTransaction => "NO_TRANSACTION",
            ErrorCode::TransactionInProgress => "TRANSACTION_IN_PROGRESS",
            ErrorCode::MissingId => "MISSING_ID",
            ErrorCode::SerializationError => "SERIALIZATION_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("No active transaction")]
    NoTransaction,

    #[error("Transaction already in progress: {0}")]
    TransactionInProgress(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Entity of type '{typename}' has no resolvable id")]
    MissingId { typename: String },

    #[error("Failed to serialize entity {key}: {reason}")]
    Serialization { key: EntityKey, reason: String },

    #[error("Invalidation error: {0}")]
    Invalidation(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CascadeError {
    /// Public code reported for this error. Transaction misuse maps to
    /// `TRANSACTION_FAILED`; the deprecated codes are only produced by
    /// [`CascadeError::legacy_code`].
    pub fn code(&self) -> ErrorCode {
        match self {
            CascadeError::NoTransaction | CascadeError::TransactionInProgress(_) => {
                ErrorCode::TransactionFailed
            }
            CascadeError::Validation(_) | CascadeError::MissingId { .. } => {
                ErrorCode::ValidationError
            }
            CascadeError::Conflict(_) => ErrorCode::Conflict,
            CascadeError::Serialization { .. }
            | CascadeError::Invalidation(_)
            | CascadeError::Cache(_)
            | CascadeError::Json(_) => ErrorCode::InternalError,
        }
    }

    /// Pre-1.0 code for the same error, for hosts still matching on it.
    pub fn legacy_code(&self) -> ErrorCode {
        match self {
            CascadeError::NoTransaction => ErrorCode::NoTransaction,
            CascadeError::TransactionInProgress(_) => ErrorCode::TransactionInProgress,
            CascadeError::MissingId { .. } => ErrorCode::MissingId,
            CascadeError::Serialization { .. } => ErrorCode::SerializationError,
            other => other.code(),
        }
    }

    /// Usage errors indicate a caller bug and are never tolerated.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            CascadeError::NoTransaction | CascadeError::TransactionInProgress(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CascadeError>;

/// Error entry as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeErrorInfo {
    pub message: String,
    pub code: ErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,
}

impl CascadeErrorInfo {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code,
            field: None,
            path: None,
            extensions: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_path<I, S>(mut self, path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.path = Some(path.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_extension(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extensions
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }
}

impl From<&CascadeError> for CascadeErrorInfo {
    fn from(err: &CascadeError) -> Self {
        let info = CascadeErrorInfo::new(err.code(), err.to_string());
        match err {
            CascadeError::MissingId { typename } => info.with_field("id").with_extension(
                "typename",
                Value::String(typename.clone()),
            ),
            CascadeError::Serialization { key, .. } => {
                info.with_extension("entity", Value::String(key.to_string()))
            }
            _ => info,
        }
    }
}

impl From<CascadeError> for CascadeErrorInfo {
    fn from(err: CascadeError) -> Self {
        CascadeErrorInfo::from(&err)
    }
}
