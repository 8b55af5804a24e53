//! Error types for Fanout

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::SubmissionType;

pub type Result<T> = std::result::Result<T, FanoutError>;

#[derive(Error, Debug)]
pub enum FanoutError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Post error: {0}")]
    Post(#[from] PostError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Corrupt column {column}: {reason}")]
    Decode { column: String, reason: String },
}

/// Failure reported by a destination adapter.
///
/// Adapters fill in whatever they know; `stage` defaults to `upload` when
/// the adapter leaves it empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostFailure {
    pub message: String,
    pub stage: Option<String>,
    pub exception: Option<String>,
    pub additional_info: Option<serde_json::Value>,
}

impl PostFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn with_exception(mut self, exception: impl Into<String>) -> Self {
        self.exception = Some(exception.into());
        self
    }

    pub fn with_additional_info(mut self, info: serde_json::Value) -> Self {
        self.additional_info = Some(info);
        self
    }
}

impl std::fmt::Display for PostFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Errors raised while attempting one destination.
///
/// None of these escape the destination boundary: the post manager turns
/// each one into a `POST_ATTEMPT_FAILED` event.
#[derive(Error, Debug, Clone)]
pub enum PostError {
    #[error("Account {0} is not logged in")]
    NotLoggedIn(String),

    #[error("Account {account} does not support {kind} submissions")]
    UnsupportedKind {
        account: String,
        kind: SubmissionType,
    },

    #[error("No destination registered for account {0}")]
    UnknownAccount(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Failed to prepare post data: {0}")]
    Preparation(String),

    #[error("Failed to process file {file_id}: {reason}")]
    Processing { file_id: String, reason: String },

    #[error("File {file_id} has content type {content_type}, which {account} does not accept")]
    ContentTypeMismatch {
        account: String,
        file_id: String,
        content_type: String,
    },

    #[error("{0}")]
    Adapter(PostFailure),

    #[error("Post was cancelled")]
    Cancelled,

    #[error("Event log write failed: {0}")]
    Store(String),
}

impl PostError {
    /// Stage tag recorded with the failure.
    pub fn stage(&self) -> &str {
        match self {
            PostError::NotLoggedIn(_) => "login",
            PostError::UnsupportedKind { .. } => "support",
            PostError::UnknownAccount(_) => "resolve",
            PostError::Validation(_) => "validation",
            PostError::Preparation(_) => "prepare",
            PostError::Processing { .. } => "process",
            PostError::ContentTypeMismatch { .. } => "content-type",
            PostError::Adapter(failure) => failure.stage.as_deref().unwrap_or("upload"),
            PostError::Cancelled => "cancelled",
            PostError::Store(_) => "store",
        }
    }

    /// Cancellation is not a destination fault and is kept out of failure reporting.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, PostError::Cancelled)
    }

    /// Structured form persisted on events.
    pub fn to_response(&self) -> PostErrorResponse {
        let (exception, additional_info) = match self {
            PostError::Adapter(failure) => {
                (failure.exception.clone(), failure.additional_info.clone())
            }
            _ => (None, None),
        };

        PostErrorResponse {
            message: self.to_string(),
            stage: self.stage().to_string(),
            exception,
            additional_info,
        }
    }
}

impl From<FanoutError> for PostError {
    fn from(err: FanoutError) -> Self {
        match err {
            FanoutError::Post(post) => post,
            other => PostError::Store(other.to_string()),
        }
    }
}

/// Serializable error record attached to failure events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostErrorResponse {
    pub message: String,
    pub stage: String,
    pub exception: Option<String>,
    pub additional_info: Option<serde_json::Value>,
}
