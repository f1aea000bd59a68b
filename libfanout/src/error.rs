//! Error types for Fanout

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FanoutError>;

#[derive(Error, Debug)]
pub enum FanoutError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Destination error: {0}")]
    Destination(#[from] DestinationError),

    #[error("Asset preparation failed: {0}")]
    Assets(String),

    #[error("Submission not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl FanoutError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            FanoutError::InvalidInput(_) | FanoutError::NotFound(_) => 3,
            FanoutError::Config(_) | FanoutError::Database(_) => 2,
            FanoutError::Destination(_) | FanoutError::Assets(_) => 1,
        }
    }
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

    #[error("Corrupt stored value: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Failure reported by a destination adapter for one post attempt.
///
/// This is recorded in the attempt log and handed to the failure logger; it
/// never aborts sibling destinations on its own.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{destination}: {cause}")]
pub struct DestinationError {
    /// Destination the attempt was made against
    pub destination: String,
    /// Technical cause, suitable for logs
    pub cause: String,
    /// Message meant for the person who queued the submission
    pub user_message: String,
    /// Whether a UI should raise a notification for this failure
    pub notify: bool,
    /// Suppress the persisted failure log entry
    #[serde(default)]
    pub skip_log: bool,
}

impl DestinationError {
    pub fn new(destination: impl Into<String>, cause: impl Into<String>) -> Self {
        let cause = cause.into();
        Self {
            destination: destination.into(),
            user_message: cause.clone(),
            cause,
            notify: true,
            skip_log: false,
        }
    }

    pub fn with_user_message(mut self, message: impl Into<String>) -> Self {
        self.user_message = message.into();
        self
    }

    /// Mark the error as not worth a persisted log entry or notification
    pub fn quiet(mut self) -> Self {
        self.notify = false;
        self.skip_log = true;
        self
    }
}
