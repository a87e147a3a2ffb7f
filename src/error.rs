// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for artifact replication.
//!
//! Errors are categorized by where they originate (operation log, task
//! store, remote cluster, local storage) and carry enough context to be
//! logged without the surrounding call site.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Redis` | Yes | Operation log unreachable, cursor registration failed |
//! | `Http` | Yes | Transport failure talking to a remote cluster |
//! | `Remote` | 5xx/429 only | Remote cluster answered with a failure status |
//! | `Auth` | No | Token exchange with a remote cluster failed |
//! | `TaskStore` | No | Local SQLite errors (needs operator attention) |
//! | `Config` | No | Configuration invalid |
//! | `LogParse` | No | Malformed operation log entry |
//! | `Storage` | No | Local content could not be read |
//! | `NodeNotFound` | No | Node metadata missing locally |
//! | `UnsupportedRepositoryType` | No | No push client registered for the type |
//! | `Conflict` | No | Artifact already present remotely (fast-fail policy) |
//! | `DuplicateTask` / `TaskNotFound` / `TaskEnabled` | No | Task registry misuse |
//! | `InvalidState` | No | State machine violation |
//! | `Shutdown` | No | Engine is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! The tailer supervisor retries every failure forever; everything else
//! uses [`ReplicationError::is_retryable()`] to decide whether an operation
//! is worth repeating. Push clients never retry on their own.

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Redis connection or command error against the operation log.
    #[error("Redis error ({operation}): {message}")]
    Redis {
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// SQLite error in the task registry or checkpoint store.
    #[error("Task store error: {0}")]
    TaskStore(#[from] sqlx::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation log entry has an unexpected shape.
    ///
    /// The tailer skips these entries; they are never fatal.
    #[error("Log parse error: {0}")]
    LogParse(String),

    /// Transport-level failure talking to a remote cluster.
    #[error("HTTP error ({cluster}): {source}")]
    Http {
        cluster: String,
        #[source]
        source: reqwest::Error,
    },

    /// Remote cluster answered with a non-success status.
    #[error("Remote error ({cluster}): status {status}: {message}")]
    Remote {
        cluster: String,
        status: u16,
        message: String,
    },

    /// Credential exchange with a remote cluster failed.
    #[error("Authorization error ({cluster}): {message}")]
    Auth { cluster: String, message: String },

    /// Local content could not be read.
    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// Node metadata does not exist in local storage.
    #[error("Node not found: /{project_id}/{repo_name}{full_path}")]
    NodeNotFound {
        project_id: String,
        repo_name: String,
        full_path: String,
    },

    /// No push client is registered for the repository type.
    #[error("Unsupported repository type: {0}")]
    UnsupportedRepositoryType(String),

    /// Artifact already exists remotely and the task forbids overwriting it.
    #[error("Conflict ({cluster}): {artifact} already exists")]
    Conflict { cluster: String, artifact: String },

    /// A task with the same key is already registered.
    #[error("Duplicate task key: {0}")]
    DuplicateTask(String),

    /// No task is registered under the key.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Enabled tasks cannot be removed.
    #[error("Task is still enabled: {0}")]
    TaskEnabled(String),

    /// State machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a Redis error from a redis::RedisError
    pub fn redis(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a Redis error without source
    pub fn redis_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a transport error for a remote cluster.
    pub fn http(cluster: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Http {
            cluster: cluster.into(),
            source,
        }
    }

    /// Create a remote status error.
    pub fn remote(cluster: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        Self::Remote {
            cluster: cluster.into(),
            status,
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Redis { .. } => true,
            Self::Http { .. } => true,
            Self::Remote { status, .. } => *status >= 500 || *status == 429,
            Self::Auth { .. } => false,
            Self::TaskStore(_) => false,
            Self::Config(_) => false,
            Self::LogParse(_) => false,
            Self::Storage(_) => false,
            Self::NodeNotFound { .. } => false,
            Self::UnsupportedRepositoryType(_) => false,
            Self::Conflict { .. } => false,
            Self::DuplicateTask(_) | Self::TaskNotFound(_) | Self::TaskEnabled(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}

impl From<redis::RedisError> for ReplicationError {
    fn from(e: redis::RedisError) -> Self {
        Self::redis("unknown", e)
    }
}
