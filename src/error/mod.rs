//! Error types for roci-session.
//!
//! Two layers exist. [`SessionError`] is what crate operations return.
//! [`MessageError`] is the persisted taxonomy stored on assistant messages,
//! so every client renders the same explanation of a failed step.

pub mod named;
pub mod unified;

pub use named::MessageError;
pub use unified::ErrorCategory;

use thiserror::Error;

/// Primary error type for all session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Session {session_id} is busy")]
    Busy { session_id: String },

    #[error("Generation aborted")]
    Aborted,

    #[error("Permission denied: {permission} ({pattern})")]
    PermissionDenied { permission: String, pattern: String },

    #[error("The user rejected permission to use {permission} ({pattern})")]
    PermissionRejected { permission: String, pattern: String },

    #[error("Tool execution error: {tool_name}: {message}")]
    ToolExecution { tool_name: String, message: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Model(#[from] MessageError),
}

impl SessionError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn tool(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolExecution {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    /// Classify this error into a category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::Storage(_) | Self::Io(_) => ErrorCategory::Storage,
            Self::Serialization(_) => ErrorCategory::Serialization,
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::Busy { .. } => ErrorCategory::Busy,
            Self::Aborted => ErrorCategory::Aborted,
            Self::PermissionDenied { .. } | Self::PermissionRejected { .. } => {
                ErrorCategory::Permission
            }
            Self::ToolExecution { .. } => ErrorCategory::ToolExecution,
            Self::InvalidArgument(_) => ErrorCategory::InvalidInput,
            Self::InvalidState(_) => ErrorCategory::InvalidState,
            Self::Model(err) => err.category(),
        }
    }

    /// Whether this error is potentially retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Model(err) => err.is_retryable(),
            _ => false,
        }
    }

    /// Whether this error is a cancellation signal rather than a failure.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted | Self::Model(MessageError::Aborted { .. }))
    }

    /// Convert into the persisted taxonomy.
    pub fn to_message_error(&self) -> MessageError {
        match self {
            Self::Aborted => MessageError::aborted(),
            Self::Model(err) => err.clone(),
            other => MessageError::unknown(other.to_string()),
        }
    }
}

impl From<SessionError> for MessageError {
    fn from(err: SessionError) -> Self {
        err.to_message_error()
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, SessionError>;
