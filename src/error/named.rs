//! Persisted error taxonomy for assistant messages.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ErrorCategory;

/// Normalized model-invocation error, stored on the assistant message.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data")]
pub enum MessageError {
    /// Cancellation. Not a failure.
    #[serde(rename = "MessageAbortedError")]
    #[error("Aborted: {message}")]
    Aborted { message: String },

    #[serde(rename = "ProviderAuthError")]
    #[error("Authentication required for {provider_id}: {message}")]
    AuthRequired { provider_id: String, message: String },

    #[serde(rename = "APIError")]
    #[error("API error: {message}")]
    ApiError {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status_code: Option<u16>,
        is_retryable: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response_body: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after_ms: Option<u64>,
    },

    #[serde(rename = "MessageOutputLengthError")]
    #[error("Model output exceeded the maximum length")]
    OutputLength,

    #[serde(rename = "UnknownError")]
    #[error("{message}")]
    Unknown { message: String },
}

impl MessageError {
    pub fn aborted() -> Self {
        Self::Aborted {
            message: "The operation was aborted".into(),
        }
    }

    pub fn api(message: impl Into<String>, status_code: Option<u16>, is_retryable: bool) -> Self {
        Self::ApiError {
            message: message.into(),
            status_code,
            is_retryable,
            response_body: None,
            retry_after_ms: None,
        }
    }

    pub fn auth(provider_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AuthRequired {
            provider_id: provider_id.into(),
            message: message.into(),
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::Unknown {
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ApiError {
                is_retryable: true,
                ..
            }
        )
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }

    /// Provider-requested delay before the next attempt.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::ApiError { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Aborted { .. } => ErrorCategory::Aborted,
            Self::AuthRequired { .. } => ErrorCategory::Authentication,
            Self::ApiError { status_code, .. } => match status_code {
                Some(401) | Some(403) => ErrorCategory::Authentication,
                Some(429) => ErrorCategory::RateLimit,
                Some(500..=599) => ErrorCategory::Server,
                _ => ErrorCategory::Api,
            },
            Self::OutputLength => ErrorCategory::OutputLength,
            Self::Unknown { .. } => ErrorCategory::Unknown,
        }
    }
}
