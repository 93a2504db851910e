use std::time::Duration;

use thiserror::Error;

use crate::{config::LoadError, infra::error::InfraError};

/// Failures surfaced by fetches, mutations and the change feed.
///
/// `Clone` because a multiplexed fetch hands the same rejection to every
/// waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// The request never reached the server or no response came back.
    #[error("network error: {message}")]
    Network { message: String },
    /// Non-2xx response. `message` is the server's `error` field when present.
    #[error("server rejected request with status {status}: {message}")]
    ServerRejection { status: u16, message: String },
    /// Local validation failed before anything was written or sent.
    #[error("validation failed for `{field}`: {message}")]
    Validation {
        field: &'static str,
        message: String,
    },
    /// Response body did not match the expected schema.
    #[error("invalid response body: {message}")]
    InvalidResponse { message: String },
    #[error("request timed out after {}ms", after.as_millis())]
    Timeout { after: Duration },
    /// The same identity was used with two different value types.
    #[error("cached value for {identity} has a different type")]
    TypeMismatch { identity: String },
    #[error("invalid cursor: {0}")]
    InvalidCursor(String),
    #[error("change feed error: {message}")]
    Feed { message: String },
}

impl SyncError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::ServerRejection {
            status,
            message: message.into(),
        }
    }

    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            message: message.into(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::Timeout { after }
    }

    pub fn type_mismatch(identity: impl Into<String>) -> Self {
        Self::TypeMismatch {
            identity: identity.into(),
        }
    }

    pub fn feed(message: impl Into<String>) -> Self {
        Self::Feed {
            message: message.into(),
        }
    }

    /// Whether the UI may offer a retry. The coordinator itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Timeout { .. })
    }

    /// Short label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network { .. } => "network",
            Self::ServerRejection { .. } => "server_rejection",
            Self::Validation { .. } => "validation",
            Self::InvalidResponse { .. } => "invalid_response",
            Self::Timeout { .. } => "timeout",
            Self::TypeMismatch { .. } => "type_mismatch",
            Self::InvalidCursor(_) => "invalid_cursor",
            Self::Feed { .. } => "feed",
        }
    }
}

/// Top-level error for the `hearth` binary.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }
}
