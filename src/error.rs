//! Error taxonomy shared by every component of the runtime.
//!
//! Payloads are plain strings so the error can be cloned into execution
//! reports and mission error lists.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// Plan JSON was malformed or failed validation.
    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    /// Mission strategy JSON was malformed or failed validation.
    #[error("invalid strategy: {0}")]
    InvalidStrategy(String),

    /// No tool with this name exists in the active catalog.
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// The tool's owning server is not running.
    #[error("server unavailable: {0}")]
    ServerUnavailable(String),

    /// The tool server answered with `success=false`.
    #[error("{message}")]
    ToolError { tool: String, message: String },

    /// A deadline elapsed.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Work was cancelled before it finished.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Persistence failed.
    #[error("store error: {0}")]
    Store(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The target is in a state that does not allow the operation.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A generator or embedder endpoint failed.
    #[error("llm error: {0}")]
    Llm(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a caller may reasonably retry the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ServerUnavailable(_) | Error::Timeout(_) | Error::Llm(_)
        )
    }

    /// Short machine-readable tag, used in progress events.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidPlan(_) => "invalid_plan",
            Error::InvalidStrategy(_) => "invalid_strategy",
            Error::ToolNotFound(_) => "tool_not_found",
            Error::ServerUnavailable(_) => "server_unavailable",
            Error::ToolError { .. } => "tool_error",
            Error::Timeout(_) => "timeout",
            Error::Cancelled(_) => "cancelled",
            Error::Store(_) => "store_error",
            Error::NotFound(_) => "not_found",
            Error::AlreadyExists(_) => "already_exists",
            Error::InvalidState(_) => "invalid_state",
            Error::Llm(_) => "llm_error",
            Error::Config(_) => "config_error",
            Error::Internal(_) => "internal",
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Store(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(format!("json: {}", e))
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Internal(format!("task join error: {}", e))
    }
}
