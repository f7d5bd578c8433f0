// crates/contextd-server/src/error.rs
// Standardized error types for contextd

use thiserror::Error;

/// Main error type for the contextd library.
///
/// Each variant maps to a stable kind string surfaced at the MCP boundary;
/// messages never include secret material.
#[derive(Error, Debug)]
pub enum ContextdError {
    #[error("tenancy required: no org/team/project in request context")]
    TenancyRequired,

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("checksum mismatch in WAL entry {0}")]
    ChecksumMismatch(String),

    #[error("LLM provider unavailable: {0}")]
    LlmUnavailable(String),

    #[error("LLM response unparseable: {0}")]
    LlmParseError(String),

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error("task cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown error: {0}")]
    Other(String),
}

/// Convenience type alias for Result using ContextdError
pub type Result<T> = std::result::Result<T, ContextdError>;

impl ContextdError {
    /// Stable kind string exposed in structured tool errors.
    pub fn kind(&self) -> &'static str {
        match self {
            ContextdError::TenancyRequired => "tenancy_required",
            ContextdError::InvalidIdentifier(_) => "invalid_identifier",
            ContextdError::DimensionMismatch { .. } => "dimension_mismatch",
            ContextdError::NotFound(_) => "not_found",
            ContextdError::Unauthenticated(_) => "unauthenticated",
            ContextdError::Unavailable(_) => "unavailable",
            ContextdError::ResourceExhausted(_) => "resource_exhausted",
            ContextdError::InvalidArgument(_) => "invalid_argument",
            ContextdError::DeadlineExceeded(_) => "deadline_exceeded",
            ContextdError::ChecksumMismatch(_) => "checksum_mismatch",
            ContextdError::LlmUnavailable(_) => "llm_unavailable",
            ContextdError::LlmParseError(_) => "llm_parse_error",
            ContextdError::Embedding(_) => "embedding_error",
            ContextdError::Db(_) => "storage_error",
            ContextdError::Io(_) => "io_error",
            ContextdError::Json(_) => "serialization_error",
            ContextdError::Http(_) => "http_error",
            ContextdError::Git(_) => "git_error",
            ContextdError::Cancelled => "cancelled",
            ContextdError::Config(_) => "config_error",
            ContextdError::Other(_) => "internal_error",
        }
    }

    /// Whether the fallback layer may retry this failure against the remote.
    /// Only transient transport conditions qualify; auth failures never do.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ContextdError::Unavailable(_) | ContextdError::DeadlineExceeded(_)
        )
    }

    /// Convert to user-facing string for MCP tool boundaries
    pub fn to_user_string(&self) -> String {
        format!("[{}] {}", self.kind(), self)
    }
}

impl From<String> for ContextdError {
    fn from(s: String) -> Self {
        ContextdError::Other(s)
    }
}

impl From<tokio::task::JoinError> for ContextdError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            ContextdError::Cancelled
        } else {
            ContextdError::Other(err.to_string())
        }
    }
}

impl From<tokio::time::error::Elapsed> for ContextdError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ContextdError::DeadlineExceeded("operation timed out".to_string())
    }
}

impl From<ContextdError> for String {
    fn from(err: ContextdError) -> Self {
        err.to_user_string()
    }
}
