//! Shared error types for the scheduling/monitoring engine.

use uuid::Uuid;

/// Error kinds surfaced in `Execution.error_kind` (spec.md §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SsrfBlocked,
    Timeout,
    RequestError,
    IcmpError,
    TcpError,
    VariableSubstitution,
    Unknown,
}

impl ErrorKind {
    /// Transient kinds are retried per the entity's `retry_count`; permanent
    /// kinds never are (spec.md §7).
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::RequestError | ErrorKind::IcmpError | ErrorKind::TcpError
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::SsrfBlocked => "ssrf_blocked",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RequestError => "request_error",
            ErrorKind::IcmpError => "icmp_error",
            ErrorKind::TcpError => "tcp_error",
            ErrorKind::VariableSubstitution => "variable_substitution",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Errors raised by domain/kernel operations. Boundary code (loops, the HTTP
/// server) wraps these in `anyhow::Context`; library code matches on variants.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("entity not found: {0}")]
    NotFound(Uuid),

    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("variable substitution failed: {0}")]
    VariableSubstitution(String),

    #[error("invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("request rejected: {0}")]
    Rejected(String),
}

pub type Result<T> = std::result::Result<T, AppError>;
